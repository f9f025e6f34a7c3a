//! Source-side post discovery.
//!
//! `HtmlDiscovery` reads a static index page, follows every post link it
//! finds and scrapes title, date, body and image references with the CSS
//! selectors from the config. Posts are fetched lazily as the stream is
//! polled, so a cancelled run stops hitting the source site.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Selectors;
use crate::media::absolutize;
use crate::model::SourcePost;

/// A discovered item that could not be turned into a `SourcePost`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot read post {url}: {reason}")]
pub struct DiscoveryError {
    pub url: String,
    pub reason: String,
}

pub type PostStream<'a> = BoxStream<'a, Result<SourcePost, DiscoveryError>>;

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start discovering posts under `source_url`. An error here means
    /// nothing could be discovered at all.
    async fn discover<'a>(&'a self, source_url: &'a str) -> Result<PostStream<'a>>;
}

#[derive(Debug, Clone)]
struct CompiledSelectors {
    post_link: Selector,
    title: Selector,
    date: Selector,
    content: Selector,
    image: Selector,
}

impl CompiledSelectors {
    fn compile(raw: &Selectors) -> Result<Self> {
        let parse = |what: &str, s: &str| {
            Selector::parse(s).map_err(|e| anyhow::anyhow!("invalid {what} selector {s:?}: {e}"))
        };
        Ok(Self {
            post_link: parse("post_link", &raw.post_link)?,
            title: parse("title", &raw.title)?,
            date: parse("date", &raw.date)?,
            content: parse("content", &raw.content)?,
            image: parse("image", "img[src]")?,
        })
    }
}

pub struct HtmlDiscovery {
    http: Client,
    selectors: CompiledSelectors,
}

impl HtmlDiscovery {
    pub fn new(selectors: &Selectors) -> Result<Self> {
        let http = Client::builder()
            .user_agent("wp-migrate/0.1")
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            selectors: CompiledSelectors::compile(selectors)?,
        })
    }

    async fn fetch_html(&self, url: &str) -> Result<String> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .context("HTTP request failed")?;
        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status}");
        }
        res.text().await.context("failed to read response body")
    }

    async fn fetch_post(&self, url: String) -> Result<SourcePost, DiscoveryError> {
        let html = self.fetch_html(&url).await.map_err(|e| DiscoveryError {
            url: url.clone(),
            reason: format!("{e:#}"),
        })?;
        parse_post(&self.selectors, &url, &html)
    }
}

#[async_trait]
impl Discovery for HtmlDiscovery {
    async fn discover<'a>(&'a self, source_url: &'a str) -> Result<PostStream<'a>> {
        let index = self
            .fetch_html(source_url)
            .await
            .with_context(|| format!("failed to fetch index page {source_url}"))?;
        let links = extract_links(&self.selectors, source_url, &index);
        if links.is_empty() {
            warn!(source = source_url, "index page has no post links");
        } else {
            info!(source = source_url, count = links.len(), "discovered post links");
        }
        Ok(stream::iter(links)
            .then(move |url| self.fetch_post(url))
            .boxed())
    }
}

/// Absolute, de-duplicated post URLs in page order.
fn extract_links(sel: &CompiledSelectors, base: &str, html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    doc.select(&sel.post_link)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| absolutize(base, href))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn parse_post(sel: &CompiledSelectors, url: &str, html: &str) -> Result<SourcePost, DiscoveryError> {
    let doc = Html::parse_document(html);
    let fail = |reason: &str| DiscoveryError {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let title = doc
        .select(&sel.title)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| fail("no title"))?;

    let published_on = doc
        .select(&sel.date)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|d| !d.is_empty());

    // A missing body is left empty; the transform reports it as a content failure.
    let content = doc.select(&sel.content).next();
    let body = content.map(|el| el.inner_html()).unwrap_or_default();
    let media: Vec<String> = content
        .map(|el| {
            el.select(&sel.image)
                .filter_map(|img| img.value().attr("src"))
                .map(|src| src.trim().to_string())
                .filter(|src| !src.is_empty() && !src.starts_with("data:"))
                .collect()
        })
        .unwrap_or_default();

    let mut post = SourcePost::new(url, title, body).map_err(|e| fail(&e.to_string()))?;
    if let Some(date) = published_on {
        post = post.with_date(date);
    }
    debug!(source_id = %post.source_id, media = media.len(), "parsed source post");
    Ok(post.with_media(media))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selectors() -> CompiledSelectors {
        CompiledSelectors::compile(&Selectors {
            post_link: "ul.posts a".into(),
            title: "h1.title".into(),
            date: "span.date".into(),
            content: "div.body".into(),
        })
        .unwrap()
    }

    #[test]
    fn links_are_absolute_and_unique() {
        let html = r#"<html><body>
            <ul class="posts">
              <li><a href="/f/first">First</a></li>
              <li><a href="https://blog.example.com/f/second">Second</a></li>
              <li><a href="/f/first">First again</a></li>
              <li><a>No href</a></li>
            </ul>
            <a href="/about">About</a>
        </body></html>"#;
        let links = extract_links(&selectors(), "https://blog.example.com/", html);
        assert_eq!(
            links,
            vec![
                "https://blog.example.com/f/first".to_string(),
                "https://blog.example.com/f/second".to_string(),
            ]
        );
    }

    #[test]
    fn post_fields_are_scraped() {
        let html = r#"<html><body>
            <h1 class="title">  Spring
               Update </h1>
            <span class="date">March 27, 2025</span>
            <div class="body"><p>Hello</p><img src="/img/a.jpg"><img src="data:image/png;base64,AA=="></div>
        </body></html>"#;
        let post = parse_post(&selectors(), "https://blog.example.com/f/spring", html).unwrap();
        assert_eq!(post.title, "Spring Update");
        assert_eq!(post.published_on.as_deref(), Some("March 27, 2025"));
        assert!(post.raw_body.starts_with("<p>Hello</p>"));
        assert_eq!(post.media_refs, vec!["/img/a.jpg".to_string()]);
        assert_eq!(post.source_id.as_str(), "https://blog.example.com/f/spring");
    }

    #[test]
    fn missing_title_is_an_item_error() {
        let html = r#"<div class="body"><p>x</p></div>"#;
        let err = parse_post(&selectors(), "https://blog.example.com/f/x", html).unwrap_err();
        assert_eq!(err.url, "https://blog.example.com/f/x");
        assert_eq!(err.reason, "no title");
    }

    #[test]
    fn missing_body_yields_empty_post() {
        let html = r#"<h1 class="title">T</h1>"#;
        let post = parse_post(&selectors(), "https://blog.example.com/f/t", html).unwrap();
        assert!(post.raw_body.is_empty());
        assert!(post.published_on.is_none());
    }
}

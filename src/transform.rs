//! Source HTML → WordPress-ready payload.
//!
//! Everything in here is pure: the same post and the same resolved media
//! always produce byte-identical output. Attributes are emitted in sorted
//! order and no clock or randomness is consulted.

use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::media::{absolutize, MediaError, MediaHandle, MediaResolver};
use crate::model::{SourceId, SourcePost};
use crate::publisher::{PostDefaults, PostRequest, UploadedMedia};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("post body is empty")]
    Empty,
    #[error("malformed markup: {0}")]
    Malformed(String),
    #[error("media unavailable: {0}")]
    Media(#[from] MediaError),
    #[error("unrecognised publish date {0:?}")]
    Date(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub label: String,
    pub url: String,
    pub notice: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOptions {
    pub image_classes: Vec<String>,
    pub strip_selectors: Vec<String>,
    pub attribution: Option<Attribution>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            image_classes: vec!["img-fluid".into(), "mb-3".into()],
            strip_selectors: ["script", "style", "nav", "header", "footer", "aside", "form", "noscript"]
                .into_iter()
                .map(String::from)
                .collect(),
            attribution: None,
        }
    }
}

/// Media referenced by a payload, in first-reference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadMedia {
    pub placeholder: String,
    pub handle: MediaHandle,
}

/// Publish-ready content. Consumed once by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPayload {
    pub source_id: SourceId,
    pub title: String,
    /// HTML with `wp-media:` placeholders where uploaded media URLs go.
    pub content: String,
    pub date: Option<String>,
    pub media: Vec<PayloadMedia>,
    /// Placeholder of the featured image (the first media item).
    pub featured: Option<String>,
}

impl PublishPayload {
    /// Substitute uploaded media and build the destination request.
    /// `uploaded` is keyed by placeholder.
    pub fn render(
        &self,
        uploaded: &HashMap<String, UploadedMedia>,
        defaults: &PostDefaults,
    ) -> PostRequest {
        let mut content = self.content.clone();
        for item in &self.media {
            if let Some(up) = uploaded.get(&item.placeholder) {
                content = content.replace(&item.placeholder, &escape_attr(&up.url));
            }
        }
        PostRequest {
            title: self.title.clone(),
            content,
            date: self.date.clone(),
            status: defaults.status.clone(),
            author: defaults.author,
            categories: defaults.categories.clone(),
            featured_media: self
                .featured
                .as_ref()
                .and_then(|p| uploaded.get(p))
                .map(|up| up.id),
        }
    }
}

pub fn transform(
    post: &SourcePost,
    media: &dyn MediaResolver,
    opts: &TransformOptions,
) -> Result<PublishPayload, ContentError> {
    check_well_formed(&post.raw_body)?;

    let mut payload_media: Vec<PayloadMedia> = Vec::new();
    let mut placeholders: HashMap<String, String> = HashMap::new();
    for raw in &post.media_refs {
        let url = absolutize(&post.url, raw).ok_or_else(|| MediaError::InvalidUrl(raw.clone()))?;
        if placeholders.contains_key(&url) {
            continue;
        }
        let handle = media.resolve(&url)?;
        let placeholder = handle.placeholder();
        placeholders.insert(url, placeholder.clone());
        payload_media.push(PayloadMedia {
            placeholder,
            handle,
        });
    }

    let strip: Vec<Selector> = opts
        .strip_selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect();

    let doc = Html::parse_fragment(&post.raw_body);
    let root = doc.root_element();

    let mut top = None;
    for child in root.children().filter_map(ElementRef::wrap) {
        highest_heading(child, &strip, &mut top);
    }
    let ctx = EmitContext {
        base: &post.url,
        strip: &strip,
        image_class: opts.image_classes.join(" "),
        placeholders: &placeholders,
        heading_shift: top.map_or(0, |level| 2 - level as i32),
    };

    let mut body = String::with_capacity(post.raw_body.len());
    emit_children(root, &ctx, &mut body);
    let body = body.trim();
    if body.is_empty() {
        return Err(ContentError::Empty);
    }

    let mut content = format!("<div class=\"container mt-4\">\n{body}\n</div>\n");
    if let Some(attr) = &opts.attribution {
        content.push_str(&format!(
            "<div class=\"bg-info-subtle text-left p-3 rounded\">\
             <strong><a href=\"{}\" target=\"_blank\" rel=\"noopener\">{}</a></strong><br/>{}</div>\n<hr />\n",
            escape_attr(&attr.url),
            escape_text(&attr.label),
            escape_text(&attr.notice),
        ));
    }

    let date = post
        .published_on
        .as_deref()
        .map(|raw| publish_date(raw, &post.source_id))
        .transpose()?;

    Ok(PublishPayload {
        source_id: post.source_id.clone(),
        title: post.title.trim().to_string(),
        content,
        date,
        featured: payload_media.first().map(|m| m.placeholder.clone()),
        media: payload_media,
    })
}

struct EmitContext<'a> {
    base: &'a str,
    strip: &'a [Selector],
    image_class: String,
    placeholders: &'a HashMap<String, String>,
    heading_shift: i32,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements whose end tag HTML allows to be omitted.
const OPTIONAL_END: &[&str] = &[
    "p", "li", "dt", "dd", "option", "optgroup", "tr", "td", "th", "thead", "tbody", "tfoot",
    "colgroup", "rb", "rt", "rp", "html", "head", "body",
];

fn heading_level(name: &str) -> Option<u8> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn is_stripped(el: ElementRef<'_>, strip: &[Selector]) -> bool {
    strip.iter().any(|s| s.matches(&el))
}

fn highest_heading(el: ElementRef<'_>, strip: &[Selector], top: &mut Option<u8>) {
    if is_stripped(el, strip) {
        return;
    }
    if let Some(level) = heading_level(el.value().name()) {
        *top = Some(top.map_or(level, |t| t.min(level)));
    }
    for child in el.children().filter_map(ElementRef::wrap) {
        highest_heading(child, strip, top);
    }
}

fn emit_children(el: ElementRef<'_>, ctx: &EmitContext<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            emit_element(child_el, ctx, out);
        } else if let Node::Text(text) = child.value() {
            out.push_str(&escape_text(text));
        }
    }
}

fn emit_element(el: ElementRef<'_>, ctx: &EmitContext<'_>, out: &mut String) {
    if is_stripped(el, ctx.strip) {
        return;
    }
    let element = el.value();
    let name = match heading_level(element.name()) {
        Some(level) => {
            let shifted = (level as i32 + ctx.heading_shift).clamp(1, 6);
            format!("h{shifted}")
        }
        None => element.name().to_string(),
    };

    let mut attrs: BTreeMap<&str, String> = BTreeMap::new();
    for (key, value) in element.attrs() {
        if is_chrome_attr(key) {
            continue;
        }
        match key {
            "href" | "src" => {
                if let Some(v) = rewrite_link(ctx, key, value) {
                    attrs.insert(key, v);
                }
            }
            _ => {
                attrs.insert(key, value.to_string());
            }
        }
    }
    if name == "img" && !ctx.image_class.is_empty() {
        attrs.insert("class", ctx.image_class.clone());
    }

    out.push('<');
    out.push_str(&name);
    for (key, value) in &attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    out.push('>');

    if VOID_ELEMENTS.contains(&name.as_str()) {
        return;
    }
    emit_children(el, ctx, out);
    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

fn is_chrome_attr(key: &str) -> bool {
    matches!(key, "style" | "class" | "id") || key.starts_with("on") || key.starts_with("data-")
}

fn rewrite_link(ctx: &EmitContext<'_>, key: &str, value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    match absolutize(ctx.base, trimmed) {
        Some(abs) => {
            if key == "src" {
                if let Some(placeholder) = ctx.placeholders.get(&abs) {
                    return Some(placeholder.clone());
                }
            }
            Some(abs)
        }
        None => Some(trimmed.to_string()),
    }
}

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static SCRIPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").unwrap());
static STYLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(/?)([A-Za-z][A-Za-z0-9:-]*)(?:\s(?:[^>"']|"[^"]*"|'[^']*')*?)?\s*(/?)>"#).unwrap()
});

/// Reject bodies that are blank or whose tags do not balance.
pub fn check_well_formed(raw: &str) -> Result<(), ContentError> {
    if raw.trim().is_empty() {
        return Err(ContentError::Empty);
    }
    let cleaned = COMMENT.replace_all(raw, "");
    let cleaned = SCRIPT.replace_all(&cleaned, "");
    let cleaned = STYLE.replace_all(&cleaned, "");

    let mut open: Vec<String> = Vec::new();
    for cap in TAG.captures_iter(&cleaned) {
        let closing = !cap[1].is_empty();
        let self_closing = !cap[3].is_empty();
        let name = cap[2].to_ascii_lowercase();
        if VOID_ELEMENTS.contains(&name.as_str()) || (self_closing && !closing) {
            continue;
        }
        if !closing {
            open.push(name);
            continue;
        }
        let Some(pos) = open.iter().rposition(|n| *n == name) else {
            return Err(ContentError::Malformed(format!("unexpected </{name}>")));
        };
        if let Some(unclosed) = open[pos + 1..]
            .iter()
            .find(|n| !OPTIONAL_END.contains(&n.as_str()))
        {
            return Err(ContentError::Malformed(format!(
                "<{unclosed}> not closed before </{name}>"
            )));
        }
        open.truncate(pos);
    }
    if let Some(unclosed) = open.iter().find(|n| !OPTIONAL_END.contains(&n.as_str())) {
        return Err(ContentError::Malformed(format!("<{unclosed}> is never closed")));
    }
    Ok(())
}

const DATE_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y", "%Y-%m-%d", "%d %B %Y"];

/// Turn a displayed date into an ISO local timestamp. The time of day is
/// spread over 06:00–23:59 using the post identity so reruns agree.
pub fn publish_date(raw: &str, id: &SourceId) -> Result<String, ContentError> {
    let trimmed = raw.trim();
    let date = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| ContentError::Date(raw.to_string()))?;

    let digest = Sha256::digest(id.as_str().as_bytes());
    let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let window = 18 * 3600;
    let secs = 6 * 3600 + seed % window;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
        .ok_or_else(|| ContentError::Date(raw.to_string()))?;
    Ok(date.and_time(time).format("%Y-%m-%dT%H:%M:%S").to_string())
}

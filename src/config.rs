//! Configuration loader and validator for the blog → WordPress migrator.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::publisher::{Credentials, PostDefaults};
use crate::retry::RetryPolicy;
use crate::transform::{Attribution, TransformOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub source: Source,
    pub wordpress: WordPress,
    #[serde(default)]
    pub formatting: Formatting,
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    pub max_backoff_seconds: u64,
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,
}

fn default_workers() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_lock_ttl_seconds() -> u64 {
    600
}

/// Source site and the selectors used to scrape it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub url: String,
    pub selectors: Selectors,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selectors {
    /// Anchors on the index page that link to individual posts.
    pub post_link: String,
    pub title: String,
    pub date: String,
    pub content: String,
}

/// Destination site and its REST credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WordPress {
    pub site: String,
    pub username: String,
    pub app_password: String,
    #[serde(default)]
    pub author: Option<u64>,
    #[serde(default)]
    pub categories: Vec<u64>,
    #[serde(default = "default_post_status")]
    pub status: String,
}

fn default_post_status() -> String {
    "publish".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Formatting {
    #[serde(default = "default_image_classes")]
    pub image_classes: Vec<String>,
    #[serde(default = "default_strip_selectors")]
    pub strip_selectors: Vec<String>,
    #[serde(default)]
    pub attribution: Option<AttributionConfig>,
}

impl Default for Formatting {
    fn default() -> Self {
        Self {
            image_classes: default_image_classes(),
            strip_selectors: default_strip_selectors(),
            attribution: None,
        }
    }
}

fn default_image_classes() -> Vec<String> {
    vec!["img-fluid".into(), "mb-3".into()]
}

fn default_strip_selectors() -> Vec<String> {
    ["script", "style", "nav", "header", "footer", "aside", "form", "noscript"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionConfig {
    pub label: String,
    pub url: String,
    pub notice: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.media_dir())
    }

    pub fn media_dir(&self) -> std::path::PathBuf {
        Path::new(&self.app.data_dir).join("media")
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/migrated_posts.db", self.app.data_dir))
    }

    /// Credentials for the destination; `WP_APP_PASSWORD` overrides the file value.
    pub fn credentials(&self) -> Credentials {
        let password = std::env::var("WP_APP_PASSWORD")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.wordpress.app_password.clone());
        Credentials::new(self.wordpress.username.clone(), password)
    }

    pub fn post_defaults(&self) -> PostDefaults {
        PostDefaults {
            status: self.wordpress.status.clone(),
            author: self.wordpress.author,
            categories: self.wordpress.categories.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.app.max_attempts,
            Duration::from_millis(self.app.base_delay_ms),
            Duration::from_secs(self.app.max_backoff_seconds),
        )
    }

    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            image_classes: self.formatting.image_classes.clone(),
            strip_selectors: self.formatting.strip_selectors.clone(),
            attribution: self.formatting.attribution.as_ref().map(|a| Attribution {
                label: a.label.clone(),
                url: a.url.clone(),
                notice: a.notice.clone(),
            }),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }
    if cfg.app.lock_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("app.lock_ttl_seconds must be > 0"));
    }

    if !is_http_url(&cfg.source.url) {
        return Err(ConfigError::Invalid("source.url must be an http(s) URL"));
    }
    let sel = &cfg.source.selectors;
    for (value, msg) in [
        (&sel.post_link, "source.selectors.post_link must be a valid CSS selector"),
        (&sel.title, "source.selectors.title must be a valid CSS selector"),
        (&sel.date, "source.selectors.date must be a valid CSS selector"),
        (&sel.content, "source.selectors.content must be a valid CSS selector"),
    ] {
        if value.trim().is_empty() || scraper::Selector::parse(value).is_err() {
            return Err(ConfigError::Invalid(msg));
        }
    }

    if !is_http_url(&cfg.wordpress.site) {
        return Err(ConfigError::Invalid("wordpress.site must be an http(s) URL"));
    }
    if cfg.wordpress.username.trim().is_empty() {
        return Err(ConfigError::Invalid("wordpress.username must be non-empty"));
    }
    if cfg.wordpress.app_password.trim().is_empty()
        && std::env::var("WP_APP_PASSWORD").map_or(true, |p| p.trim().is_empty())
    {
        return Err(ConfigError::Invalid("wordpress.app_password must be non-empty"));
    }
    if !matches!(
        cfg.wordpress.status.as_str(),
        "publish" | "draft" | "pending" | "private"
    ) {
        return Err(ConfigError::Invalid(
            "wordpress.status must be one of publish, draft, pending, private",
        ));
    }

    if cfg
        .formatting
        .strip_selectors
        .iter()
        .any(|s| scraper::Selector::parse(s).is_err())
    {
        return Err(ConfigError::Invalid("formatting.strip_selectors contains an invalid selector"));
    }
    if let Some(attr) = &cfg.formatting.attribution {
        if !is_http_url(&attr.url) {
            return Err(ConfigError::Invalid("formatting.attribution.url must be an http(s) URL"));
        }
    }

    Ok(())
}

fn is_http_url(s: &str) -> bool {
    url::Url::parse(s.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Returns a sample configuration file.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  workers: 1
  max_attempts: 3
  base_delay_ms: 1000
  max_backoff_seconds: 30
  lock_ttl_seconds: 600

source:
  url: "https://source-blog.example.com/"
  selectors:
    post_link: "[data-ux='GridCell'] a"
    title: "h3[data-ux='BlogMainHeading']"
    date: "span[data-aid='RSS_POST_DATE']"
    content: "div[data-ux='BlogContent']"

wordpress:
  site: "https://your-wordpress-site.example.com"
  username: "your_wp_username"
  app_password: "your_app_password_here"
  author: 2
  categories:
    - 29
  status: "publish"

formatting:
  image_classes: ["img-fluid", "mb-3"]
  attribution:
    label: "Source"
    url: "https://source-blog.example.com/"
    notice: "This blog post was re-posted here with the permission of the original author."
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = sample();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.max_attempts, 3);
        assert_eq!(cfg.wordpress.categories, vec![29]);
        assert!(cfg.formatting.strip_selectors.contains(&"script".to_string()));
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"app:
  data_dir: "./d"
  max_backoff_seconds: 5
source:
  url: "https://a.example.com/"
  selectors: { post_link: "a", title: "h1", date: ".d", content: "main" }
wordpress:
  site: "https://b.example.com"
  username: "u"
  app_password: "p"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.workers, 1);
        assert_eq!(cfg.app.max_attempts, 3);
        assert_eq!(cfg.wordpress.status, "publish");
        assert_eq!(cfg.formatting, Formatting::default());
        assert_eq!(cfg.retry_policy().max_attempts(), 3);
    }

    #[test]
    fn invalid_source_url() {
        let mut cfg = sample();
        cfg.source.url = "ftp://nowhere".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("source.url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_selectors() {
        let mut cfg = sample();
        cfg.source.selectors.content = "div[".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("selectors.content")),
            _ => panic!("wrong error"),
        }

        let mut cfg = sample();
        cfg.formatting.strip_selectors.push(">>".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_wordpress_settings() {
        let mut cfg = sample();
        cfg.wordpress.username = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("username")));

        let mut cfg = sample();
        cfg.wordpress.status = "live".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("status")));

        let mut cfg = sample();
        cfg.app.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("max_attempts")));
    }

    #[test]
    fn ensure_dirs_creates_media_dir() {
        let td = tempdir().unwrap();
        let mut cfg = sample();
        cfg.app.data_dir = td.path().join("data").to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(cfg.media_dir().exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.wordpress.author, Some(2));
        let attribution = cfg.transform_options().attribution.unwrap();
        assert_eq!(attribution.label, "Source");
    }
}

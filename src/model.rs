use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Pending,
    Published,
    Failed,
    /// The destination accepted a create request but its reply could not be
    /// read. Never reclaimed automatically; an operator resolves it.
    Unconfirmed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "PENDING",
            MigrationStatus::Published => "PUBLISHED",
            MigrationStatus::Failed => "FAILED",
            MigrationStatus::Unconfirmed => "UNCONFIRMED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(MigrationStatus::Pending),
            "PUBLISHED" => Some(MigrationStatus::Published),
            "FAILED" => Some(MigrationStatus::Failed),
            "UNCONFIRMED" => Some(MigrationStatus::Unconfirmed),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why the last attempt for a post ended in `FAILED`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Content,
    Transient,
    Rejected,
    Auth,
    Discovery,
    Interrupted,
    Unconfirmed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Content => "content",
            FailureKind::Transient => "transient",
            FailureKind::Rejected => "rejected",
            FailureKind::Auth => "auth",
            FailureKind::Discovery => "discovery",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Unconfirmed => "unconfirmed",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "content" => Some(FailureKind::Content),
            "transient" => Some(FailureKind::Transient),
            "rejected" => Some(FailureKind::Rejected),
            "auth" => Some(FailureKind::Auth),
            "discovery" => Some(FailureKind::Discovery),
            "interrupted" => Some(FailureKind::Interrupted),
            "unconfirmed" => Some(FailureKind::Unconfirmed),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceIdError {
    #[error("invalid source URL {0:?}: {1}")]
    Parse(String, url::ParseError),
    #[error("unsupported URL scheme in {0:?}")]
    Scheme(String),
}

/// Canonical identity of a source post, derived from its URL.
///
/// Two URLs that only differ in letter case of the host, a trailing slash,
/// a fragment, tracking parameters or query parameter order map to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn from_url(raw: &str) -> Result<Self, SourceIdError> {
        let url = normalize_url(raw)?;
        Ok(SourceId(canonical_form(url)))
    }

    /// Wraps an id read back from storage; no canonicalization is applied.
    pub fn from_stored(id: String) -> Self {
        SourceId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Parse an http(s) URL, accepting protocol-relative `//host/path` forms.
pub fn normalize_url(raw: &str) -> Result<Url, SourceIdError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.starts_with("//") {
        format!("https:{trimmed}")
    } else {
        trimmed.to_string()
    };
    let url = Url::parse(&candidate).map_err(|e| SourceIdError::Parse(raw.to_string(), e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(SourceIdError::Scheme(raw.to_string())),
    }
}

fn canonical_form(mut url: Url) -> String {
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url.to_string()
}

/// A candidate post produced by discovery. Lives for one run only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePost {
    pub source_id: SourceId,
    pub url: String,
    pub title: String,
    pub raw_body: String,
    pub published_on: Option<String>,
    pub media_refs: Vec<String>,
}

impl SourcePost {
    pub fn new(
        url: &str,
        title: impl Into<String>,
        raw_body: impl Into<String>,
    ) -> Result<Self, SourceIdError> {
        Ok(Self {
            source_id: SourceId::from_url(url)?,
            url: url.trim().to_string(),
            title: title.into(),
            raw_body: raw_body.into(),
            published_on: None,
            media_refs: Vec::new(),
        })
    }

    pub fn with_date(mut self, published_on: impl Into<String>) -> Self {
        self.published_on = Some(published_on.into());
        self
    }

    pub fn with_media(mut self, refs: impl IntoIterator<Item = String>) -> Self {
        self.media_refs.extend(refs);
        self
    }
}

/// Persisted disposition of one source post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub source_id: SourceId,
    pub status: MigrationStatus,
    pub destination_id: Option<String>,
    pub attempt_count: i64,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub failure_kind: Option<FailureKind>,
    pub failure_reason: Option<String>,
}

impl MigrationRecord {
    pub fn is_published(&self) -> bool {
        self.status == MigrationStatus::Published
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_ignores_cosmetic_differences() {
        let a = SourceId::from_url("https://Blog.Example.com/f/movie-review/").unwrap();
        let b = SourceId::from_url("https://blog.example.com/f/movie-review#comments").unwrap();
        let c = SourceId::from_url("https://blog.example.com:443/f/movie-review?utm_source=x").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.as_str(), "https://blog.example.com/f/movie-review");
    }

    #[test]
    fn source_id_sorts_query_and_keeps_root_slash() {
        let a = SourceId::from_url("https://example.com/?b=2&a=1").unwrap();
        let b = SourceId::from_url("https://example.com/?a=1&b=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com/?a=1&b=2");
    }

    #[test]
    fn source_id_accepts_protocol_relative() {
        let id = SourceId::from_url("//example.com/post").unwrap();
        assert_eq!(id.as_str(), "https://example.com/post");
    }

    #[test]
    fn source_id_rejects_non_http() {
        assert!(matches!(
            SourceId::from_url("ftp://example.com/x"),
            Err(SourceIdError::Scheme(_))
        ));
        assert!(matches!(
            SourceId::from_url("not a url"),
            Err(SourceIdError::Parse(_, _))
        ));
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            MigrationStatus::Pending,
            MigrationStatus::Published,
            MigrationStatus::Failed,
            MigrationStatus::Unconfirmed,
        ] {
            assert_eq!(MigrationStatus::parse_status(s.as_str()), Some(s));
        }
        assert_eq!(MigrationStatus::parse_status("OPEN"), None);
    }
}

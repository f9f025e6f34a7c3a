//! Media download and the resolver view handed to the transform stage.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use url::Url;

use crate::model::normalize_url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("invalid media URL {0:?}")]
    InvalidUrl(String),
    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("failed to store {url}: {reason}")]
    Store { url: String, reason: String },
    #[error("media {0} was not resolved")]
    Unresolved(String),
}

/// A downloaded media file ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub source_url: String,
    pub local_path: PathBuf,
    pub file_name: String,
    pub content_type: String,
    /// Hex SHA-256 of the file bytes.
    pub sha256: String,
}

impl MediaHandle {
    /// Stable token that stands in for the destination URL until upload.
    pub fn placeholder(&self) -> String {
        format!("wp-media:{}", &self.sha256[..self.sha256.len().min(16)])
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<MediaHandle, MediaError>;

    /// Drop the local copies once the post they were fetched for is settled.
    async fn discard(&self, _media: &ResolvedMedia) {}
}

/// Synchronous lookup used by `transform`; media must already be fetched.
pub trait MediaResolver {
    fn resolve(&self, url: &str) -> Result<MediaHandle, MediaError>;
}

/// Media fetched for one post, keyed by absolute source URL.
#[derive(Debug, Clone, Default)]
pub struct ResolvedMedia {
    by_url: HashMap<String, MediaHandle>,
}

impl ResolvedMedia {
    pub fn insert(&mut self, handle: MediaHandle) {
        self.by_url.insert(handle.source_url.clone(), handle);
    }

    pub fn handles(&self) -> impl Iterator<Item = &MediaHandle> {
        self.by_url.values()
    }
}

impl MediaResolver for ResolvedMedia {
    fn resolve(&self, url: &str) -> Result<MediaHandle, MediaError> {
        self.by_url
            .get(url)
            .cloned()
            .ok_or_else(|| MediaError::Unresolved(url.to_string()))
    }
}

/// Fetch every referenced media item, resolving relative refs against `base`.
/// The first failure aborts and discards what was already fetched; a post
/// with missing media is not published.
pub async fn prefetch(
    fetcher: &dyn MediaFetcher,
    base: &str,
    refs: &[String],
) -> Result<ResolvedMedia, MediaError> {
    let mut resolved = ResolvedMedia::default();
    for raw in refs {
        let url = absolutize(base, raw).ok_or_else(|| MediaError::InvalidUrl(raw.clone()))?;
        if resolved.by_url.contains_key(&url) {
            continue;
        }
        let mut handle = match fetcher.fetch(&url).await {
            Ok(handle) => handle,
            Err(err) => {
                fetcher.discard(&resolved).await;
                return Err(err);
            }
        };
        handle.source_url = url;
        resolved.insert(handle);
    }
    Ok(resolved)
}

/// Resolve `href` against `base`, returning an absolute http(s) URL.
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if let Ok(url) = normalize_url(href) {
        return Some(url.to_string());
    }
    let base = normalize_url(base).ok()?;
    let joined = base.join(href).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

/// ASCII-only file name suitable for a `Content-Disposition` header.
pub fn safe_filename(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches(|c| c == '_' || c == '.');
    if cleaned.is_empty() {
        "media".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn content_type_for(file_name: &str) -> &'static str {
    match Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "svg" => "image/svg+xml",
        Some(ext) if ext == "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Downloads media over HTTP into a local directory.
#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    http: Client,
    dir: PathBuf,
}

impl HttpMediaFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("wp-migrate/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            dir: dir.into(),
        })
    }

    /// Remove everything fetched so far.
    pub async fn clear(&self) -> std::io::Result<()> {
        if fs::metadata(&self.dir).await.is_ok() {
            fs::remove_dir_all(&self.dir).await?;
            info!(dir = %self.dir.display(), "removed media directory");
        }
        Ok(())
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<MediaHandle, MediaError> {
        let parsed = Url::parse(url).map_err(|_| MediaError::InvalidUrl(url.to_string()))?;
        let download_err = |reason: String| MediaError::Download {
            url: url.to_string(),
            reason,
        };

        let res = self
            .http
            .get(parsed.clone())
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;
        if !res.status().is_success() {
            return Err(download_err(format!("HTTP {}", res.status())));
        }
        let bytes = res.bytes().await.map_err(|e| download_err(e.to_string()))?;

        let sha256 = sha256_hex(&bytes);
        let base_name = parsed
            .path_segments()
            .and_then(|mut segs| segs.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("media");
        let file_name = safe_filename(base_name);
        // Unique per fetch: two workers may hold the same media at once.
        let local_path = self
            .dir
            .join(format!("{}-{}", uuid::Uuid::new_v4().simple(), file_name));

        let store_err = |e: std::io::Error| MediaError::Store {
            url: url.to_string(),
            reason: e.to_string(),
        };
        fs::create_dir_all(&self.dir).await.map_err(store_err)?;
        fs::write(&local_path, &bytes).await.map_err(store_err)?;
        debug!(url, path = %local_path.display(), size = bytes.len(), "media downloaded");

        Ok(MediaHandle {
            source_url: url.to_string(),
            content_type: content_type_for(&file_name).to_string(),
            file_name,
            local_path,
            sha256,
        })
    }

    async fn discard(&self, media: &ResolvedMedia) {
        for handle in media.handles() {
            match fs::remove_file(&handle.local_path).await {
                Ok(()) => debug!(path = %handle.local_path.display(), "media removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(?err, path = %handle.local_path.display(), "failed to remove media"),
            }
        }
    }
}

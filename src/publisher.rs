//! Destination-facing side of the pipeline.
//!
//! `DestinationClient` is the seam to the WordPress REST API (or a test
//! double); `Publisher` wraps it and turns raw client failures into the
//! `Transient` / `Rejected` / `AuthFailure` / `Unconfirmed` classes the
//! migrator acts on.
//! Nothing here reads or writes migration state.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::media::MediaHandle;
use crate::model::FailureKind;

/// Basic-auth credentials for the destination, loaded once per run.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Body of `POST /wp-json/wp/v2/posts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostRequest {
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured_media: Option<u64>,
}

/// Per-site fields applied to every created post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDefaults {
    pub status: String,
    pub author: Option<u64>,
    pub categories: Vec<u64>,
}

impl Default for PostDefaults {
    fn default() -> Self {
        Self {
            status: "publish".into(),
            author: None,
            categories: Vec::new(),
        }
    }
}

/// Media item as stored on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub id: u64,
    pub url: String,
}

/// Unclassified failure reported by a destination client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFailure {
    Timeout(String),
    Connection(String),
    Status { status: u16, body: String },
    /// The request could not be built; nothing reached the destination.
    Request(String),
    /// Success status but a reply we could not read. The destination may
    /// have created the resource.
    Unconfirmed(String),
}

impl fmt::Display for ClientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientFailure::Timeout(msg) => write!(f, "timeout: {msg}"),
            ClientFailure::Connection(msg) => write!(f, "connection error: {msg}"),
            ClientFailure::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            ClientFailure::Request(msg) => write!(f, "invalid request: {msg}"),
            ClientFailure::Unconfirmed(msg) => write!(f, "unreadable success reply: {msg}"),
        }
    }
}

#[async_trait]
pub trait DestinationClient: Send + Sync {
    async fn create_post(
        &self,
        creds: &Credentials,
        post: &PostRequest,
    ) -> Result<String, ClientFailure>;

    async fn upload_media(
        &self,
        creds: &Credentials,
        media: &MediaHandle,
    ) -> Result<UploadedMedia, ClientFailure>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("transient destination failure: {0}")]
    Transient(String),
    #[error("destination rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("destination refused credentials (HTTP {status}): {message}")]
    AuthFailure { status: u16, message: String },
    /// Accepted but unconfirmed; retrying could create a duplicate.
    #[error("destination accepted the request but its reply was unreadable: {0}")]
    Unconfirmed(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PublishError::Transient(_) => FailureKind::Transient,
            PublishError::Rejected { .. } => FailureKind::Rejected,
            PublishError::AuthFailure { .. } => FailureKind::Auth,
            PublishError::Unconfirmed(_) => FailureKind::Unconfirmed,
        }
    }
}

const MAX_MESSAGE_LEN: usize = 500;

pub fn classify(failure: ClientFailure) -> PublishError {
    match failure {
        ClientFailure::Timeout(_) | ClientFailure::Connection(_) => {
            PublishError::Transient(failure.to_string())
        }
        ClientFailure::Status { status, body } => {
            let message = truncate(&body);
            match status {
                401 | 403 => PublishError::AuthFailure { status, message },
                408 | 429 => PublishError::Transient(format!("HTTP {status}: {message}")),
                s if s >= 500 => PublishError::Transient(format!("HTTP {status}: {message}")),
                _ => PublishError::Rejected { status, message },
            }
        }
        ClientFailure::Request(msg) => PublishError::Rejected {
            status: 0,
            message: truncate(&msg),
        },
        ClientFailure::Unconfirmed(msg) => PublishError::Unconfirmed(truncate(&msg)),
    }
}

fn truncate(s: &str) -> String {
    let s = s.trim();
    match s.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[derive(Clone)]
pub struct Publisher {
    client: Arc<dyn DestinationClient>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(client: Arc<dyn DestinationClient>) -> Self {
        Self { client }
    }

    /// Create the post; returns the destination post id.
    pub async fn publish(
        &self,
        post: &PostRequest,
        creds: &Credentials,
    ) -> Result<String, PublishError> {
        let id = self.client.create_post(creds, post).await.map_err(classify)?;
        info!(title = %post.title, destination_id = %id, "post created on destination");
        Ok(id)
    }

    pub async fn upload_media(
        &self,
        media: &MediaHandle,
        creds: &Credentials,
    ) -> Result<UploadedMedia, PublishError> {
        let uploaded = self
            .client
            .upload_media(creds, media)
            .await
            .map_err(classify)?;
        debug!(source = %media.source_url, media_id = uploaded.id, "media uploaded");
        Ok(uploaded)
    }
}

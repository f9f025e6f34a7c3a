//! The migration run: discovery stream in, durable per-post outcomes out.
//!
//! Each post goes lookup → claim → media fetch → transform → media upload →
//! publish → complete/fail. The state store is consulted before any
//! destination write and updated after each one, so repeating a run never
//! creates a second copy of a published post.

use futures::future;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{Claim, StateStore, StoreError};
use crate::discovery::DiscoveryError;
use crate::media::{self, MediaFetcher, ResolvedMedia};
use crate::model::{FailureKind, MigrationStatus, SourceId, SourcePost};
use crate::publisher::{Credentials, PostDefaults, PublishError, Publisher, UploadedMedia};
use crate::retry::RetryPolicy;
use crate::transform::{self, PublishPayload, TransformOptions};

/// Errors that stop the whole run. Per-post failures never surface here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("aborting run at {source_id}: {error}")]
    Auth { source_id: String, error: PublishError },
    #[error("aborting run: {source_id} may already exist on the destination ({reason})")]
    Unconfirmed { source_id: String, reason: String },
}

impl RunError {
    /// The post that triggered the abort, as it should appear in the summary.
    pub fn failed_post(&self) -> Option<FailedPost> {
        match self {
            RunError::Store(_) => None,
            RunError::Auth { source_id, error } => Some(FailedPost {
                source_id: source_id.clone(),
                kind: FailureKind::Auth,
                reason: error.to_string(),
            }),
            RunError::Unconfirmed { source_id, reason } => Some(FailedPost {
                source_id: source_id.clone(),
                kind: FailureKind::Unconfirmed,
                reason: reason.clone(),
            }),
        }
    }
}

/// A run that stopped early, with everything it settled before stopping.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunAborted {
    pub error: RunError,
    pub summary: Box<RunSummary>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub lock_ttl: Duration,
    pub transform: TransformOptions,
    pub defaults: PostDefaults,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            retry: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(600),
            transform: TransformOptions::default(),
            defaults: PostDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyMigrated,
    InProgress,
    /// Waiting on an operator to confirm whether the destination has it.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedPost {
    pub source_id: String,
    pub destination_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPost {
    pub source_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPost {
    pub source_id: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    /// `PENDING` records left by an earlier run and turned into failures.
    pub recovered: u64,
    pub published: Vec<PublishedPost>,
    pub skipped: Vec<SkippedPost>,
    pub failed: Vec<FailedPost>,
    pub cancelled: bool,
    /// Why the run stopped before the source was exhausted.
    pub aborted: Option<String>,
}

impl RunSummary {
    fn record(&mut self, source_id: String, outcome: Outcome) {
        match outcome {
            Outcome::Published(destination_id) => self.published.push(PublishedPost {
                source_id,
                destination_id,
            }),
            Outcome::Skipped(reason) => self.skipped.push(SkippedPost { source_id, reason }),
            Outcome::Failed { kind, reason } => self.failed.push(FailedPost {
                source_id,
                kind,
                reason,
            }),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {}", self.run_id)?;
        writeln!(f, "  published: {}", self.published.len())?;
        writeln!(f, "  skipped:   {}", self.skipped.len())?;
        writeln!(f, "  failed:    {}", self.failed.len())?;
        if self.recovered > 0 {
            writeln!(f, "  recovered: {}", self.recovered)?;
        }
        if self.cancelled {
            writeln!(f, "  (cancelled before the source was exhausted)")?;
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "  ABORTED: {reason}")?;
        }
        for p in &self.failed {
            writeln!(f, "  FAILED {:<12} {}  {}", p.kind, p.source_id, p.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Published(String),
    Skipped(SkipReason),
    Failed { kind: FailureKind, reason: String },
}

pub struct Migrator {
    store: StateStore,
    fetcher: Arc<dyn MediaFetcher>,
    publisher: Publisher,
    creds: Credentials,
    opts: RunOptions,
    cancel: CancellationToken,
    run_id: String,
}

impl Migrator {
    pub fn new(
        store: StateStore,
        fetcher: Arc<dyn MediaFetcher>,
        publisher: Publisher,
        creds: Credentials,
        opts: RunOptions,
    ) -> Self {
        Self {
            store,
            fetcher,
            publisher,
            creds,
            opts,
            cancel: CancellationToken::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Migrate everything the stream yields. Holds the run lock for the
    /// duration and releases it on every exit path. An abort still hands
    /// back the outcomes recorded before it.
    pub async fn run<S>(&self, posts: S) -> Result<RunSummary, RunAborted>
    where
        S: Stream<Item = Result<SourcePost, DiscoveryError>>,
    {
        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            ..RunSummary::default()
        };
        let result = match self
            .store
            .acquire_run_lock(&self.run_id, self.opts.lock_ttl)
            .await
        {
            Ok(()) => {
                let result = self.run_locked(posts, &mut summary).await;
                if let Err(err) = self.store.release_run_lock(&self.run_id).await {
                    warn!(?err, run_id = %self.run_id, "failed to release migration lock");
                }
                result
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(()) => {
                info!(
                    run_id = %self.run_id,
                    published = summary.published.len(),
                    skipped = summary.skipped.len(),
                    failed = summary.failed.len(),
                    cancelled = summary.cancelled,
                    "migration run finished"
                );
                Ok(summary)
            }
            Err(error) => {
                error!(
                    run_id = %self.run_id,
                    %error,
                    published = summary.published.len(),
                    failed = summary.failed.len(),
                    "migration run aborted"
                );
                summary.aborted = Some(error.to_string());
                Err(RunAborted {
                    error,
                    summary: Box::new(summary),
                })
            }
        }
    }

    async fn run_locked<S>(&self, posts: S, summary: &mut RunSummary) -> Result<(), RunError>
    where
        S: Stream<Item = Result<SourcePost, DiscoveryError>>,
    {
        summary.recovered = self.store.recover_interrupted().await?;

        let aborted = AtomicBool::new(false);
        let mut abort: Option<RunError> = None;
        let results = posts
            .take_while(|_| {
                future::ready(!self.cancel.is_cancelled() && !aborted.load(Ordering::SeqCst))
            })
            .map(|item| self.process_item(item))
            .buffer_unordered(self.opts.workers.max(1));
        futures::pin_mut!(results);

        let mut refresh = tokio::time::interval((self.opts.lock_ttl / 3).max(Duration::from_secs(1)));
        refresh.tick().await;

        loop {
            tokio::select! {
                next = results.next() => {
                    let Some((source_id, outcome)) = next else { break };
                    match outcome {
                        Ok(outcome) => summary.record(source_id, outcome),
                        Err(err) => {
                            aborted.store(true, Ordering::SeqCst);
                            if let Some(post) = err.failed_post() {
                                summary.failed.push(post);
                            }
                            abort.get_or_insert(err);
                        }
                    }
                }
                _ = refresh.tick() => {
                    if let Err(err) = self.store.refresh_run_lock(&self.run_id, self.opts.lock_ttl).await {
                        aborted.store(true, Ordering::SeqCst);
                        abort.get_or_insert(err.into());
                    }
                }
            }
        }

        if let Some(err) = abort {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            warn!("run cancelled; remaining posts left for the next run");
            summary.cancelled = true;
        }
        Ok(())
    }

    async fn process_item(
        &self,
        item: Result<SourcePost, DiscoveryError>,
    ) -> (String, Result<Outcome, RunError>) {
        match item {
            Ok(post) => {
                let id = post.source_id.to_string();
                (id, self.migrate_post(post).await)
            }
            Err(err) => self.record_discovery_failure(err).await,
        }
    }

    async fn record_discovery_failure(
        &self,
        err: DiscoveryError,
    ) -> (String, Result<Outcome, RunError>) {
        warn!(url = %err.url, reason = %err.reason, "discovery failed for item");
        let failed = Outcome::Failed {
            kind: FailureKind::Discovery,
            reason: err.reason.clone(),
        };
        let Ok(id) = SourceId::from_url(&err.url) else {
            return (err.url, Ok(failed));
        };
        let outcome = match self.store.begin_attempt(&id).await {
            Ok(Claim::Acquired(_)) => {
                self.store.fail(&id, FailureKind::Discovery, &err.reason).await;
                Ok(failed)
            }
            Ok(Claim::AlreadyPublished(_)) => Ok(Outcome::Skipped(SkipReason::AlreadyMigrated)),
            Ok(Claim::InProgress(_)) => Ok(Outcome::Skipped(SkipReason::InProgress)),
            Ok(Claim::Unconfirmed(_)) => Ok(Outcome::Skipped(SkipReason::Unconfirmed)),
            Err(e) => Err(e.into()),
        };
        (id.to_string(), outcome)
    }

    #[instrument(skip_all, fields(source_id = %post.source_id))]
    async fn migrate_post(&self, post: SourcePost) -> Result<Outcome, RunError> {
        let id = post.source_id.clone();

        if let Some(record) = self.store.lookup(&id).await? {
            if record.is_published() {
                debug!(destination_id = ?record.destination_id, "already migrated");
                return Ok(Outcome::Skipped(SkipReason::AlreadyMigrated));
            }
            if record.status == MigrationStatus::Unconfirmed {
                warn!("destination may already hold this post; resolve it before it is retried");
                return Ok(Outcome::Skipped(SkipReason::Unconfirmed));
            }
        }

        match self.store.begin_attempt(&id).await? {
            Claim::Acquired(record) => {
                debug!(attempt_count = record.attempt_count, "claimed post");
            }
            Claim::AlreadyPublished(_) => return Ok(Outcome::Skipped(SkipReason::AlreadyMigrated)),
            Claim::InProgress(_) => {
                info!("another worker holds this post; skipping");
                return Ok(Outcome::Skipped(SkipReason::InProgress));
            }
            Claim::Unconfirmed(_) => return Ok(Outcome::Skipped(SkipReason::Unconfirmed)),
        }

        let resolved = match media::prefetch(self.fetcher.as_ref(), &post.url, &post.media_refs).await {
            Ok(resolved) => resolved,
            Err(err) => return Ok(self.fail(&id, FailureKind::Content, err.to_string()).await),
        };
        let outcome = self.publish_claimed(&post, &resolved).await;
        self.fetcher.discard(&resolved).await;
        outcome
    }

    /// Everything after media fetch for a post this worker has claimed.
    async fn publish_claimed(
        &self,
        post: &SourcePost,
        resolved: &ResolvedMedia,
    ) -> Result<Outcome, RunError> {
        let id = post.source_id.clone();
        let payload = match transform::transform(post, resolved, &self.opts.transform) {
            Ok(payload) => payload,
            Err(err) => return Ok(self.fail(&id, FailureKind::Content, err.to_string()).await),
        };

        let uploaded = match self.upload_media(&payload).await? {
            Ok(uploaded) => uploaded,
            Err(err) => return self.publish_failed(&id, err).await,
        };

        let request = payload.render(&uploaded, &self.opts.defaults);
        let published = self
            .opts
            .retry
            .run("publish post", |attempt| {
                let request = &request;
                let id = &id;
                async move {
                    if let Err(err) = self.store.record_attempt(id).await {
                        return Ok(Err(err));
                    }
                    debug!(attempt, "publishing");
                    self.publisher.publish(request, &self.creds).await.map(Ok)
                }
            })
            .await;

        match published {
            Ok(Ok(destination_id)) => {
                if let Err(err) = self.store.complete(&id, &destination_id).await {
                    error!(%destination_id, %err, "post was created but its record could not be completed");
                    return Err(err.into());
                }
                info!(%destination_id, "migrated");
                Ok(Outcome::Published(destination_id))
            }
            Ok(Err(store_err)) => Err(store_err.into()),
            Err(err) => self.publish_failed(&id, err).await,
        }
    }

    /// Upload every payload media item not already on the destination.
    /// The outer error aborts the run; the inner one fails this post.
    async fn upload_media(
        &self,
        payload: &PublishPayload,
    ) -> Result<Result<HashMap<String, UploadedMedia>, PublishError>, RunError> {
        let mut uploaded = HashMap::new();
        for item in &payload.media {
            if let Some(existing) = self.store.uploaded_media(&item.handle).await? {
                debug!(source = %item.handle.source_url, media_id = existing.id, "media already uploaded");
                uploaded.insert(item.placeholder.clone(), existing);
                continue;
            }
            let result = self
                .opts
                .retry
                .run("upload media", |_| self.publisher.upload_media(&item.handle, &self.creds))
                .await;
            match result {
                Ok(media) => {
                    self.store.record_media_upload(&item.handle, &media).await?;
                    uploaded.insert(item.placeholder.clone(), media);
                }
                // A stray media item is harmless; fail the post and let the
                // next run upload again.
                Err(PublishError::Unconfirmed(reason)) => {
                    let message = format!(
                        "media upload for {} unconfirmed: {reason}",
                        item.handle.source_url
                    );
                    return Ok(Err(PublishError::Rejected { status: 0, message }));
                }
                Err(err) => return Ok(Err(err)),
            }
        }
        Ok(Ok(uploaded))
    }

    async fn publish_failed(&self, id: &SourceId, err: PublishError) -> Result<Outcome, RunError> {
        match err {
            PublishError::Unconfirmed(reason) => {
                error!(source_id = %id, %reason, "post may have been created; holding it as unconfirmed");
                self.store.mark_unconfirmed(id, &reason).await?;
                Err(RunError::Unconfirmed {
                    source_id: id.to_string(),
                    reason,
                })
            }
            PublishError::AuthFailure { .. } => {
                self.fail(id, err.failure_kind(), err.to_string()).await;
                Err(RunError::Auth {
                    source_id: id.to_string(),
                    error: err,
                })
            }
            _ => Ok(self.fail(id, err.failure_kind(), err.to_string()).await),
        }
    }

    async fn fail(&self, id: &SourceId, kind: FailureKind, reason: String) -> Outcome {
        warn!(source_id = %id, %kind, %reason, "post failed");
        self.store.fail(id, kind, &reason).await;
        Outcome::Failed { kind, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_table_lists_failures() {
        let mut summary = RunSummary {
            run_id: "r1".into(),
            ..RunSummary::default()
        };
        summary.record("a".into(), Outcome::Published("10".into()));
        summary.record("b".into(), Outcome::Skipped(SkipReason::AlreadyMigrated));
        summary.record(
            "c".into(),
            Outcome::Failed {
                kind: FailureKind::Content,
                reason: "post body is empty".into(),
            },
        );
        let text = summary.to_string();
        assert!(text.contains("published: 1"));
        assert!(text.contains("skipped:   1"));
        assert!(text.contains("FAILED content"));
        assert!(text.contains("post body is empty"));
        assert!(!text.contains("cancelled"));
    }

    #[test]
    fn aborting_post_is_reported_with_the_reason() {
        let err = RunError::Unconfirmed {
            source_id: "https://blog.example.com/f/x".into(),
            reason: "missing field `id`".into(),
        };
        let post = err.failed_post().unwrap();
        assert_eq!(post.kind, FailureKind::Unconfirmed);
        assert!(RunError::Store(StoreError::Corrupt("x".into()))
            .failed_post()
            .is_none());

        let summary = RunSummary {
            run_id: "r2".into(),
            failed: vec![post],
            aborted: Some(err.to_string()),
            ..RunSummary::default()
        };
        let text = summary.to_string();
        assert!(text.contains("FAILED unconfirmed"));
        assert!(text.contains("ABORTED: aborting run: https://blog.example.com/f/x may already exist"));
    }

    #[test]
    fn summary_serializes_for_json_output() {
        let mut summary = RunSummary::default();
        summary.record(
            "https://blog.example.com/f/x".into(),
            Outcome::Failed {
                kind: FailureKind::Transient,
                reason: "HTTP 503".into(),
            },
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["failed"][0]["kind"], "transient");
        assert_eq!(json["skipped"].as_array().map(|a| a.len()), Some(0));
    }
}

//! Durable migration state.
//!
//! - `model`: result types handed back to callers.
//! - `repo`: SQL-only functions over the SQLite pool.
//!
//! `StateStore` is the only writer of migration records. Every method
//! commits before returning, so a crash never loses a transition the
//! caller has already acted on.

pub mod model;
pub mod repo;

use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub use model::{Claim, RecordCounts, RecordFilter};
pub use repo::Pool;

use crate::media::MediaHandle;
use crate::model::{FailureKind, MigrationRecord, MigrationStatus, SourceId};
use crate::publisher::UploadedMedia;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("another run ({holder}) holds the migration lock")]
    RunLocked { holder: String },
    #[error("corrupt state: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct StateStore {
    pool: Pool,
}

impl StateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = repo::init_pool(database_url).await?;
        repo::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn lookup(&self, id: &SourceId) -> Result<Option<MigrationRecord>, StoreError> {
        repo::fetch_record(&self.pool, id).await
    }

    pub async fn begin_attempt(&self, id: &SourceId) -> Result<Claim, StoreError> {
        if let Some(record) = repo::claim_record(&self.pool, id, Utc::now()).await? {
            return Ok(Claim::Acquired(record));
        }
        let record = repo::fetch_record(&self.pool, id).await?.ok_or_else(|| {
            StoreError::Corrupt(format!("claim for {id} matched no record"))
        })?;
        match record.status {
            MigrationStatus::Published => Ok(Claim::AlreadyPublished(record)),
            MigrationStatus::Pending => Ok(Claim::InProgress(record)),
            MigrationStatus::Unconfirmed => Ok(Claim::Unconfirmed(record)),
            // The record was failed between our upsert and the read; the
            // next run will pick it up.
            MigrationStatus::Failed => Ok(Claim::InProgress(record)),
        }
    }

    /// Count one call to the destination for a claimed post.
    pub async fn record_attempt(&self, id: &SourceId) -> Result<(), StoreError> {
        if repo::bump_attempt(&self.pool, id, Utc::now()).await? == 0 {
            return Err(StoreError::InvariantViolation(format!(
                "attempt recorded for {id} which is not PENDING"
            )));
        }
        Ok(())
    }

    pub async fn complete(&self, id: &SourceId, destination_id: &str) -> Result<(), StoreError> {
        if repo::mark_published(&self.pool, id, destination_id).await? == 1 {
            return Ok(());
        }
        let current = repo::fetch_record(&self.pool, id)
            .await?
            .map(|r| r.status.to_string())
            .unwrap_or_else(|| "absent".into());
        Err(StoreError::InvariantViolation(format!(
            "complete({id}, {destination_id}) while record is {current}"
        )))
    }

    /// Record a failed attempt. Storage errors are logged, not returned: the
    /// record then stays `PENDING` and the next run recovers it as failed.
    pub async fn fail(&self, id: &SourceId, kind: FailureKind, reason: &str) {
        match repo::mark_failed(&self.pool, id, kind, reason, Utc::now()).await {
            Ok(0) => warn!(source_id = %id, %kind, "fail() ignored for published or unconfirmed record"),
            Ok(_) => {}
            Err(err) => error!(?err, source_id = %id, %kind, reason, "failed to record failure"),
        }
    }

    /// Park a claimed post whose create request got a success status but an
    /// unreadable reply. Only `resolve_unconfirmed` moves it again.
    pub async fn mark_unconfirmed(&self, id: &SourceId, reason: &str) -> Result<(), StoreError> {
        if repo::mark_unconfirmed(&self.pool, id, reason, Utc::now()).await? == 0 {
            return Err(StoreError::InvariantViolation(format!(
                "mark_unconfirmed({id}) while record is not PENDING"
            )));
        }
        Ok(())
    }

    /// `Some(destination_id)` records the post found on the destination;
    /// `None` releases the record for another attempt.
    pub async fn resolve_unconfirmed(
        &self,
        id: &SourceId,
        destination_id: Option<&str>,
    ) -> Result<(), StoreError> {
        if repo::resolve_unconfirmed(&self.pool, id, destination_id).await? == 0 {
            return Err(StoreError::InvariantViolation(format!(
                "{id} is not awaiting confirmation"
            )));
        }
        info!(source_id = %id, ?destination_id, "unconfirmed record resolved");
        Ok(())
    }

    /// Turn attempts left `PENDING` by an interrupted run into retryable failures.
    /// Only safe while holding the run lock.
    pub async fn recover_interrupted(&self) -> Result<u64, StoreError> {
        let n = repo::fail_all_pending(&self.pool, "attempt interrupted before completion", Utc::now())
            .await?;
        if n > 0 {
            warn!(count = n, "recovered interrupted attempts as failed");
        }
        Ok(n)
    }

    pub async fn acquire_run_lock(&self, run_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        let expires = now + ttl.as_millis() as i64;
        if repo::try_lock(&self.pool, run_id, now, expires).await? {
            info!(run_id, "acquired migration lock");
            return Ok(());
        }
        let holder = repo::lock_holder(&self.pool)
            .await?
            .map(|(id, _)| id)
            .unwrap_or_else(|| "unknown".into());
        Err(StoreError::RunLocked { holder })
    }

    pub async fn refresh_run_lock(&self, run_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        if repo::extend_lock(&self.pool, run_id, expires).await? == 0 {
            let holder = repo::lock_holder(&self.pool)
                .await?
                .map(|(id, _)| id)
                .unwrap_or_else(|| "nobody".into());
            return Err(StoreError::RunLocked { holder });
        }
        Ok(())
    }

    pub async fn release_run_lock(&self, run_id: &str) -> Result<(), StoreError> {
        repo::unlock(&self.pool, Some(run_id)).await?;
        Ok(())
    }

    /// Remove a lock left behind by a crashed run.
    pub async fn break_run_lock(&self) -> Result<bool, StoreError> {
        Ok(repo::unlock(&self.pool, None).await? > 0)
    }

    /// Previously uploaded copy of this media, by source URL or content hash.
    pub async fn uploaded_media(&self, media: &MediaHandle) -> Result<Option<UploadedMedia>, StoreError> {
        if let Some(found) = repo::media_by_url(&self.pool, &media.source_url).await? {
            return Ok(Some(found));
        }
        repo::media_by_hash(&self.pool, &media.sha256).await
    }

    pub async fn record_media_upload(
        &self,
        media: &MediaHandle,
        uploaded: &UploadedMedia,
    ) -> Result<(), StoreError> {
        repo::insert_media(&self.pool, &media.source_url, &media.sha256, uploaded).await
    }

    pub async fn list_records(&self, filter: RecordFilter) -> Result<Vec<MigrationRecord>, StoreError> {
        repo::list_records(&self.pool, filter).await
    }

    pub async fn counts(&self) -> Result<RecordCounts, StoreError> {
        repo::count_by_status(&self.pool).await
    }

    /// Forget every record and media upload. Destination posts are untouched.
    pub async fn reset(&self) -> Result<u64, StoreError> {
        let n = repo::delete_all(&self.pool).await?;
        info!(deleted = n, "migration state reset");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn store() -> StateStore {
        StateStore::open("sqlite::memory:").await.unwrap()
    }

    fn id(n: u32) -> SourceId {
        SourceId::from_url(&format!("https://blog.example.com/f/post-{n}")).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_pending_published() {
        let store = store().await;
        let a = id(1);
        assert!(store.lookup(&a).await.unwrap().is_none());

        let Claim::Acquired(rec) = store.begin_attempt(&a).await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(rec.status, MigrationStatus::Pending);
        assert_eq!(rec.attempt_count, 0);

        store.record_attempt(&a).await.unwrap();
        store.complete(&a, "101").await.unwrap();

        let rec = store.lookup(&a).await.unwrap().unwrap();
        assert!(rec.is_published());
        assert_eq!(rec.destination_id.as_deref(), Some("101"));
        assert_eq!(rec.attempt_count, 1);

        assert!(matches!(
            store.begin_attempt(&a).await.unwrap(),
            Claim::AlreadyPublished(_)
        ));
    }

    #[tokio::test]
    async fn double_completion_is_an_invariant_violation() {
        let store = store().await;
        let a = id(2);
        store.begin_attempt(&a).await.unwrap();
        store.complete(&a, "1").await.unwrap();
        let err = store.complete(&a, "2").await.unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(m) if m.contains("PUBLISHED")));

        let err = store.complete(&id(3), "3").await.unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(m) if m.contains("absent")));
    }

    #[tokio::test]
    async fn failed_records_can_be_reclaimed() {
        let store = store().await;
        let a = id(4);
        store.begin_attempt(&a).await.unwrap();
        store.fail(&a, FailureKind::Rejected, "HTTP 400").await;

        let rec = store.lookup(&a).await.unwrap().unwrap();
        assert_eq!(rec.status, MigrationStatus::Failed);
        assert_eq!(rec.failure_kind, Some(FailureKind::Rejected));
        assert_eq!(rec.failure_reason.as_deref(), Some("HTTP 400"));
        assert!(rec.last_attempted_at.is_some());

        let Claim::Acquired(rec) = store.begin_attempt(&a).await.unwrap() else {
            panic!("expected reclaim");
        };
        assert_eq!(rec.attempt_count, 1);
        assert!(matches!(
            store.begin_attempt(&a).await.unwrap(),
            Claim::InProgress(_)
        ));
    }

    #[tokio::test]
    async fn fail_never_touches_published() {
        let store = store().await;
        let a = id(5);
        store.begin_attempt(&a).await.unwrap();
        store.complete(&a, "9").await.unwrap();
        store.fail(&a, FailureKind::Transient, "late").await;
        assert!(store.lookup(&a).await.unwrap().unwrap().is_published());
    }

    #[tokio::test]
    async fn unconfirmed_is_held_until_resolved() {
        let store = store().await;
        let a = id(11);
        store.begin_attempt(&a).await.unwrap();
        store.mark_unconfirmed(&a, "reply unreadable").await.unwrap();

        assert!(matches!(
            store.begin_attempt(&a).await.unwrap(),
            Claim::Unconfirmed(_)
        ));
        store.fail(&a, FailureKind::Transient, "late").await;
        assert_eq!(store.recover_interrupted().await.unwrap(), 0);
        let rec = store.lookup(&a).await.unwrap().unwrap();
        assert_eq!(rec.status, MigrationStatus::Unconfirmed);
        assert_eq!(rec.failure_kind, Some(FailureKind::Unconfirmed));
        assert_eq!(store.counts().await.unwrap().unconfirmed, 1);

        store.resolve_unconfirmed(&a, Some("77")).await.unwrap();
        let rec = store.lookup(&a).await.unwrap().unwrap();
        assert_eq!(rec.destination_id.as_deref(), Some("77"));
        assert!(store.resolve_unconfirmed(&a, None).await.is_err());

        let b = id(12);
        store.begin_attempt(&b).await.unwrap();
        store.mark_unconfirmed(&b, "reply unreadable").await.unwrap();
        store.resolve_unconfirmed(&b, None).await.unwrap();
        assert!(matches!(
            store.begin_attempt(&b).await.unwrap(),
            Claim::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn interrupted_pending_becomes_failed() {
        let store = store().await;
        store.begin_attempt(&id(6)).await.unwrap();
        store.begin_attempt(&id(7)).await.unwrap();
        store.complete(&id(7), "7").await.unwrap();

        assert_eq!(store.recover_interrupted().await.unwrap(), 1);
        let rec = store.lookup(&id(6)).await.unwrap().unwrap();
        assert_eq!(rec.status, MigrationStatus::Failed);
        assert_eq!(rec.failure_kind, Some(FailureKind::Interrupted));
        assert!(matches!(
            store.begin_attempt(&id(6)).await.unwrap(),
            Claim::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn run_lock_excludes_second_run() {
        let store = store().await;
        let ttl = Duration::from_secs(60);
        store.acquire_run_lock("run-1", ttl).await.unwrap();
        let err = store.acquire_run_lock("run-2", ttl).await.unwrap_err();
        assert!(matches!(err, StoreError::RunLocked { holder } if holder == "run-1"));
        store.refresh_run_lock("run-1", ttl).await.unwrap();
        assert!(store.refresh_run_lock("run-2", ttl).await.is_err());

        store.release_run_lock("run-1").await.unwrap();
        store.acquire_run_lock("run-2", ttl).await.unwrap();
        assert!(store.break_run_lock().await.unwrap());
    }

    #[tokio::test]
    async fn media_dedup_by_url_then_hash() {
        let store = store().await;
        let handle = MediaHandle {
            source_url: "https://cdn.example.com/a.jpg".into(),
            local_path: PathBuf::from("/tmp/a.jpg"),
            file_name: "a.jpg".into(),
            content_type: "image/jpeg".into(),
            sha256: "ab".repeat(32),
        };
        assert!(store.uploaded_media(&handle).await.unwrap().is_none());
        let up = UploadedMedia {
            id: 5,
            url: "https://wp.example.com/a.jpg".into(),
        };
        store.record_media_upload(&handle, &up).await.unwrap();
        assert_eq!(store.uploaded_media(&handle).await.unwrap(), Some(up.clone()));

        let mirror = MediaHandle {
            source_url: "https://mirror.example.com/a.jpg".into(),
            ..handle
        };
        assert_eq!(store.uploaded_media(&mirror).await.unwrap(), Some(up));
    }

    #[tokio::test]
    async fn counts_list_and_reset() {
        let store = store().await;
        store.begin_attempt(&id(8)).await.unwrap();
        store.begin_attempt(&id(9)).await.unwrap();
        store.complete(&id(9), "9").await.unwrap();
        store.fail(&id(10), FailureKind::Discovery, "404").await;

        let counts = store.counts().await.unwrap();
        assert_eq!(
            counts,
            RecordCounts {
                pending: 1,
                published: 1,
                failed: 1,
                unconfirmed: 0,
            }
        );
        let failed = store
            .list_records(RecordFilter::Status(MigrationStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].source_id, id(10));

        assert_eq!(store.reset().await.unwrap(), 3);
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }
}

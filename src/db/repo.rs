use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

use super::model::{RecordCounts, RecordFilter};
use super::StoreError;
use crate::model::{FailureKind, MigrationRecord, MigrationStatus, SourceId};
use crate::publisher::UploadedMedia;

pub type Pool = SqlitePool;

const RECORD_COLUMNS: &str = "source_id, status, destination_id, attempt_count, last_attempted_at, failure_kind, failure_reason";

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        // WAL plus FULL sync: a committed transition survives a crash.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool_options = if in_memory {
        // One long-lived connection; the database vanishes with it.
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<MigrationRecord, StoreError> {
    let source_id: String = row.try_get("source_id")?;
    let status_str: String = row.try_get("status")?;
    let status = MigrationStatus::parse_status(&status_str).ok_or_else(|| {
        StoreError::Corrupt(format!("record {source_id} has unknown status {status_str}"))
    })?;
    let failure_kind = row
        .try_get::<Option<String>, _>("failure_kind")?
        .and_then(|s| FailureKind::parse_kind(&s));

    Ok(MigrationRecord {
        source_id: SourceId::from_stored(source_id),
        status,
        destination_id: row.try_get("destination_id")?,
        attempt_count: row.try_get("attempt_count")?,
        last_attempted_at: row.try_get::<Option<DateTime<Utc>>, _>("last_attempted_at")?,
        failure_kind,
        failure_reason: row.try_get("failure_reason")?,
    })
}

#[instrument(skip_all)]
pub async fn fetch_record(pool: &Pool, id: &SourceId) -> Result<Option<MigrationRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM migration_records WHERE source_id = ?"
    ))
    .bind(id.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Single-statement check-and-set: creates a `PENDING` record or moves a
/// `FAILED` one back to `PENDING`. Returns `None` when the existing record
/// is `PENDING` or `PUBLISHED` and was left untouched.
#[instrument(skip_all)]
pub async fn claim_record(
    pool: &Pool,
    id: &SourceId,
    now: DateTime<Utc>,
) -> Result<Option<MigrationRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO migration_records (source_id, status, attempt_count, last_attempted_at) \
         VALUES (?, 'PENDING', 0, ?) \
         ON CONFLICT(source_id) DO UPDATE SET \
             status = 'PENDING', \
             attempt_count = migration_records.attempt_count + 1, \
             last_attempted_at = excluded.last_attempted_at, \
             failure_kind = NULL, \
             failure_reason = NULL, \
             updated_at = CURRENT_TIMESTAMP \
         WHERE migration_records.status = 'FAILED' \
         RETURNING {RECORD_COLUMNS}"
    ))
    .bind(id.as_str())
    .bind(now)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn bump_attempt(pool: &Pool, id: &SourceId, now: DateTime<Utc>) -> Result<u64, StoreError> {
    let res = sqlx::query(
        "UPDATE migration_records SET attempt_count = attempt_count + 1, last_attempted_at = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE source_id = ? AND status = 'PENDING'",
    )
    .bind(now)
    .bind(id.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn mark_published(
    pool: &Pool,
    id: &SourceId,
    destination_id: &str,
) -> Result<u64, StoreError> {
    let res = sqlx::query(
        "UPDATE migration_records SET status = 'PUBLISHED', destination_id = ?, \
         failure_kind = NULL, failure_reason = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE source_id = ? AND status = 'PENDING'",
    )
    .bind(destination_id)
    .bind(id.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Moves a `PENDING` or `FAILED` record (or an absent one) to `FAILED`.
#[instrument(skip_all)]
pub async fn mark_failed(
    pool: &Pool,
    id: &SourceId,
    kind: FailureKind,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let res = sqlx::query(
        "INSERT INTO migration_records (source_id, status, attempt_count, last_attempted_at, failure_kind, failure_reason) \
         VALUES (?, 'FAILED', 0, ?, ?, ?) \
         ON CONFLICT(source_id) DO UPDATE SET \
             status = 'FAILED', \
             last_attempted_at = excluded.last_attempted_at, \
             failure_kind = excluded.failure_kind, \
             failure_reason = excluded.failure_reason, \
             updated_at = CURRENT_TIMESTAMP \
         WHERE migration_records.status IN ('PENDING', 'FAILED')",
    )
    .bind(id.as_str())
    .bind(now)
    .bind(kind.as_str())
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// `PENDING → UNCONFIRMED`. The record then stays out of every automatic path.
#[instrument(skip_all)]
pub async fn mark_unconfirmed(
    pool: &Pool,
    id: &SourceId,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let res = sqlx::query(
        "UPDATE migration_records SET status = 'UNCONFIRMED', failure_kind = ?, failure_reason = ?, \
         last_attempted_at = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE source_id = ? AND status = 'PENDING'",
    )
    .bind(FailureKind::Unconfirmed.as_str())
    .bind(reason)
    .bind(now)
    .bind(id.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Operator resolution of an `UNCONFIRMED` record: `Some(id)` means the post
/// exists on the destination, `None` means it was never created.
#[instrument(skip_all)]
pub async fn resolve_unconfirmed(
    pool: &Pool,
    id: &SourceId,
    destination_id: Option<&str>,
) -> Result<u64, StoreError> {
    let query = match destination_id {
        Some(dest) => sqlx::query(
            "UPDATE migration_records SET status = 'PUBLISHED', destination_id = ?, \
             failure_kind = NULL, failure_reason = NULL, updated_at = CURRENT_TIMESTAMP \
             WHERE source_id = ? AND status = 'UNCONFIRMED'",
        )
        .bind(dest),
        None => sqlx::query(
            "UPDATE migration_records SET status = 'FAILED', updated_at = CURRENT_TIMESTAMP \
             WHERE source_id = ? AND status = 'UNCONFIRMED'",
        ),
    };
    let res = query.bind(id.as_str()).execute(pool).await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn fail_all_pending(pool: &Pool, reason: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
    let res = sqlx::query(
        "UPDATE migration_records SET status = 'FAILED', failure_kind = ?, failure_reason = ?, \
         last_attempted_at = COALESCE(last_attempted_at, ?), updated_at = CURRENT_TIMESTAMP \
         WHERE status = 'PENDING'",
    )
    .bind(FailureKind::Interrupted.as_str())
    .bind(reason)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn list_records(pool: &Pool, filter: RecordFilter) -> Result<Vec<MigrationRecord>, StoreError> {
    let rows = match filter {
        RecordFilter::All => {
            sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM migration_records ORDER BY created_at, source_id"
            ))
            .fetch_all(pool)
            .await?
        }
        RecordFilter::Status(status) => {
            sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM migration_records WHERE status = ? ORDER BY created_at, source_id"
            ))
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter().map(record_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_by_status(pool: &Pool) -> Result<RecordCounts, StoreError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM migration_records GROUP BY status")
            .fetch_all(pool)
            .await?;
    let mut counts = RecordCounts::default();
    for (status, n) in rows {
        match MigrationStatus::parse_status(&status) {
            Some(MigrationStatus::Pending) => counts.pending = n,
            Some(MigrationStatus::Published) => counts.published = n,
            Some(MigrationStatus::Failed) => counts.failed = n,
            Some(MigrationStatus::Unconfirmed) => counts.unconfirmed = n,
            None => return Err(StoreError::Corrupt(format!("unknown status {status}"))),
        }
    }
    Ok(counts)
}

#[instrument(skip_all)]
pub async fn delete_all(pool: &Pool) -> Result<u64, StoreError> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query("DELETE FROM migration_records")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM media_uploads")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn media_by_url(pool: &Pool, source_url: &str) -> Result<Option<UploadedMedia>, StoreError> {
    let row: Option<(i64, String)> = sqlx::query_as(
        "SELECT destination_media_id, destination_url FROM media_uploads WHERE source_url = ?",
    )
    .bind(source_url)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id, url)| UploadedMedia { id: id as u64, url }))
}

#[instrument(skip_all)]
pub async fn media_by_hash(pool: &Pool, sha256: &str) -> Result<Option<UploadedMedia>, StoreError> {
    let row: Option<(i64, String)> = sqlx::query_as(
        "SELECT destination_media_id, destination_url FROM media_uploads WHERE sha256 = ? \
         ORDER BY uploaded_at LIMIT 1",
    )
    .bind(sha256)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id, url)| UploadedMedia { id: id as u64, url }))
}

#[instrument(skip_all)]
pub async fn insert_media(
    pool: &Pool,
    source_url: &str,
    sha256: &str,
    uploaded: &UploadedMedia,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO media_uploads (source_url, sha256, destination_media_id, destination_url) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(source_url) DO UPDATE SET sha256 = excluded.sha256, \
             destination_media_id = excluded.destination_media_id, \
             destination_url = excluded.destination_url, uploaded_at = CURRENT_TIMESTAMP",
    )
    .bind(source_url)
    .bind(sha256)
    .bind(uploaded.id as i64)
    .bind(&uploaded.url)
    .execute(pool)
    .await?;
    Ok(())
}

/// Takes the single-row run lock if it is free, expired, or already ours.
#[instrument(skip_all)]
pub async fn try_lock(pool: &Pool, run_id: &str, now_ms: i64, expires_at_ms: i64) -> Result<bool, StoreError> {
    let res = sqlx::query(
        "INSERT INTO run_lock (id, run_id, expires_at_ms) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET run_id = excluded.run_id, expires_at_ms = excluded.expires_at_ms \
         WHERE run_lock.expires_at_ms < ? OR run_lock.run_id = excluded.run_id",
    )
    .bind(run_id)
    .bind(expires_at_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn lock_holder(pool: &Pool) -> Result<Option<(String, i64)>, StoreError> {
    let row: Option<(String, i64)> =
        sqlx::query_as("SELECT run_id, expires_at_ms FROM run_lock WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn extend_lock(pool: &Pool, run_id: &str, expires_at_ms: i64) -> Result<u64, StoreError> {
    let res = sqlx::query("UPDATE run_lock SET expires_at_ms = ? WHERE id = 1 AND run_id = ?")
        .bind(expires_at_ms)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn unlock(pool: &Pool, run_id: Option<&str>) -> Result<u64, StoreError> {
    let res = match run_id {
        Some(run_id) => {
            sqlx::query("DELETE FROM run_lock WHERE id = 1 AND run_id = ?")
                .bind(run_id)
                .execute(pool)
                .await?
        }
        None => sqlx::query("DELETE FROM run_lock").execute(pool).await?,
    };
    Ok(res.rows_affected())
}

//! Result types returned by the state store.
//!
//! Keep these structs focused on the data returned by queries. Decisions
//! about what to do with them belong to the migrator.

use serde::Serialize;

use crate::model::{MigrationRecord, MigrationStatus};

/// Outcome of `begin_attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the attempt; the record is now `PENDING`.
    Acquired(MigrationRecord),
    AlreadyPublished(MigrationRecord),
    /// Another worker holds a `PENDING` attempt for the same post.
    InProgress(MigrationRecord),
    /// A create request may have succeeded; waiting for an operator.
    Unconfirmed(MigrationRecord),
}

/// Per-status totals for the status report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub pending: i64,
    pub published: i64,
    pub failed: i64,
    pub unconfirmed: i64,
}

impl RecordCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.published + self.failed + self.unconfirmed
    }
}

/// Which records `list_records` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFilter {
    #[default]
    All,
    Status(MigrationStatus),
}

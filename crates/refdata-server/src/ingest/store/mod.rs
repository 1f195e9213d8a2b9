//! Durable state for the ingestion pipeline
//!
//! [`IngestStore`] is the transactional boundary the pipeline talks to:
//! snapshot files, per-kind job status, LEI records and their audit trail.
//! [`PgStore`] is the production backend; [`MemoryStore`] keeps the same
//! semantics in process for tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    AuditEntry, BatchOutcome, FailureCategory, JobKind, JobState, JobStatus, LeiRecord,
    SnapshotFile, SnapshotProgress, StoredRecord,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// Constraint and data-shape failures are schema errors; the rest is unknown
    pub fn category(&self) -> FailureCategory {
        match self {
            StoreError::Constraint(_) | StoreError::CorruptRow(_) => FailureCategory::SchemaError,
            StoreError::Database(e) => classify_sqlx(e),
            StoreError::Serialization(_) => FailureCategory::SchemaError,
            StoreError::NotFound(_) => FailureCategory::Unknown,
        }
    }
}

fn classify_sqlx(err: &sqlx::Error) -> FailureCategory {
    match err {
        sqlx::Error::Database(db) => {
            // SQLSTATE 22xxx data exception, 23xxx integrity constraint violation
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("22") || code.starts_with("23") {
                FailureCategory::SchemaError
            } else {
                FailureCategory::Unknown
            }
        },
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => FailureCategory::SchemaError,
        _ => FailureCategory::Unknown,
    }
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    // ------------------------------------------------------------------
    // Snapshot files
    // ------------------------------------------------------------------

    async fn insert_snapshot(&self, snapshot: &SnapshotFile) -> StoreResult<()>;

    async fn get_snapshot(&self, id: Uuid) -> StoreResult<Option<SnapshotFile>>;

    /// Most recently downloaded snapshot of a kind
    async fn latest_snapshot(&self, kind: JobKind) -> StoreResult<Option<SnapshotFile>>;

    /// All snapshots of a kind, newest first
    async fn list_snapshots(&self, kind: JobKind) -> StoreResult<Vec<SnapshotFile>>;

    /// Claim a snapshot for a processor run; clears any previous failure
    async fn mark_snapshot_in_progress(&self, id: Uuid) -> StoreResult<()>;

    /// Persist counters and checkpoint after a committed batch
    async fn save_progress(&self, id: Uuid, progress: &SnapshotProgress) -> StoreResult<()>;

    async fn complete_snapshot(&self, id: Uuid, progress: &SnapshotProgress) -> StoreResult<()>;

    /// Mark FAILED; the persisted checkpoint and counters are left untouched
    async fn fail_snapshot(
        &self,
        id: Uuid,
        category: FailureCategory,
        message: &str,
    ) -> StoreResult<()>;

    /// Bump the retry counter when a FAILED snapshot is re-claimed
    async fn increment_retry(&self, id: Uuid) -> StoreResult<i32>;

    // ------------------------------------------------------------------
    // Job status
    // ------------------------------------------------------------------

    async fn job_status(&self, kind: JobKind) -> StoreResult<JobStatus>;

    /// Compare-and-swap to RUNNING on behalf of `owner`; true only if the row
    /// was in one of `from`
    async fn try_claim_job(&self, kind: JobKind, from: &[JobState], owner: &str)
        -> StoreResult<bool>;

    /// Point the job at a snapshot and refresh its heartbeat
    async fn attach_snapshot(&self, kind: JobKind, snapshot_id: Uuid) -> StoreResult<()>;

    /// Refresh the heartbeat of a RUNNING job
    async fn heartbeat_job(&self, kind: JobKind) -> StoreResult<()>;

    async fn complete_job(&self, kind: JobKind) -> StoreResult<()>;

    async fn fail_job(&self, kind: JobKind, message: &str) -> StoreResult<()>;

    /// Return a RUNNING job to IDLE without marking success (cancellation)
    async fn release_job(&self, kind: JobKind, message: Option<&str>) -> StoreResult<()>;

    /// Move RUNNING jobs to FAILED when their heartbeat is older than `before`
    /// or, regardless of heartbeat, when they were claimed by `orphaned_by`
    async fn recover_stale_jobs(
        &self,
        before: DateTime<Utc>,
        orphaned_by: Option<&str>,
    ) -> StoreResult<Vec<JobKind>>;

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Upsert every record and write audit entries in one transaction
    async fn apply_batch(&self, snapshot_id: Uuid, batch: &[LeiRecord])
        -> StoreResult<BatchOutcome>;

    async fn get_record(&self, lei: &str) -> StoreResult<Option<StoredRecord>>;

    async fn list_records(&self, limit: i64, offset: i64) -> StoreResult<Vec<StoredRecord>>;

    /// Audit entries for one LEI, oldest first
    async fn audit_history(&self, lei: &str) -> StoreResult<Vec<AuditEntry>>;
}

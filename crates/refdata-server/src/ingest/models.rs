//! Data models for the LEI ingestion pipeline
//!
//! Snapshot files, per-kind job state, LEI records and their audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Default cap on processing attempts for a snapshot
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Which scheduling track a snapshot or job belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Full,
    Delta,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Full, JobKind::Delta];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Full => "full",
            JobKind::Delta => "delta",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(JobKind::Full),
            "delta" => Ok(JobKind::Delta),
            _ => Err(format!("Invalid job kind: {}", s)),
        }
    }
}

/// Processing state of one snapshot file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "in_progress" => Ok(ProcessingStatus::InProgress),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            _ => Err(format!("Invalid processing status: {}", s)),
        }
    }
}

/// State of a job kind; `Running` is the mutual-exclusion token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// States a scheduled firing may claim from
    pub const SCHEDULABLE: [JobState; 2] = [JobState::Idle, JobState::Completed];
    /// States an operator action (manual trigger or resume) may claim from
    pub const OPERATOR_CLAIMABLE: [JobState; 3] =
        [JobState::Idle, JobState::Completed, JobState::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobState::Idle),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Closed set of failure causes, assigned where the failure happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    SchemaError,
    NetworkError,
    FileCorruption,
    Unknown,
}

impl FailureCategory {
    /// Whether re-attempting the same snapshot from its checkpoint may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureCategory::FileCorruption)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::SchemaError => "SCHEMA_ERROR",
            FailureCategory::NetworkError => "NETWORK_ERROR",
            FailureCategory::FileCorruption => "FILE_CORRUPTION",
            FailureCategory::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEMA_ERROR" => Ok(FailureCategory::SchemaError),
            "NETWORK_ERROR" => Ok(FailureCategory::NetworkError),
            "FILE_CORRUPTION" => Ok(FailureCategory::FileCorruption),
            "UNKNOWN" => Ok(FailureCategory::Unknown),
            _ => Err(format!("Invalid failure category: {}", s)),
        }
    }
}

/// One downloaded dataset version (maps to snapshot_files table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub id: Uuid,
    pub kind: JobKind,
    pub downloaded_at: DateTime<Utc>,
    pub source_uri: String,
    /// Extracted CSV on local disk
    pub artifact_path: PathBuf,
    pub artifact_sha256: Option<String>,
    pub artifact_bytes: i64,
    pub total_records: i64,
    /// Set once a pass has reached the end of the stream
    pub total_records_final: bool,
    pub processed_records: i64,
    pub failed_records: i64,
    pub processing_status: ProcessingStatus,
    /// Key of the last committed record; empty means start of file
    pub checkpoint_key: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub failure_category: Option<FailureCategory>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotFile {
    /// A freshly acquired snapshot, ready for its first pass
    pub fn registered(kind: JobKind, source_uri: impl Into<String>, artifact: ArtifactInfo) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            downloaded_at: now,
            source_uri: source_uri.into(),
            artifact_path: artifact.path,
            artifact_sha256: Some(artifact.sha256),
            artifact_bytes: artifact.bytes,
            total_records: 0,
            total_records_final: false,
            processed_records: 0,
            failed_records: 0,
            processing_status: ProcessingStatus::Pending,
            checkpoint_key: String::new(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            failure_category: None,
            error_message: None,
            updated_at: now,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn progress(&self) -> SnapshotProgress {
        SnapshotProgress {
            total_records: self.total_records,
            total_records_final: self.total_records_final,
            processed_records: self.processed_records,
            failed_records: self.failed_records,
            checkpoint_key: self.checkpoint_key.clone(),
        }
    }

    pub fn percent_complete(&self) -> f64 {
        self.progress().percent_complete()
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Counters and resume point persisted after every flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotProgress {
    pub total_records: i64,
    pub total_records_final: bool,
    pub processed_records: i64,
    pub failed_records: i64,
    pub checkpoint_key: String,
}

impl SnapshotProgress {
    /// `processed / total * 100`, or 0 while the total is unknown
    ///
    /// The total only becomes known once a pass reaches the end of the
    /// stream; before that it counts rows read so far.
    pub fn percent_complete(&self) -> f64 {
        if !self.total_records_final || self.total_records <= 0 {
            return 0.0;
        }
        (self.processed_records as f64 / self.total_records as f64) * 100.0
    }
}

/// Result of fetching and extracting a snapshot payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: i64,
}

/// Per-kind run state (maps to job_status table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub kind: JobKind,
    pub status: JobState,
    /// Lookup-only reference to the snapshot being (or last) processed
    pub current_snapshot_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Instance that made the latest claim
    pub owner: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn idle(kind: JobKind) -> Self {
        Self {
            kind,
            status: JobState::Idle,
            current_snapshot_id: None,
            error_message: None,
            owner: None,
            last_success_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// A validated legal entity record, keyed by LEI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeiRecord {
    pub lei: String,
    pub legal_name: String,
    pub jurisdiction: Option<String>,
    pub country: String,
    pub entity_status: String,
    pub registration_status: String,
    pub last_update: DateTime<Utc>,
}

/// Durable row for an LEI record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(flatten)]
    pub record: LeiRecord,
    pub last_snapshot_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(AuditAction::Create),
            "update" => Ok(AuditAction::Update),
            _ => Err(format!("Invalid audit action: {}", s)),
        }
    }
}

/// Audit trail entry written alongside every effective upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub lei: String,
    pub snapshot_id: Uuid,
    pub action: AuditAction,
    /// Prior values of the changed fields; `None` on create
    pub previous: Option<serde_json::Value>,
    pub changed: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Counts for one committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Incoming record older than the stored one
    pub stale: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ArtifactInfo {
        ArtifactInfo {
            path: PathBuf::from("/tmp/full.csv"),
            sha256: "abc".to_string(),
            bytes: 10,
        }
    }

    #[test]
    fn test_registered_snapshot_defaults() {
        let snapshot = SnapshotFile::registered(JobKind::Full, "https://example.org/full", artifact());

        assert_eq!(snapshot.processing_status, ProcessingStatus::Pending);
        assert_eq!(snapshot.total_records, 0);
        assert!(snapshot.checkpoint_key.is_empty());
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.max_retries, DEFAULT_MAX_RETRIES);
        assert!(snapshot.failure_category.is_none());
    }

    #[test]
    fn test_percent_complete() {
        let mut progress = SnapshotProgress::default();
        assert_eq!(progress.percent_complete(), 0.0);

        progress.total_records = 200;
        progress.processed_records = 50;
        progress.total_records_final = true;
        assert_eq!(progress.percent_complete(), 25.0);
    }

    #[test]
    fn test_percent_complete_unknown_during_first_pass() {
        let progress = SnapshotProgress {
            total_records: 1000,
            total_records_final: false,
            processed_records: 1000,
            failed_records: 0,
            checkpoint_key: "5493001KJTIIGC8Y1R12".to_string(),
        };
        assert_eq!(progress.percent_complete(), 0.0);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut snapshot =
            SnapshotFile::registered(JobKind::Delta, "https://example.org/delta", artifact())
                .with_max_retries(2);
        assert!(!snapshot.retries_exhausted());
        snapshot.retry_count = 2;
        assert!(snapshot.retries_exhausted());
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!("FULL".parse::<JobKind>().unwrap(), JobKind::Full);
        assert!("weekly".parse::<JobKind>().is_err());
        assert_eq!(
            ProcessingStatus::InProgress.as_str().parse::<ProcessingStatus>().unwrap(),
            ProcessingStatus::InProgress
        );
        assert_eq!(
            "FILE_CORRUPTION".parse::<FailureCategory>().unwrap(),
            FailureCategory::FileCorruption
        );
        assert!(!FailureCategory::FileCorruption.is_retryable());
        assert!(FailureCategory::Unknown.is_retryable());
    }
}

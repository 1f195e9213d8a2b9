//! Ingestion error taxonomy
//!
//! Every failure that can stop a run maps onto a [`FailureCategory`] at the
//! point where it is raised, so nothing downstream needs to inspect messages.

use thiserror::Error;
use uuid::Uuid;

use super::models::{FailureCategory, JobKind};
use super::store::StoreError;

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("File corruption: {0}")]
    FileCorruption(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint {checkpoint_key} not found in snapshot {snapshot_id}")]
    CheckpointNotFound {
        snapshot_id: Uuid,
        checkpoint_key: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Snapshot {snapshot_id} exhausted its retries ({retry_count}/{max_retries})")]
    RetryExhausted {
        snapshot_id: Uuid,
        retry_count: i32,
        max_retries: i32,
    },

    #[error("Snapshot {snapshot_id} failed with {category}, which cannot be retried")]
    NotRetryable {
        snapshot_id: Uuid,
        category: FailureCategory,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn already_running(kind: JobKind) -> Self {
        IngestError::Conflict(format!("A {} sync is already running", kind))
    }

    /// Category recorded on the snapshot when this error aborts a run
    pub fn category(&self) -> FailureCategory {
        match self {
            IngestError::Network(_) => FailureCategory::NetworkError,
            IngestError::FileCorruption(_) | IngestError::CheckpointNotFound { .. } => {
                FailureCategory::FileCorruption
            },
            IngestError::Store(e) => e.category(),
            _ => FailureCategory::Unknown,
        }
    }
}

impl From<refdata_common::CommonError> for IngestError {
    fn from(err: refdata_common::CommonError) -> Self {
        match err {
            refdata_common::CommonError::Io(e) => IngestError::Io(e),
            refdata_common::CommonError::ChecksumMismatch { expected, actual } => {
                IngestError::FileCorruption(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, actual
                ))
            },
            refdata_common::CommonError::Config(msg) => IngestError::Config(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            IngestError::Network("timeout".into()).category(),
            FailureCategory::NetworkError
        );
        assert_eq!(
            IngestError::FileCorruption("bad gzip".into()).category(),
            FailureCategory::FileCorruption
        );
        assert_eq!(
            IngestError::CheckpointNotFound {
                snapshot_id: Uuid::new_v4(),
                checkpoint_key: "K".into()
            }
            .category(),
            FailureCategory::FileCorruption
        );
        assert_eq!(
            IngestError::Store(StoreError::Constraint("not null".into())).category(),
            FailureCategory::SchemaError
        );
        assert_eq!(IngestError::Cancelled.category(), FailureCategory::Unknown);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let err: IngestError = refdata_common::CommonError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(err.category(), FailureCategory::FileCorruption);
    }
}

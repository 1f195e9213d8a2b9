//! Status and resume facade
//!
//! Read side for operators and the HTTP boundary. Everything here reads
//! persisted state only and never waits on an in-flight run; the two write
//! operations hand off to the [`Scheduler`].

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{IngestError, IngestResult};
use super::models::{AuditEntry, JobKind, JobStatus, SnapshotFile, StoredRecord};
use super::scheduler::{RunHandle, Scheduler};
use super::store::IngestStore;

pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Snapshot row plus its computed progress
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
    #[serde(flatten)]
    pub snapshot: SnapshotFile,
    pub percent_complete: f64,
}

impl From<SnapshotFile> for SnapshotView {
    fn from(snapshot: SnapshotFile) -> Self {
        Self {
            percent_complete: snapshot.percent_complete(),
            snapshot,
        }
    }
}

/// Job state with the active or most recent snapshot of its kind
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusView {
    #[serde(flatten)]
    pub job: JobStatus,
    pub snapshot: Option<SnapshotView>,
}

#[derive(Clone)]
pub struct SyncStatusService {
    store: Arc<dyn IngestStore>,
    scheduler: Scheduler,
}

impl SyncStatusService {
    pub fn new(store: Arc<dyn IngestStore>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn job_status(&self, kind: JobKind) -> IngestResult<SyncStatusView> {
        let job = self.store.job_status(kind).await?;

        let current = match job.current_snapshot_id {
            Some(id) => self.store.get_snapshot(id).await?,
            None => None,
        };
        let snapshot = match current {
            Some(snapshot) => Some(snapshot),
            None => self.store.latest_snapshot(kind).await?,
        };

        Ok(SyncStatusView {
            job,
            snapshot: snapshot.map(SnapshotView::from),
        })
    }

    pub async fn snapshot(&self, id: Uuid) -> IngestResult<SnapshotView> {
        self.store
            .get_snapshot(id)
            .await?
            .map(SnapshotView::from)
            .ok_or_else(|| IngestError::NotFound(format!("snapshot {}", id)))
    }

    pub async fn get_record(&self, lei: &str) -> IngestResult<StoredRecord> {
        self.store
            .get_record(lei)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("record {}", lei)))
    }

    /// Page through records ordered by LEI
    pub async fn list_records(
        &self,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> IngestResult<Vec<StoredRecord>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = offset.unwrap_or(0);
        if limit < 1 {
            return Err(IngestError::BadRequest("limit must be at least 1".to_string()));
        }
        if offset < 0 {
            return Err(IngestError::BadRequest("offset must not be negative".to_string()));
        }

        Ok(self
            .store
            .list_records(limit.min(MAX_PAGE_SIZE), offset)
            .await?)
    }

    /// Audit trail of one record, oldest first
    pub async fn audit_history(&self, lei: &str) -> IngestResult<Vec<AuditEntry>> {
        let history = self.store.audit_history(lei).await?;
        if history.is_empty() && self.store.get_record(lei).await?.is_none() {
            return Err(IngestError::NotFound(format!("record {}", lei)));
        }
        Ok(history)
    }

    pub async fn trigger(&self, kind: JobKind) -> IngestResult<RunHandle> {
        self.scheduler.trigger(kind).await
    }

    pub async fn resume(&self, snapshot_id: Uuid) -> IngestResult<RunHandle> {
        self.scheduler.resume(snapshot_id).await
    }
}

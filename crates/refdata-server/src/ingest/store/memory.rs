//! In-process store
//!
//! Mirrors the Postgres semantics closely enough to drive the full pipeline
//! without a database: the job claim is a check-and-set under one lock and a
//! batch is applied to a working copy that only replaces the live state once
//! every record succeeded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{IngestStore, StoreError, StoreResult};
use crate::ingest::models::{
    AuditEntry, BatchOutcome, FailureCategory, JobKind, JobState, JobStatus, LeiRecord,
    ProcessingStatus, SnapshotFile, SnapshotProgress, StoredRecord,
};
use crate::ingest::upsert::{plan_change, RecordChange};

const RECOVERED_MESSAGE: &str = "interrupted: owner stopped before the run settled";

#[derive(Default)]
struct MemoryState {
    snapshots: HashMap<Uuid, SnapshotFile>,
    jobs: HashMap<JobKind, JobStatus>,
    records: BTreeMap<String, StoredRecord>,
    audit: Vec<AuditEntry>,
    rejected_keys: HashSet<String>,
    committed_batches: Vec<usize>,
    commit_hook: Option<CommitHook>,
}

type CommitHook = Box<dyn Fn(usize) + Send + Sync>;

impl MemoryState {
    fn snapshot_mut(&mut self, id: Uuid) -> StoreResult<&mut SnapshotFile> {
        self.snapshots
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {}", id)))
    }

    fn job_mut(&mut self, kind: JobKind) -> &mut JobStatus {
        self.jobs.entry(kind).or_insert_with(|| JobStatus::idle(kind))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make any batch containing `lei` fail with a constraint violation
    pub async fn reject_key(&self, lei: impl Into<String>) {
        self.state.lock().await.rejected_keys.insert(lei.into());
    }

    pub async fn clear_rejections(&self) {
        self.state.lock().await.rejected_keys.clear();
    }

    /// Call `hook` with the number of committed batches after every commit
    pub async fn on_commit(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        self.state.lock().await.commit_hook = Some(Box::new(hook));
    }

    /// Sizes of every committed batch, in commit order
    pub async fn committed_batches(&self) -> Vec<usize> {
        self.state.lock().await.committed_batches.clone()
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn audit_count(&self) -> usize {
        self.state.lock().await.audit.len()
    }

    /// Overwrite a job row, e.g. to stage a crashed RUNNING job
    pub async fn put_job(&self, status: JobStatus) {
        self.state.lock().await.jobs.insert(status.kind, status);
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: &SnapshotFile) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.snapshots.contains_key(&snapshot.id) {
            return Err(StoreError::Constraint(format!(
                "duplicate snapshot id {}",
                snapshot.id
            )));
        }
        state.snapshots.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: Uuid) -> StoreResult<Option<SnapshotFile>> {
        Ok(self.state.lock().await.snapshots.get(&id).cloned())
    }

    async fn latest_snapshot(&self, kind: JobKind) -> StoreResult<Option<SnapshotFile>> {
        Ok(self.list_snapshots(kind).await?.into_iter().next())
    }

    async fn list_snapshots(&self, kind: JobKind) -> StoreResult<Vec<SnapshotFile>> {
        let state = self.state.lock().await;
        let mut snapshots: Vec<_> = state
            .snapshots
            .values()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        Ok(snapshots)
    }

    async fn mark_snapshot_in_progress(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.snapshot_mut(id)?;
        snapshot.processing_status = ProcessingStatus::InProgress;
        snapshot.failure_category = None;
        snapshot.error_message = None;
        snapshot.updated_at = Utc::now();
        Ok(())
    }

    async fn save_progress(&self, id: Uuid, progress: &SnapshotProgress) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.snapshot_mut(id)?;
        apply_progress(snapshot, progress);
        Ok(())
    }

    async fn complete_snapshot(&self, id: Uuid, progress: &SnapshotProgress) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.snapshot_mut(id)?;
        apply_progress(snapshot, progress);
        snapshot.processing_status = ProcessingStatus::Completed;
        Ok(())
    }

    async fn fail_snapshot(
        &self,
        id: Uuid,
        category: FailureCategory,
        message: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.snapshot_mut(id)?;
        snapshot.processing_status = ProcessingStatus::Failed;
        snapshot.failure_category = Some(category);
        snapshot.error_message = Some(message.to_string());
        snapshot.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid) -> StoreResult<i32> {
        let mut state = self.state.lock().await;
        let snapshot = state.snapshot_mut(id)?;
        snapshot.retry_count += 1;
        snapshot.updated_at = Utc::now();
        Ok(snapshot.retry_count)
    }

    async fn job_status(&self, kind: JobKind) -> StoreResult<JobStatus> {
        let mut state = self.state.lock().await;
        Ok(state.job_mut(kind).clone())
    }

    async fn try_claim_job(
        &self,
        kind: JobKind,
        from: &[JobState],
        owner: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(kind);
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = JobState::Running;
        job.error_message = None;
        job.owner = Some(owner.to_string());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn attach_snapshot(&self, kind: JobKind, snapshot_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(kind);
        job.current_snapshot_id = Some(snapshot_id);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn heartbeat_job(&self, kind: JobKind) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(kind);
        if job.status == JobState::Running {
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_job(&self, kind: JobKind) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(kind);
        let now = Utc::now();
        job.status = JobState::Completed;
        job.error_message = None;
        job.last_success_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn fail_job(&self, kind: JobKind, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(kind);
        job.status = JobState::Failed;
        job.error_message = Some(message.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn release_job(&self, kind: JobKind, message: Option<&str>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(kind);
        job.status = JobState::Idle;
        job.error_message = message.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn recover_stale_jobs(
        &self,
        before: DateTime<Utc>,
        orphaned_by: Option<&str>,
    ) -> StoreResult<Vec<JobKind>> {
        let mut state = self.state.lock().await;
        let mut recovered = Vec::new();
        for job in state.jobs.values_mut() {
            let orphaned = orphaned_by.is_some() && job.owner.as_deref() == orphaned_by;
            if job.status == JobState::Running && (orphaned || job.updated_at < before) {
                job.status = JobState::Failed;
                job.error_message = Some(RECOVERED_MESSAGE.to_string());
                job.updated_at = Utc::now();
                recovered.push(job.kind);
            }
        }
        Ok(recovered)
    }

    async fn apply_batch(
        &self,
        snapshot_id: Uuid,
        batch: &[LeiRecord],
    ) -> StoreResult<BatchOutcome> {
        let mut state = self.state.lock().await;

        if let Some(rejected) = batch.iter().find(|r| state.rejected_keys.contains(&r.lei)) {
            return Err(StoreError::Constraint(format!(
                "record {} violates a table constraint",
                rejected.lei
            )));
        }

        // Working copies; swapped in only when the whole batch succeeded.
        let mut records = state.records.clone();
        let mut audit = Vec::new();
        let mut outcome = BatchOutcome::default();
        let now = Utc::now();

        for incoming in batch {
            let existing = records.get(&incoming.lei).map(|r| &r.record);
            let change = plan_change(existing, incoming)?;
            change.tally(&mut outcome);

            if let Some(entry) = change.audit_entry(&incoming.lei, snapshot_id) {
                audit.push(entry);
            }

            match change {
                RecordChange::Create { .. } => {
                    records.insert(
                        incoming.lei.clone(),
                        StoredRecord {
                            record: incoming.clone(),
                            last_snapshot_id: snapshot_id,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                },
                RecordChange::Update { .. } => {
                    if let Some(row) = records.get_mut(&incoming.lei) {
                        row.record = incoming.clone();
                        row.last_snapshot_id = snapshot_id;
                        row.updated_at = now;
                    }
                },
                RecordChange::Unchanged | RecordChange::Stale => {},
            }
        }

        state.records = records;
        state.audit.extend(audit);
        state.committed_batches.push(batch.len());
        if let Some(hook) = &state.commit_hook {
            hook(state.committed_batches.len());
        }
        Ok(outcome)
    }

    async fn get_record(&self, lei: &str) -> StoreResult<Option<StoredRecord>> {
        Ok(self.state.lock().await.records.get(lei).cloned())
    }

    async fn list_records(&self, limit: i64, offset: i64) -> StoreResult<Vec<StoredRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn audit_history(&self, lei: &str) -> StoreResult<Vec<AuditEntry>> {
        let state = self.state.lock().await;
        Ok(state.audit.iter().filter(|e| e.lei == lei).cloned().collect())
    }
}

fn apply_progress(snapshot: &mut SnapshotFile, progress: &SnapshotProgress) {
    snapshot.total_records = progress.total_records;
    snapshot.total_records_final = progress.total_records_final;
    snapshot.processed_records = progress.processed_records;
    snapshot.failed_records = progress.failed_records;
    snapshot.checkpoint_key = progress.checkpoint_key.clone();
    snapshot.updated_at = Utc::now();
}

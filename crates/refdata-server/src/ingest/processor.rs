//! Streaming processor
//!
//! Drives one snapshot from its checkpoint to the end of the file:
//!
//! 1. Seek: rows up to and including the checkpoint key are skipped without
//!    touching any counter.
//! 2. Each later row is validated; malformed rows are counted and dropped,
//!    valid rows join the current batch.
//! 3. A full batch is committed through the [`UpsertEngine`], and only then
//!    are the counters and the new checkpoint persisted. A crash can
//!    therefore never leave the checkpoint ahead of committed data.
//! 4. At end of stream the snapshot and its job are marked COMPLETED.
//!
//! `total_records` is extended only by rows past the resume point and only
//! until a pass has reached the end of the file, so rescanned rows are never
//! counted twice.
//!
//! Cancellation is observed between batches only.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{IngestError, IngestResult};
use super::models::{
    BatchOutcome, JobKind, LeiRecord, ProcessingStatus, SnapshotFile, SnapshotProgress,
};
use super::reader::{self, DEFAULT_CHANNEL_CAPACITY};
use super::store::IngestStore;
use super::upsert::UpsertEngine;
use super::validation::validate;

/// What one processor run did
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub snapshot_id: Uuid,
    pub kind: JobKind,
    /// Progress as persisted at the end of the run
    pub progress: SnapshotProgress,
    /// Upsert counts over the batches of this run
    pub outcome: BatchOutcome,
    pub batches: usize,
    /// Rows passed over while seeking the checkpoint
    pub skipped: u64,
}

#[derive(Clone)]
pub struct StreamingProcessor {
    store: Arc<dyn IngestStore>,
    upsert: UpsertEngine,
    batch_size: usize,
    channel_capacity: usize,
}

struct RunState {
    progress: SnapshotProgress,
    count_total: bool,
    last_key: String,
    outcome: BatchOutcome,
    batches: usize,
    skipped: u64,
}

impl StreamingProcessor {
    pub fn new(store: Arc<dyn IngestStore>, batch_size: usize) -> Self {
        Self {
            upsert: UpsertEngine::new(store.clone()),
            store,
            batch_size: batch_size.max(1),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Process a snapshot to completion, failure or cancellation
    ///
    /// The caller holds the RUNNING claim on the snapshot's job kind. On
    /// return the claim has been settled: COMPLETED, FAILED, or released to
    /// IDLE when cancelled.
    pub async fn process(
        &self,
        snapshot: &SnapshotFile,
        cancel: &CancellationToken,
    ) -> IngestResult<RunReport> {
        let snapshot_id = snapshot.id;
        let kind = snapshot.kind;

        if snapshot.processing_status == ProcessingStatus::Completed {
            self.store.release_job(kind, None).await?;
            return Err(IngestError::Conflict(format!(
                "snapshot {} is already completed",
                snapshot_id
            )));
        }

        let started = Instant::now();
        info!(
            snapshot_id = %snapshot_id,
            kind = %kind,
            checkpoint = %snapshot.checkpoint_key,
            retry_count = snapshot.retry_count,
            "Processing snapshot"
        );

        let result = async {
            self.store.mark_snapshot_in_progress(snapshot_id).await?;
            self.store.attach_snapshot(kind, snapshot_id).await?;
            let report = self.run(snapshot, cancel).await?;
            self.store.complete_snapshot(snapshot_id, &report.progress).await?;
            self.store.complete_job(kind).await?;
            Ok::<_, IngestError>(report)
        }
        .await;

        match result {
            Ok(report) => {
                info!(
                    snapshot_id = %snapshot_id,
                    kind = %kind,
                    total = report.progress.total_records,
                    processed = report.progress.processed_records,
                    failed = report.progress.failed_records,
                    created = report.outcome.created,
                    updated = report.outcome.updated,
                    unchanged = report.outcome.unchanged,
                    stale = report.outcome.stale,
                    batches = report.batches,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Snapshot completed"
                );
                Ok(report)
            },
            Err(IngestError::Cancelled) => {
                info!(snapshot_id = %snapshot_id, kind = %kind, "Run cancelled at batch boundary");
                if let Err(e) = self.store.release_job(kind, Some("cancelled")).await {
                    warn!(kind = %kind, error = %e, "Failed to release job after cancellation");
                }
                Err(IngestError::Cancelled)
            },
            Err(e) => {
                let category = e.category();
                let message = e.to_string();
                error!(
                    snapshot_id = %snapshot_id,
                    kind = %kind,
                    category = %category,
                    error = %message,
                    "Snapshot processing failed"
                );
                if let Err(store_err) =
                    self.store.fail_snapshot(snapshot_id, category, &message).await
                {
                    warn!(snapshot_id = %snapshot_id, error = %store_err, "Failed to mark snapshot failed");
                }
                if let Err(store_err) = self.store.fail_job(kind, &message).await {
                    warn!(kind = %kind, error = %store_err, "Failed to mark job failed");
                }
                Err(e)
            },
        }
    }

    async fn run(
        &self,
        snapshot: &SnapshotFile,
        cancel: &CancellationToken,
    ) -> IngestResult<RunReport> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let mut stream = reader::open(&snapshot.artifact_path, self.channel_capacity).await?;
        let layout = stream.layout().clone();

        let resume_from = snapshot.checkpoint_key.clone();
        let mut seeking = !resume_from.is_empty();
        let mut state = RunState {
            progress: snapshot.progress(),
            count_total: !snapshot.total_records_final,
            last_key: resume_from.clone(),
            outcome: BatchOutcome::default(),
            batches: 0,
            skipped: 0,
        };
        let mut batch: Vec<LeiRecord> = Vec::with_capacity(self.batch_size);

        while let Some(row) = stream.next().await {
            let row = row?;

            if seeking {
                state.skipped += 1;
                if row.key.eq_ignore_ascii_case(&resume_from) {
                    seeking = false;
                    debug!(
                        snapshot_id = %snapshot.id,
                        checkpoint = %resume_from,
                        skipped = state.skipped,
                        "Checkpoint reached"
                    );
                } else if state.skipped % self.batch_size as u64 == 0 && cancel.is_cancelled() {
                    return Err(IngestError::Cancelled);
                }
                continue;
            }

            if state.count_total {
                state.progress.total_records += 1;
            }
            if !row.key.is_empty() {
                state.last_key = row.key.to_ascii_uppercase();
            }

            let fields = match row.fields {
                Ok(fields) => fields,
                Err(reason) => {
                    state.progress.failed_records += 1;
                    debug!(position = row.position, key = %row.key, reason = %reason, "Undecodable row");
                    continue;
                },
            };

            match validate(&layout, &fields) {
                Ok(record) => batch.push(record),
                Err(e) => {
                    state.progress.failed_records += 1;
                    debug!(position = row.position, key = %row.key, error = %e, "Invalid row");
                },
            }

            if batch.len() >= self.batch_size {
                self.flush(snapshot, &mut batch, &mut state).await?;
                if cancel.is_cancelled() {
                    return Err(IngestError::Cancelled);
                }
            }
        }

        if seeking {
            return Err(IngestError::CheckpointNotFound {
                snapshot_id: snapshot.id,
                checkpoint_key: resume_from,
            });
        }

        self.flush(snapshot, &mut batch, &mut state).await?;

        let mut progress = state.progress;
        progress.total_records_final = true;
        progress.checkpoint_key = state.last_key;

        Ok(RunReport {
            snapshot_id: snapshot.id,
            kind: snapshot.kind,
            progress,
            outcome: state.outcome,
            batches: state.batches,
            skipped: state.skipped,
        })
    }

    /// Commit the pending batch, then persist counters and the checkpoint
    async fn flush(
        &self,
        snapshot: &SnapshotFile,
        batch: &mut Vec<LeiRecord>,
        state: &mut RunState,
    ) -> IngestResult<()> {
        let outcome = self.upsert.apply(snapshot.id, batch).await?;

        if let Some(last) = batch.last() {
            state.progress.processed_records += batch.len() as i64;
            state.progress.checkpoint_key = last.lei.clone();
            state.batches += 1;
        }
        state.outcome.created += outcome.created;
        state.outcome.updated += outcome.updated;
        state.outcome.unchanged += outcome.unchanged;
        state.outcome.stale += outcome.stale;
        batch.clear();

        self.store.save_progress(snapshot.id, &state.progress).await?;
        self.store.heartbeat_job(snapshot.kind).await?;

        info!(
            snapshot_id = %snapshot.id,
            kind = %snapshot.kind,
            processed = state.progress.processed_records,
            failed = state.progress.failed_records,
            total = state.progress.total_records,
            checkpoint = %state.progress.checkpoint_key,
            percent_complete = state.progress.percent_complete(),
            "Batch flushed"
        );
        Ok(())
    }
}

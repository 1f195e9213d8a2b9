//! Sync scheduler
//!
//! Owns the three background loops (weekly FULL, interval DELTA, daily
//! retention) and the operator entry points (trigger, resume). Mutual
//! exclusion per job kind is the compare-and-swap on the job status row, so
//! scheduled firings, manual triggers and other server instances all go
//! through the same gate.
//!
//! A scheduled firing only claims an IDLE or COMPLETED job. A FAILED job stays
//! FAILED until an operator triggers a fresh run or resumes its snapshot.
//!
//! Every claim is tagged with the configured instance id and kept alive by a
//! heartbeat for as long as the run lasts. Before claiming, dead claims are
//! moved to FAILED: those whose heartbeat stopped, and, once per process,
//! those left behind by an earlier process with the same instance id.

use chrono::{Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::acquisition::{Acquisition, SnapshotFetcher};
use super::config::IngestConfig;
use super::error::{IngestError, IngestResult};
use super::models::{FailureCategory, JobKind, JobState, ProcessingStatus, SnapshotFile};
use super::processor::{RunReport, StreamingProcessor};
use super::retention::RetentionCleaner;
use super::schedule::{until, SyncSchedule};
use super::store::IngestStore;

/// A run started by [`Scheduler::trigger`] or [`Scheduler::resume`]
#[derive(Debug)]
pub struct RunHandle {
    pub kind: JobKind,
    /// Known up front for resumes; fresh runs register their snapshot later
    pub snapshot_id: Option<Uuid>,
    handle: JoinHandle<IngestResult<RunReport>>,
}

impl RunHandle {
    /// Wait for the run to settle
    pub async fn wait(self) -> IngestResult<RunReport> {
        self.handle
            .await
            .map_err(|e| IngestError::Io(std::io::Error::other(e)))?
    }
}

struct Inner {
    store: Arc<dyn IngestStore>,
    acquisition: Acquisition,
    processor: StreamingProcessor,
    retention: RetentionCleaner,
    config: Arc<IngestConfig>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    orphans_recovered: OnceCell<()>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn IngestStore>,
        fetcher: Arc<dyn SnapshotFetcher>,
        config: IngestConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            inner: Arc::new(Inner {
                acquisition: Acquisition::new(fetcher, store.clone(), config.clone()),
                processor: StreamingProcessor::new(store.clone(), config.batch_size),
                retention: RetentionCleaner::new(store.clone(), config.clone()),
                store,
                config,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                orphans_recovered: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    pub fn retention(&self) -> &RetentionCleaner {
        &self.inner.retention
    }

    /// Start the timer loops
    ///
    /// Fails without spawning anything if a timer setting cannot be parsed.
    /// Jobs left RUNNING by a dead process are moved to FAILED first.
    pub async fn start(&self) -> IngestResult<()> {
        let schedule = SyncSchedule::from_config(&self.inner.config)?;

        if self.inner.cancel.is_cancelled() {
            return Err(IngestError::Conflict("scheduler has been stopped".to_string()));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(IngestError::Conflict("scheduler is already started".to_string()));
        }

        self.inner.recover_dead_claims().await?;

        info!(
            delta_interval_secs = schedule.delta_interval.as_secs(),
            full_day = %schedule.full_day,
            full_time = %schedule.full_time,
            cleanup_time = %schedule.cleanup_time,
            "Starting sync scheduler"
        );

        let inner = self.inner.clone();
        let delta_interval = schedule.delta_interval;
        self.inner.tracker.spawn(async move {
            inner.delta_loop(delta_interval).await;
        });
        let inner = self.inner.clone();
        let full_schedule = schedule.clone();
        self.inner.tracker.spawn(async move {
            inner.full_loop(full_schedule).await;
        });
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            inner.cleanup_loop(schedule).await;
        });

        Ok(())
    }

    /// Signal timers and in-flight runs to stop without waiting for them
    pub fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("Stopping sync scheduler");
        }
        self.inner.cancel.cancel();
        self.inner.tracker.close();
    }

    /// Cancel timers and wait for in-flight runs to reach a batch boundary
    pub async fn stop(&self) {
        self.shutdown();
        self.inner.tracker.wait().await;
        info!("Sync scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Timer loops are active
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.is_stopped()
    }

    /// Start an immediate fresh run of `kind`
    ///
    /// Fails with a conflict if that kind is already RUNNING; nothing is queued.
    pub async fn trigger(&self, kind: JobKind) -> IngestResult<RunHandle> {
        self.ensure_accepting()?;

        if !self.inner.claim(kind, &JobState::OPERATOR_CLAIMABLE).await? {
            return Err(IngestError::already_running(kind));
        }
        info!(kind = %kind, "Manual sync triggered");

        let inner = self.inner.clone();
        let handle = self.inner.tracker.spawn(async move {
            inner.with_heartbeat(kind, inner.run_fresh(kind)).await
        });
        Ok(RunHandle {
            kind,
            snapshot_id: None,
            handle,
        })
    }

    pub async fn trigger_full(&self) -> IngestResult<RunHandle> {
        self.trigger(JobKind::Full).await
    }

    pub async fn trigger_delta(&self) -> IngestResult<RunHandle> {
        self.trigger(JobKind::Delta).await
    }

    /// Re-claim a snapshot and continue it from its checkpoint
    pub async fn resume(&self, snapshot_id: Uuid) -> IngestResult<RunHandle> {
        self.ensure_accepting()?;

        let snapshot = self.load_snapshot(snapshot_id).await?;
        check_resumable(&snapshot)?;
        let kind = snapshot.kind;

        if !self.inner.claim(kind, &JobState::OPERATOR_CLAIMABLE).await? {
            return Err(IngestError::already_running(kind));
        }

        // Re-check under the claim; a run may have settled the snapshot meanwhile
        let mut snapshot = match self.load_snapshot(snapshot_id).await {
            Ok(s) => s,
            Err(e) => return Err(self.abandon_claim(kind, e).await),
        };
        if let Err(e) = check_resumable(&snapshot) {
            return Err(self.abandon_claim(kind, e).await);
        }

        if snapshot.processing_status == ProcessingStatus::Failed {
            snapshot.retry_count = match self.inner.store.increment_retry(snapshot_id).await {
                Ok(count) => count,
                Err(e) => return Err(self.abandon_claim(kind, e.into()).await),
            };
        }

        info!(
            snapshot_id = %snapshot_id,
            kind = %kind,
            status = %snapshot.processing_status,
            checkpoint = %snapshot.checkpoint_key,
            retry_count = snapshot.retry_count,
            max_retries = snapshot.max_retries,
            "Resuming snapshot"
        );

        let inner = self.inner.clone();
        let handle = self.inner.tracker.spawn(async move {
            inner.with_heartbeat(kind, inner.run_resumed(snapshot)).await
        });
        Ok(RunHandle {
            kind,
            snapshot_id: Some(snapshot_id),
            handle,
        })
    }

    fn ensure_accepting(&self) -> IngestResult<()> {
        if self.inner.cancel.is_cancelled() {
            Err(IngestError::Conflict("scheduler is shutting down".to_string()))
        } else {
            Ok(())
        }
    }

    async fn load_snapshot(&self, snapshot_id: Uuid) -> IngestResult<SnapshotFile> {
        self.inner
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("snapshot {}", snapshot_id)))
    }

    async fn abandon_claim(&self, kind: JobKind, err: IngestError) -> IngestError {
        if let Err(e) = self.inner.store.release_job(kind, None).await {
            warn!(kind = %kind, error = %e, "Failed to release job claim");
        }
        err
    }
}

/// Whether an operator may resume `snapshot`
fn check_resumable(snapshot: &SnapshotFile) -> IngestResult<()> {
    match snapshot.processing_status {
        ProcessingStatus::Completed => Err(IngestError::Conflict(format!(
            "snapshot {} is already completed",
            snapshot.id
        ))),
        ProcessingStatus::Failed => {
            if snapshot.failure_category == Some(FailureCategory::FileCorruption) {
                return Err(IngestError::NotRetryable {
                    snapshot_id: snapshot.id,
                    category: FailureCategory::FileCorruption,
                });
            }
            if snapshot.retries_exhausted() {
                return Err(IngestError::RetryExhausted {
                    snapshot_id: snapshot.id,
                    retry_count: snapshot.retry_count,
                    max_retries: snapshot.max_retries,
                });
            }
            Ok(())
        },
        ProcessingStatus::Pending | ProcessingStatus::InProgress => Ok(()),
    }
}

impl Inner {
    /// Move dead RUNNING claims to FAILED, then try to claim `kind`
    async fn claim(&self, kind: JobKind, from: &[JobState]) -> IngestResult<bool> {
        self.recover_dead_claims().await?;
        Ok(self
            .store
            .try_claim_job(kind, from, &self.config.instance_id)
            .await?)
    }

    async fn recover_dead_claims(&self) -> IngestResult<()> {
        // Until this process has claimed anything, every RUNNING row tagged
        // with our instance id was left by a previous process.
        let instance_id = self.config.instance_id.as_str();
        self.orphans_recovered
            .get_or_try_init(|| async {
                let recovered = self
                    .store
                    .recover_stale_jobs(self.stale_before(), Some(instance_id))
                    .await?;
                for kind in recovered {
                    warn!(
                        kind = %kind,
                        instance_id,
                        "Recovered job left RUNNING by an earlier process; marked FAILED"
                    );
                }
                Ok::<_, IngestError>(())
            })
            .await?;

        for kind in self.store.recover_stale_jobs(self.stale_before(), None).await? {
            warn!(kind = %kind, "Recovered job whose heartbeat stopped; marked FAILED");
        }
        Ok(())
    }

    fn stale_before(&self) -> chrono::DateTime<Utc> {
        let timeout = ChronoDuration::from_std(self.config.stale_job_timeout())
            .unwrap_or_else(|_| ChronoDuration::minutes(10));
        Utc::now() - timeout
    }

    /// Drive `run` while refreshing the job heartbeat in the background
    async fn with_heartbeat<F>(&self, kind: JobKind, run: F) -> IngestResult<RunReport>
    where
        F: Future<Output = IngestResult<RunReport>>,
    {
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick() => {
                    if let Err(e) = self.store.heartbeat_job(kind).await {
                        warn!(kind = %kind, error = %e, "Job heartbeat failed");
                    }
                },
            }
        }
    }

    /// Acquire a new snapshot and process it; the job is already claimed
    async fn run_fresh(&self, kind: JobKind) -> IngestResult<RunReport> {
        let acquired = tokio::select! {
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            result = self.acquisition.acquire(kind) => result,
        };

        let snapshot = match acquired {
            Ok(snapshot) => snapshot,
            Err(IngestError::Cancelled) => {
                info!(kind = %kind, "Acquisition cancelled");
                self.store.release_job(kind, Some("cancelled")).await?;
                return Err(IngestError::Cancelled);
            },
            Err(e) => {
                error!(kind = %kind, category = %e.category(), error = %e, "Acquisition failed");
                self.store.fail_job(kind, &e.to_string()).await?;
                return Err(e);
            },
        };

        self.processor.process(&snapshot, &self.cancel).await
    }

    /// Process a re-claimed snapshot, fetching its artifact again if needed
    async fn run_resumed(&self, snapshot: SnapshotFile) -> IngestResult<RunReport> {
        let ensured = tokio::select! {
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            result = self.acquisition.ensure_artifact(&snapshot) => result,
        };

        match ensured {
            Ok(()) => self.processor.process(&snapshot, &self.cancel).await,
            Err(IngestError::Cancelled) => {
                self.store.release_job(snapshot.kind, Some("cancelled")).await?;
                Err(IngestError::Cancelled)
            },
            Err(e) => {
                let message = e.to_string();
                error!(snapshot_id = %snapshot.id, error = %message, "Re-acquiring artifact failed");
                self.store.fail_snapshot(snapshot.id, e.category(), &message).await?;
                self.store.fail_job(snapshot.kind, &message).await?;
                Err(e)
            },
        }
    }

    /// One scheduled firing; skipped unless the job is IDLE or COMPLETED
    async fn fire(&self, kind: JobKind) {
        match self.claim(kind, &JobState::SCHEDULABLE).await {
            Ok(true) => {
                info!(kind = %kind, "Scheduled sync starting");
                if let Err(e) = self.with_heartbeat(kind, self.run_fresh(kind)).await {
                    warn!(kind = %kind, error = %e, "Scheduled sync did not complete");
                }
            },
            Ok(false) => {
                let state = self
                    .store
                    .job_status(kind)
                    .await
                    .map(|s| s.status.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                info!(kind = %kind, state = %state, "Scheduled sync skipped");
            },
            Err(e) => error!(kind = %kind, error = %e, "Could not claim job"),
        }
    }

    async fn delta_loop(&self, interval: Duration) {
        loop {
            debug!(secs = interval.as_secs(), "Next delta sync scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.fire(JobKind::Delta).await,
            }
        }
        debug!("Delta loop stopped");
    }

    async fn full_loop(&self, schedule: SyncSchedule) {
        loop {
            let Some(next) = schedule.next_full(Utc::now()) else {
                error!("Full sync schedule has no upcoming firing");
                break;
            };
            debug!(at = %next, "Next full sync scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(until(next, Utc::now())) => self.fire(JobKind::Full).await,
            }
        }
        debug!("Full loop stopped");
    }

    async fn cleanup_loop(&self, schedule: SyncSchedule) {
        loop {
            let Some(next) = schedule.next_cleanup(Utc::now()) else {
                error!("Cleanup schedule has no upcoming firing");
                break;
            };
            debug!(at = %next, "Next retention cleanup scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(until(next, Utc::now())) => {
                    if let Err(e) = self.retention.run_once().await {
                        error!(error = %e, "Retention cleanup failed");
                    }
                },
            }
        }
        debug!("Cleanup loop stopped");
    }
}

//! Retention cleanup
//!
//! Keeps the newest raw artifacts per job kind and deletes the rest, oldest
//! first. Only files are removed: snapshot and job rows stay, and a snapshot
//! whose artifact is gone is re-acquired if it is ever resumed.
//!
//! Files in a kind's directory that no snapshot row references (left by a
//! killed process mid-download) are swept too, once they are older than the
//! stale-job timeout and no run of that kind holds the job.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::config::IngestConfig;
use super::error::IngestResult;
use super::models::{JobKind, JobState, ProcessingStatus};
use super::store::IngestStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<PathBuf>,
    /// Unreferenced files removed from the kind directories
    pub orphans: Vec<PathBuf>,
    pub bytes_freed: u64,
    /// Old artifacts left alone because their snapshot is not settled yet
    pub kept_active: usize,
}

#[derive(Clone)]
pub struct RetentionCleaner {
    store: Arc<dyn IngestStore>,
    config: Arc<IngestConfig>,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn IngestStore>, config: Arc<IngestConfig>) -> Self {
        Self { store, config }
    }

    /// One cleanup pass over both job kinds
    pub async fn run_once(&self) -> IngestResult<RetentionReport> {
        let mut report = RetentionReport::default();
        for kind in JobKind::ALL {
            self.clean_kind(kind, &mut report).await?;
        }

        info!(
            deleted = report.deleted.len(),
            orphans = report.orphans.len(),
            bytes_freed = report.bytes_freed,
            kept_active = report.kept_active,
            "Retention cleanup finished"
        );
        Ok(report)
    }

    async fn clean_kind(&self, kind: JobKind, report: &mut RetentionReport) -> IngestResult<()> {
        let keep = self.config.keep_files(kind);
        let snapshots = self.store.list_snapshots(kind).await?;
        let referenced: HashSet<PathBuf> =
            snapshots.iter().map(|s| s.artifact_path.clone()).collect();

        let mut on_disk = Vec::new();
        for snapshot in snapshots {
            if tokio::fs::try_exists(&snapshot.artifact_path).await? {
                on_disk.push(snapshot);
            }
        }

        // Newest first from the store; everything past `keep` goes, oldest first
        for snapshot in on_disk.into_iter().skip(keep).rev() {
            if matches!(
                snapshot.processing_status,
                ProcessingStatus::Pending | ProcessingStatus::InProgress
            ) {
                debug!(snapshot_id = %snapshot.id, "Keeping artifact of unsettled snapshot");
                report.kept_active += 1;
                continue;
            }

            let path = snapshot.artifact_path;
            if let Some(bytes) = remove(&path).await {
                debug!(kind = %kind, snapshot_id = %snapshot.id, path = %path.display(), "Artifact deleted");
                report.bytes_freed += bytes;
                report.deleted.push(path);
            }
        }

        self.sweep_orphans(kind, &referenced, report).await
    }

    async fn sweep_orphans(
        &self,
        kind: JobKind,
        referenced: &HashSet<PathBuf>,
        report: &mut RetentionReport,
    ) -> IngestResult<()> {
        // A running job may be writing a file it has not registered yet
        if self.store.job_status(kind).await?.status == JobState::Running {
            debug!(kind = %kind, "Job running, orphan sweep skipped");
            return Ok(());
        }

        let dir = self.config.kind_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let cutoff = SystemTime::now()
            .checked_sub(self.config.stale_job_timeout())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !metadata.is_file() || referenced.contains(&path) {
                continue;
            }
            if metadata.modified()? > cutoff {
                continue;
            }

            if let Some(bytes) = remove(&path).await {
                info!(kind = %kind, path = %path.display(), "Unreferenced file deleted");
                report.bytes_freed += bytes;
                report.orphans.push(path);
            }
        }
        Ok(())
    }
}

/// Delete `path`, returning its size if it was removed
async fn remove(path: &Path) -> Option<u64> {
    let bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    match tokio::fs::remove_file(path).await {
        Ok(()) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
            None
        },
    }
}

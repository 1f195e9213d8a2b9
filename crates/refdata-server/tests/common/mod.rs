//! Shared helpers for ingestion integration tests
//!
//! - LEI and CSV builders
//! - A fetcher that serves a CSV body from memory
//! - Scheduler setup over the in-memory store

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use refdata_server::ingest::models::{ArtifactInfo, JobKind, SnapshotFile};
use refdata_server::ingest::validation::lei_check_digits;
use refdata_server::ingest::{
    IngestConfig, IngestError, IngestResult, IngestStore, MemoryStore, Scheduler, SnapshotFetcher,
};

pub const HEADER: &str = "LEI,LegalName,Jurisdiction,LegalAddressCountry,EntityStatus,RegistrationStatus,LastUpdateDate";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,refdata_server=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// The i-th test LEI; sorts in numeric order of `i`
pub fn lei(i: usize) -> String {
    let prefix = format!("TESTLEI{:011}", i);
    let check = lei_check_digits(&prefix).expect("prefix is alphanumeric");
    format!("{}{}", prefix, check)
}

pub fn row(i: usize, name: &str, updated: &str) -> String {
    format!(
        "{},{},US-DE,US,ACTIVE,ISSUED,{}",
        lei(i),
        name,
        updated
    )
}

/// A snapshot with records `1..=count`, all valid
pub fn csv(count: usize) -> String {
    let mut body = String::from(HEADER);
    body.push('\n');
    for i in 1..=count {
        body.push_str(&row(i, &format!("Entity {}", i), "2024-01-01T00:00:00Z"));
        body.push('\n');
    }
    body
}

pub fn csv_from_rows(rows: &[String]) -> String {
    let mut body = String::from(HEADER);
    body.push('\n');
    for r in rows {
        body.push_str(r);
        body.push('\n');
    }
    body
}

/// Regular files directly under `dir`; zero if it does not exist
pub fn file_count(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(Result::ok).filter(|e| e.path().is_file()).count(),
        Err(_) => 0,
    }
}

/// Serves whatever body is currently set, written straight to the destination
#[derive(Default)]
pub struct CsvFetcher {
    body: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl CsvFetcher {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: Mutex::new(Some(body.into())),
            calls: AtomicUsize::new(0),
        }
    }

    /// A fetcher whose source is unreachable
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn set_body(&self, body: impl Into<String>) {
        *self.body.lock().unwrap() = Some(body.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for CsvFetcher {
    async fn fetch(&self, source_uri: &str, dest: &Path) -> IngestResult<ArtifactInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self
            .body
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| IngestError::Network(format!("{} returned HTTP 503", source_uri)))?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &body)?;

        Ok(ArtifactInfo {
            path: dest.to_path_buf(),
            sha256: refdata_common::checksum::sha256_file(dest)?,
            bytes: body.len() as i64,
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<CsvFetcher>,
    pub scheduler: Scheduler,
    pub data_dir: TempDir,
}

pub fn config(data_dir: &Path, batch_size: usize) -> IngestConfig {
    IngestConfig {
        data_dir: data_dir.to_path_buf(),
        full_source_url: "https://registry.example/full.csv.gz".to_string(),
        delta_source_url: "https://registry.example/delta.csv.gz".to_string(),
        batch_size,
        ..IngestConfig::default()
    }
}

pub fn harness(fetcher: CsvFetcher, batch_size: usize) -> Harness {
    harness_with(fetcher, |dir| config(dir, batch_size))
}

pub fn harness_with(fetcher: CsvFetcher, build: impl FnOnce(&Path) -> IngestConfig) -> Harness {
    init_tracing();
    let data_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(fetcher);
    let scheduler = Scheduler::new(store.clone(), fetcher.clone(), build(data_dir.path()));
    Harness {
        store,
        fetcher,
        scheduler,
        data_dir,
    }
}

impl Harness {
    /// A new scheduler over the same store, fetcher and data dir, as after a
    /// process restart
    pub fn restart(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.fetcher.clone(),
            self.scheduler.config().clone(),
        )
    }

    pub async fn latest(&self, kind: JobKind) -> SnapshotFile {
        self.store.latest_snapshot(kind).await.unwrap().unwrap()
    }

    /// Write `body` under the data dir and register it as a snapshot
    pub async fn stage_snapshot(
        &self,
        kind: JobKind,
        body: &str,
        edit: impl FnOnce(&mut SnapshotFile),
    ) -> SnapshotFile {
        let path: PathBuf = self
            .data_dir
            .path()
            .join(format!("staged-{}.csv", uuid::Uuid::new_v4().simple()));
        std::fs::write(&path, body).unwrap();

        let mut snapshot = SnapshotFile::registered(
            kind,
            "https://registry.example/staged.csv.gz",
            ArtifactInfo {
                sha256: refdata_common::checksum::sha256_file(&path).unwrap(),
                bytes: body.len() as i64,
                path,
            },
        );
        edit(&mut snapshot);
        self.store.insert_snapshot(&snapshot).await.unwrap();
        snapshot
    }
}

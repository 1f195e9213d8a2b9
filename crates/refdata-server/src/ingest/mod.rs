//! LEI ingestion pipeline
//!
//! Periodically fetches full and delta snapshots of the LEI registry, streams
//! them through validation into the record store in checkpointed batches, and
//! exposes progress to operators.
//!
//! # Architecture
//!
//! - **store**: durable state behind [`store::IngestStore`] (Postgres or in-memory)
//! - **acquisition**: download, decompress and register a snapshot
//! - **reader** / **validation**: lazy CSV stream and per-row checks
//! - **processor**: checkpointed, resumable batch loop
//! - **upsert**: idempotent batch application with audit entries
//! - **scheduler** / **schedule**: timer loops, triggers, resume
//! - **retention**: raw artifact cleanup
//! - **status**: read-side facade used by the HTTP routes
//!
//! # Flow
//!
//! ```text
//! Scheduler -> Acquisition -> snapshot_files (PENDING)
//!           -> StreamingProcessor -> UpsertEngine -> lei_records + record_audit
//!                                 -> checkpoint -> job_status
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod models;
pub mod processor;
pub mod reader;
pub mod retention;
pub mod schedule;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod upsert;
pub mod validation;

pub use acquisition::{Acquisition, HttpFetcher, SnapshotFetcher};
pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use models::{
    AuditEntry, FailureCategory, JobKind, JobState, JobStatus, LeiRecord, ProcessingStatus,
    SnapshotFile,
};
pub use processor::{RunReport, StreamingProcessor};
pub use retention::{RetentionCleaner, RetentionReport};
pub use scheduler::{RunHandle, Scheduler};
pub use status::SyncStatusService;
pub use store::{IngestStore, MemoryStore, PgStore};
pub use upsert::UpsertEngine;

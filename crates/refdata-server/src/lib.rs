//! Refdata Server Library
//!
//! Keeps a local copy of the LEI reference registry in sync with its
//! publisher and serves it over HTTP.
//!
//! # Overview
//!
//! - **Ingestion**: scheduled and operator-triggered FULL and DELTA snapshot
//!   runs with checkpointed, resumable batch processing ([`ingest`])
//! - **API**: job status, triggers, snapshot resume and record queries
//!   ([`features`])
//! - **Database**: PostgreSQL via SQLx, with an in-memory store for tests
//! - **Configuration**: environment-based, see [`config::Config`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use refdata_server::ingest::{HttpFetcher, IngestConfig, MemoryStore, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let fetcher = Arc::new(HttpFetcher::new(&config)?);
//!     let scheduler = Scheduler::new(Arc::new(MemoryStore::new()), fetcher, config);
//!     let report = scheduler.trigger_delta().await?.wait().await?;
//!     println!("processed {}", report.progress.processed_records);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;

// Re-export commonly used types
pub use error::AppError;

//! Sync feature module
//!
//! Operator routes for job status, manual triggers and snapshot resume.
//! Triggers and resumes return as soon as the run is claimed; progress is
//! polled through the status routes.

pub mod routes;

#[cfg(test)]
mod routes_test;

pub use routes::{snapshot_routes, sync_routes};

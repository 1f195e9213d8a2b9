//! Feature modules implementing the refdata API
//!
//! Each feature is a vertical slice with its own routes and route tests.
//!
//! # Features
//!
//! - **sync**: job status, manual triggers and snapshot resume
//! - **records**: record lookups, listing and audit history
//!
//! All handlers share one [`SyncStatusService`], which only reads persisted
//! state, so a request never waits on an in-flight ingestion run.

pub mod records;
pub mod sync;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::ingest::SyncStatusService;

/// Creates the API router with all feature routes mounted
///
/// - `/sync` - job status and triggers
/// - `/snapshots` - snapshot progress and resume
/// - `/records` - record queries
pub fn router(service: Arc<SyncStatusService>) -> Router<()> {
    Router::new()
        .nest("/sync", sync::sync_routes().with_state(service.clone()))
        .nest("/snapshots", sync::snapshot_routes().with_state(service.clone()))
        .nest("/records", records::records_routes().with_state(service))
}

/// Full application: health check plus the versioned API
pub fn app(service: Arc<SyncStatusService>) -> Router<()> {
    Router::new()
        .route("/health", get(health_check))
        .with_state(service.clone())
        .nest("/api/v1", router(service))
        .layer(crate::middleware::tracing_layer())
}

async fn health_check(State(service): State<Arc<SyncStatusService>>) -> impl IntoResponse {
    let scheduler = if service.scheduler().is_running() {
        "running"
    } else {
        "idle"
    };
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "scheduler": scheduler,
        })),
    )
}

//! Sync routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::ingest::{JobKind, RunHandle, SyncStatusService};

/// Create sync routes, mounted under `/sync`
pub fn sync_routes() -> Router<Arc<SyncStatusService>> {
    Router::new()
        .route("/:kind/status", get(get_sync_status))
        .route("/:kind/trigger", post(trigger_sync))
}

/// Create snapshot routes, mounted under `/snapshots`
pub fn snapshot_routes() -> Router<Arc<SyncStatusService>> {
    Router::new()
        .route("/:snapshot_id", get(get_snapshot))
        .route("/:snapshot_id/resume", post(resume_snapshot))
}

fn parse_kind(kind: &str) -> Result<JobKind, AppError> {
    kind.parse().map_err(AppError::BadRequest)
}

fn accepted(run: &RunHandle) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "kind": run.kind,
            "snapshot_id": run.snapshot_id,
            "status": "accepted",
        })),
    )
        .into_response()
}

/// Job state and the snapshot it is working on
///
/// GET /sync/:kind/status
async fn get_sync_status(
    State(service): State<Arc<SyncStatusService>>,
    Path(kind): Path<String>,
) -> Result<Response, AppError> {
    let kind = parse_kind(&kind)?;
    let status = service.job_status(kind).await?;
    Ok((StatusCode::OK, Json(json!(status))).into_response())
}

/// Start a fresh run of one kind
///
/// POST /sync/:kind/trigger
async fn trigger_sync(
    State(service): State<Arc<SyncStatusService>>,
    Path(kind): Path<String>,
) -> Result<Response, AppError> {
    let kind = parse_kind(&kind)?;
    let run = service.trigger(kind).await?;
    Ok(accepted(&run))
}

/// GET /snapshots/:snapshot_id
async fn get_snapshot(
    State(service): State<Arc<SyncStatusService>>,
    Path(snapshot_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let snapshot = service.snapshot(snapshot_id).await?;
    Ok((StatusCode::OK, Json(json!(snapshot))).into_response())
}

/// Continue a snapshot from its checkpoint
///
/// POST /snapshots/:snapshot_id/resume
async fn resume_snapshot(
    State(service): State<Arc<SyncStatusService>>,
    Path(snapshot_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let run = service.resume(snapshot_id).await?;
    Ok(accepted(&run))
}

//! Record routes
//!
//! Public read-only routes over the record store.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::AppError;
use crate::ingest::SyncStatusService;

#[derive(Debug, Default, Deserialize)]
pub struct ListRecordsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Create record routes, mounted under `/records`
pub fn records_routes() -> Router<Arc<SyncStatusService>> {
    Router::new()
        .route("/", get(list_records))
        .route("/:lei", get(get_record))
        .route("/:lei/audit", get(get_audit_history))
}

/// List records ordered by LEI
///
/// GET /records?limit=100&offset=0
async fn list_records(
    State(service): State<Arc<SyncStatusService>>,
    Query(query): Query<ListRecordsQuery>,
) -> Result<Response, AppError> {
    let records = service.list_records(query.limit, query.offset).await?;
    Ok((StatusCode::OK, Json(json!({ "data": records }))).into_response())
}

/// GET /records/:lei
async fn get_record(
    State(service): State<Arc<SyncStatusService>>,
    Path(lei): Path<String>,
) -> Result<Response, AppError> {
    let record = service.get_record(&lei.to_uppercase()).await?;
    Ok((StatusCode::OK, Json(json!(record))).into_response())
}

/// GET /records/:lei/audit
async fn get_audit_history(
    State(service): State<Arc<SyncStatusService>>,
    Path(lei): Path<String>,
) -> Result<Response, AppError> {
    let history = service.audit_history(&lei.to_uppercase()).await?;
    Ok((StatusCode::OK, Json(json!({ "data": history }))).into_response())
}

//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ingest::{IngestError, store::StoreError};

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Retry exhausted: {0}")]
    RetryExhausted(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RetryExhausted(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::NotFound(msg) => AppError::NotFound(msg),
            IngestError::Store(StoreError::NotFound(msg)) => AppError::NotFound(msg),
            IngestError::Conflict(msg) => AppError::Conflict(msg),
            e @ (IngestError::RetryExhausted { .. } | IngestError::NotRetryable { .. }) => {
                AppError::RetryExhausted(e.to_string())
            },
            IngestError::BadRequest(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match self {
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                "An internal error occurred".to_string()
            },
            AppError::NotFound(message)
            | AppError::Conflict(message)
            | AppError::RetryExhausted(message)
            | AppError::BadRequest(message) => message,
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

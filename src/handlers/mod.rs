pub mod status;
pub mod update;
pub mod value;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::model::ProtocolError;
use crate::storage::StorageError;

// ─── Unified error type ──────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    /// Malformed request: bad JSON, unknown kind, non-numeric value.
    BadRequest(String),
    NotFound(String),
    /// Well-formed, but the store cannot apply it (counter overflow).
    Unprocessable(String),
    Internal(String),
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        if e.is_not_found() {
            Self::NotFound(e.to_string())
        } else if e.is_rejection() {
            tracing::warn!(error = %e, "merge refused");
            Self::Unprocessable(e.to_string())
        } else {
            tracing::error!(error = %e, "storage failure");
            Self::Internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error":  message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

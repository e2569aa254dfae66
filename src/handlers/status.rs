use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::model::MetricsPack;
use crate::server::AppState;

use super::ApiError;

// ─── GET / ───────────────────────────────────────────────────────

/// The whole table as one JSON document.
pub async fn index(State(state): State<Arc<AppState>>) -> Result<Json<MetricsPack>, ApiError> {
    Ok(Json(state.service.snapshot().await?))
}

// ─── GET /ping ───────────────────────────────────────────────────

pub async fn ping(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.service.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, backend = state.service.store().name(), "ping failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

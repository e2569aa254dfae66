use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::model::{MetricKind, MetricQuery, MetricRecord};
use crate::server::AppState;

use super::ApiError;

// ─── GET /value/:kind/:name ──────────────────────────────────────

/// Plain-text current value. An unknown kind is reported as not found,
/// the same as an unknown name.
pub async fn value_uri(
    State(state): State<Arc<AppState>>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let kind: MetricKind = kind
        .parse()
        .map_err(|e: crate::model::ProtocolError| ApiError::NotFound(e.to_string()))?;
    let value = state.service.value(kind, &name).await?;
    Ok(value.to_string())
}

// ─── POST /value/ ────────────────────────────────────────────────

pub async fn value_json(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<MetricRecord>, ApiError> {
    let query: MetricQuery = serde_json::from_slice(&body)?;
    let kind: MetricKind = query.kind.parse()?;
    let value = state.service.value(kind, &query.id).await?;
    Ok(Json(MetricRecord { id: query.id, value }))
}

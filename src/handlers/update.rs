use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::model::{MetricKind, MetricRecord, MetricValue, MetricsPack};
use crate::server::AppState;

use super::ApiError;

#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    pub accepted: usize,
}

// ─── POST /update/ ───────────────────────────────────────────────

/// Merge one JSON record and echo the value now stored.
pub async fn update_json(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<MetricRecord>, ApiError> {
    let record: MetricRecord = serde_json::from_slice(&body)?;
    tracing::debug!(metric = %record.id, kind = %record.kind(), "update");
    let stored = state.service.update(record).await?;
    Ok(Json(stored))
}

// ─── POST /update/:kind/:name/:value ─────────────────────────────

pub async fn update_uri(
    State(state): State<Arc<AppState>>,
    Path((kind, name, raw)): Path<(String, String, String)>,
) -> Result<String, ApiError> {
    let kind: MetricKind = kind.parse()?;
    let value = MetricValue::parse(kind, &raw)?;
    let stored = state.service.update(MetricRecord { id: name, value }).await?;
    Ok(stored.value.to_string())
}

// ─── POST /updates/ ──────────────────────────────────────────────

/// Merge a `{metrics:[...]}` document as one batch.
pub async fn update_batch(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<BatchAccepted>, ApiError> {
    let pack: MetricsPack = serde_json::from_slice(&body)?;
    tracing::debug!(count = pack.len(), "batch update");
    let accepted = state.service.update_batch(pack.metrics).await?;
    Ok(Json(BatchAccepted { accepted }))
}

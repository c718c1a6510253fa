//! Trace upload and query handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracekeep_core::{ConversationTrace, UploadPayload};

use crate::db::IngestSummary;
use crate::error::AppError;
use crate::ServerState;

const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub received: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TracesListResponse {
    pub traces: Vec<ConversationTrace>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTracesQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// POST /api/traces - Receive a batch from a collector.
pub async fn ingest(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<UploadPayload>,
) -> Result<Json<IngestResponse>, AppError> {
    let received = state.store.insert_payload(&payload).map_err(|e| {
        tracing::error!("Failed to store upload: {}", e);
        AppError::Internal("failed to store upload".into())
    })?;

    tracing::info!(
        received,
        feedback = payload.feedback.len(),
        tool_calls = payload.tool_call_summary.total_tool_calls,
        "Received trace upload"
    );
    Ok(Json(IngestResponse {
        success: true,
        received,
    }))
}

/// GET /api/traces - List received traces, newest first.
pub async fn list(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ListTracesQuery>,
) -> Result<Json<TracesListResponse>, AppError> {
    let traces = state
        .store
        .list_traces(params.limit.unwrap_or(DEFAULT_PAGE_SIZE), params.offset.unwrap_or(0))
        .map_err(|e| {
            tracing::error!("Failed to list traces: {}", e);
            AppError::Internal("failed to list traces".into())
        })?;

    Ok(Json(TracesListResponse { traces }))
}

/// GET /api/traces/{id}
pub async fn get(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<ConversationTrace>, AppError> {
    let trace = state
        .store
        .get_trace(&trace_id)
        .map_err(|e| {
            tracing::error!("Failed to get trace: {}", e);
            AppError::Internal("failed to get trace".into())
        })?
        .ok_or_else(|| AppError::NotFound("trace not found".into()))?;

    Ok(Json(trace))
}

/// GET /api/metrics/summary - Aggregate figures over all uploads.
pub async fn metrics_summary(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<IngestSummary>, AppError> {
    let summary = state.store.get_summary()?;
    Ok(Json(summary))
}

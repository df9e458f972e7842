//! Record handlers

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::api::server::AppState;
use crate::error::JunctionError;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize, Default)]
pub struct ListRecordsQuery {
    pub limit: Option<usize>,
}

/// Recent records, newest first
pub async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<ListRecordsQuery>,
) -> impl IntoResponse {
    Json(state.records.snapshot(query.limit.unwrap_or(DEFAULT_LIMIT)))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, JunctionError> {
    state
        .records
        .get(id)
        .map(Json)
        .ok_or_else(|| JunctionError::NotFound(format!("record {}", id)))
}

pub async fn record_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.records.stats())
}

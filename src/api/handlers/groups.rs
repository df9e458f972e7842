//! Server group handlers

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::api::server::AppState;
use crate::error::JunctionError;

/// Body of a manual selection
#[derive(Debug, Deserialize)]
pub struct SelectMemberRequest {
    pub member: String,
}

/// List all groups with their current state
pub async fn list_groups(State(state): State<AppState>) -> impl IntoResponse {
    let groups: Vec<_> = state
        .resolver
        .groups()
        .iter()
        .map(|group| group.snapshot())
        .collect();
    Json(groups)
}

/// Get a single group
pub async fn get_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, JunctionError> {
    let group = state
        .resolver
        .group(&name)
        .ok_or_else(|| JunctionError::NotFound(format!("group {}", name)))?;
    Ok(Json(group.snapshot()))
}

/// Pin a member of a `select` group
pub async fn select_member(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SelectMemberRequest>,
) -> Result<impl IntoResponse, JunctionError> {
    let group = state
        .resolver
        .group(&name)
        .ok_or_else(|| JunctionError::NotFound(format!("group {}", name)))?;

    group.select(&req.member)?;
    Ok(Json(group.snapshot()))
}

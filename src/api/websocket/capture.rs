//! Capture WebSocket handler
//!
//! Streams traffic frames tapped by the pump. Payloads are base64 encoded.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::response::IntoResponse;

use super::stream_broadcast;
use crate::api::server::AppState;
use crate::error::JunctionError;

pub async fn capture_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, JunctionError> {
    let frames = state.pump.subscribe().ok_or_else(|| {
        JunctionError::NotFound("traffic capture is disabled (set general.allow_dump)".to_string())
    })?;
    Ok(ws
        .on_upgrade(move |socket| stream_broadcast(socket, frames, "Capture"))
        .into_response())
}

//! Record WebSocket handler
//!
//! Streams every record state change as JSON.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;

use super::stream_broadcast;
use crate::api::server::AppState;

pub async fn records_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let updates = state.records.subscribe();
    ws.on_upgrade(move |socket| stream_broadcast(socket, updates, "Records"))
}

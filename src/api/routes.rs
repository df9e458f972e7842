//! API route definitions

use axum::routing::{get, put};
use axum::Router;

use super::handlers;
use super::server::AppState;
use super::websocket;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // Server groups
        .route("/groups", get(handlers::groups::list_groups))
        .route("/groups/:name", get(handlers::groups::get_group))
        .route(
            "/groups/:name/selected",
            put(handlers::groups::select_member),
        )
        // Records
        .route("/records", get(handlers::records::list_records))
        .route("/records/stats", get(handlers::records::record_stats))
        .route("/records/:id", get(handlers::records::get_record))
        // WebSocket endpoints
        .route("/ws/records", get(websocket::records::records_ws))
        .route("/ws/capture", get(websocket::capture::capture_ws))
}

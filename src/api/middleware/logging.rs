//! Request logging middleware

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{debug, warn};

/// Request logging middleware
pub struct RequestLogging;

impl RequestLogging {
    /// Log method, path, status and latency of every API call
    pub async fn log_request(req: Request<Body>, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = Instant::now();

        let response = next.run(req).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let status = response.status().as_u16();
        if response.status().is_server_error() {
            warn!(%method, %path, status, elapsed_ms, "API request failed");
        } else {
            debug!(%method, %path, status, elapsed_ms, "API request");
        }

        response
    }
}

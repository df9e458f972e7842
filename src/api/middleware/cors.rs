//! CORS configuration for the control API

use axum::http::header;
use axum::http::{HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

const LOCAL_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:3000"];

/// Create a CORS layer with the specified allowed origins.
///
/// An empty list allows local development origins only.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = if allowed_origins.is_empty() {
        debug!("CORS: No origins specified, allowing localhost only");
        LOCAL_ORIGINS
            .iter()
            .map(|o| HeaderValue::from_static(o))
            .collect()
    } else {
        debug!("CORS: Allowing origins: {:?}", allowed_origins);
        allowed_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("CORS: ignoring invalid origin {}", o);
                    None
                }
            })
            .collect()
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{get, put};
    use tower::ServiceExt;

    async fn allowed_origin(origins: &[String], method: Method, origin: &str) -> Option<String> {
        let app = axum::Router::new()
            .route("/api/groups", get(|| async { "[]" }))
            .route("/api/groups/:name/selected", put(|| async { "{}" }))
            .layer(cors_layer(origins));

        let mut request = Request::builder()
            .method(method.clone())
            .uri("/api/groups/Proxy/selected")
            .header("Origin", origin);
        if method == Method::OPTIONS {
            request = request.header("Access-Control-Request-Method", "PUT");
        }

        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response
            .headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_default_origins_are_local_only() {
        assert_eq!(
            allowed_origin(&[], Method::PUT, "http://127.0.0.1:3000").await.as_deref(),
            Some("http://127.0.0.1:3000")
        );
        assert!(allowed_origin(&[], Method::PUT, "https://example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_configured_origin_passes_preflight() {
        let origins = vec!["https://ops.example.com".to_string()];
        assert_eq!(
            allowed_origin(&origins, Method::OPTIONS, "https://ops.example.com").await.as_deref(),
            Some("https://ops.example.com")
        );
        assert!(allowed_origin(&origins, Method::PUT, "http://localhost:3000").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_origin_is_skipped() {
        let origins = vec!["bad\norigin".to_string(), "https://ops.example.com".to_string()];
        assert_eq!(
            allowed_origin(&origins, Method::PUT, "https://ops.example.com").await.as_deref(),
            Some("https://ops.example.com")
        );
    }
}

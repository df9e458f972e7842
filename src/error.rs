use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the Junction proxy
#[derive(Error, Debug)]
pub enum JunctionError {
    // Inbound errors
    #[error("Malformed request: {0}")]
    Parse(String),

    #[error("Proxy authentication failed")]
    AuthenticationFailed,

    // Routing errors
    #[error("No rule matched {target}")]
    NoRoute { target: String },

    #[error("Request rejected by rule")]
    Rejected,

    #[error("Routing cycle detected at group {name}")]
    Cycle { name: String },

    #[error("Unknown routing target: {0}")]
    UnknownTarget(String),

    // Outbound errors
    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Dial to {server} timed out after {timeout_ms}ms")]
    DialTimeout { server: String, timeout_ms: u64 },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    // Interception errors
    #[error("MITM error: {0}")]
    Mitm(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to decode profile: {0}")]
    ConfigDecode(#[from] toml::de::Error),

    #[error("Failed to encode profile: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    // API errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Junction operations
pub type Result<T> = std::result::Result<T, JunctionError>;

impl JunctionError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            JunctionError::Parse(_)
            | JunctionError::InvalidRequest(_)
            | JunctionError::UnsupportedProtocol(_)
            | JunctionError::InvalidConfig(_)
            | JunctionError::ConfigDecode(_) => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            JunctionError::Rejected => StatusCode::FORBIDDEN,

            // 404 Not Found
            JunctionError::NotFound(_)
            | JunctionError::UnknownTarget(_)
            | JunctionError::NoRoute { .. } => StatusCode::NOT_FOUND,

            // 407 Proxy Authentication Required
            JunctionError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            JunctionError::Dial(_)
            | JunctionError::Mitm(_)
            | JunctionError::Tls(_)
            | JunctionError::Transport(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            JunctionError::DialTimeout { .. } | JunctionError::Timeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }

            // 500 Internal Server Error
            JunctionError::Cycle { .. }
            | JunctionError::Certificate(_)
            | JunctionError::ConfigEncode(_)
            | JunctionError::Io(_)
            | JunctionError::Http(_)
            | JunctionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Whether the error is a timeout of a bounded operation
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            JunctionError::DialTimeout { .. } | JunctionError::Timeout(_)
        )
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for JunctionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for JunctionError {
    fn from(err: hyper::Error) -> Self {
        JunctionError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for JunctionError {
    fn from(err: url::ParseError) -> Self {
        JunctionError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            JunctionError::Parse("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            JunctionError::AuthenticationFailed.status_code(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
        assert_eq!(JunctionError::Rejected.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            JunctionError::NotFound("group".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            JunctionError::DialTimeout {
                server: "JP1".to_string(),
                timeout_ms: 10
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            JunctionError::Dial("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            JunctionError::Cycle {
                name: "A".to_string()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(JunctionError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(!JunctionError::InvalidRequest("bad".to_string()).is_server_error());

        assert!(JunctionError::Internal("boom".to_string()).is_server_error());
        assert!(!JunctionError::Internal("boom".to_string()).is_client_error());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(JunctionError::Timeout("TLS handshake").is_timeout());
        assert!(JunctionError::DialTimeout {
            server: "US1".to_string(),
            timeout_ms: 5000
        }
        .is_timeout());
        assert!(!JunctionError::Dial("refused".to_string()).is_timeout());
    }
}

use crate::error::{JunctionError, Result};
use std::env;
use std::path::PathBuf;

/// Process settings loaded from environment variables.
///
/// Routing itself (listeners, servers, groups, rules) lives in the TOML
/// profile pointed to by `profile_path`; see [`crate::models::Profile`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the routing profile
    pub profile_path: PathBuf,
    /// Proxy runtime configuration
    pub proxy: ProxyServerConfig,
    /// Record registry configuration
    pub records: RecordConfig,
    /// API server configuration
    pub api: ApiServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Upstream dial timeout in seconds
    pub connect_timeout: u64,
    /// TLS interception handshake timeout in seconds
    pub mitm_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct RecordConfig {
    /// Capacity of the record event queue
    pub queue_size: usize,
    /// Number of records kept in memory
    pub history: usize,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Whether the control API is started
    pub enabled: bool,
    /// Port for the API server (default: 9090)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level override (debug, info, warn, error); falls back to the profile
    pub level: Option<String>,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            profile_path: PathBuf::from(get_env_or("JUNCTION_PROFILE", "junction.toml")),
            proxy: ProxyServerConfig {
                connect_timeout: get_env_positive("PROXY_CONNECT_TIMEOUT", "10")?,
                mitm_timeout: get_env_positive("PROXY_MITM_TIMEOUT", "10")?,
            },
            records: RecordConfig {
                queue_size: get_env_positive("RECORD_QUEUE_SIZE", "1024")?,
                history: get_env_or("RECORD_HISTORY", "500").parse().map_err(|_| {
                    JunctionError::InvalidConfig("RECORD_HISTORY must be a valid number".into())
                })?,
            },
            api: ApiServerConfig {
                enabled: get_env_or("API_ENABLED", "true").parse().unwrap_or(true),
                port: get_env_or("API_PORT", "9090").parse().map_err(|_| {
                    JunctionError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "127.0.0.1"),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            log: LogConfig {
                level: env::var("LOG_LEVEL").ok().filter(|s| !s.trim().is_empty()),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse a numeric setting that must be greater than zero
fn get_env_positive<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    get_env_or(key, default)
        .trim()
        .parse::<T>()
        .ok()
        .filter(|value| *value > T::default())
        .ok_or_else(|| JunctionError::InvalidConfig(format!("{} must be a positive number", key)))
}

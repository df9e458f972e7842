//! Junction - rule-based traffic routing proxy
//!
//! ## Features
//!
//! - HTTP and CONNECT inbound listeners with optional Basic/Bearer auth
//! - Ordered routing rules (domain, suffix, keyword, CIDR, GeoIP, final)
//! - Server groups with manual selection or latency-based selection
//! - Direct, HTTP CONNECT and SOCKS5 dialers
//! - Optional TLS interception and traffic capture
//! - Connection records and live streams over a control API

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{JunctionError, Result};

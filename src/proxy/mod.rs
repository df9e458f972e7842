//! Proxy core
//!
//! This module provides the request path of the proxy:
//! - Connection wrapping and HTTP/CONNECT inbound handling
//! - Rule matching and server group resolution
//! - Outbound dialers and optional TLS interception
//! - The transport pump and latency probing

pub mod auth;
pub mod conn;
pub mod group;
pub mod handler;
pub mod inbound;
pub mod mitm;
pub mod outbound;
pub mod probe;
pub mod pump;
pub mod resolver;
pub mod rules;
pub mod server;

pub use auth::ProxyAuth;
pub use conn::Connection;
pub use handler::{DownstreamHandler, ProxyOptions};
pub use probe::LatencyProber;
pub use pump::{CaptureFrame, TransportPump};
pub use resolver::{Resolver, Router};
pub use server::ProxyServer;

//! Outbound dialers
//!
//! Each server type maps to a [`Dialer`] that opens a stream to the request
//! target through that server.

mod direct;
mod http;
mod socks5;

pub use self::direct::DirectDialer;
pub use self::http::HttpConnectDialer;
pub use self::socks5::Socks5Dialer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::error::{JunctionError, Result};
use crate::models::{Request, Server};
use crate::proxy::conn::Connection;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a connection to the request target through `server`
    async fn dial(&self, server: &Server, request: &Request) -> Result<Connection>;
}

/// Refuses every request
pub struct RejectDialer;

#[async_trait]
impl Dialer for RejectDialer {
    async fn dial(&self, _server: &Server, _request: &Request) -> Result<Connection> {
        Err(JunctionError::Rejected)
    }
}

/// Server type -> dialer
pub struct DialRegistry {
    dialers: HashMap<String, Arc<dyn Dialer>>,
}

impl Default for DialRegistry {
    fn default() -> Self {
        let mut registry = Self {
            dialers: HashMap::new(),
        };
        let http: Arc<dyn Dialer> = Arc::new(HttpConnectDialer);
        registry.register("direct", Arc::new(DirectDialer));
        registry.register("reject", Arc::new(RejectDialer));
        registry.register("http", http.clone());
        registry.register("https", http);
        registry.register("socks5", Arc::new(Socks5Dialer));
        registry
    }
}

impl DialRegistry {
    pub fn register(&mut self, typ: &str, dialer: Arc<dyn Dialer>) {
        self.dialers.insert(typ.to_lowercase(), dialer);
    }

    pub fn supports(&self, typ: &str) -> bool {
        self.dialers.contains_key(&typ.to_lowercase())
    }

    #[instrument(skip_all, fields(server = %server.name, target = %request.host_port()))]
    pub async fn dial(&self, server: &Server, request: &Request) -> Result<Connection> {
        let dialer = self
            .dialers
            .get(&server.typ.to_lowercase())
            .ok_or_else(|| JunctionError::UnsupportedProtocol(server.typ.clone()))?;
        dialer.dial(server, request).await
    }
}

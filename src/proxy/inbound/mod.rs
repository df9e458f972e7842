//! Inbound listeners
//!
//! An inbound accepts client connections, runs the protocol handshake and
//! hands every resulting request to an [`InboundHandler`].

pub mod http;
pub mod message;

pub use self::http::{HttpInbound, HttpReplayConn};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{JunctionError, Result};
use crate::models::{ListenerConfig, Request};
use crate::proxy::conn::Connection;

/// Client half handed to the downstream handler
pub enum ClientSide {
    /// Raw connection after a CONNECT handshake
    Tunnel(Connection),
    /// Single parsed plain-HTTP request awaiting replay upstream
    Replay(HttpReplayConn),
}

impl ClientSide {
    pub fn id(&self) -> u64 {
        match self {
            ClientSide::Tunnel(conn) => conn.id(),
            ClientSide::Replay(conn) => conn.id(),
        }
    }
}

/// A routed request together with the client side that produced it
pub struct Downstream {
    pub request: Request,
    pub client: ClientSide,
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, downstream: Downstream);
}

#[async_trait]
pub trait Inbound: Send + Sync {
    fn typ(&self) -> &'static str;

    fn addr(&self) -> &str;

    /// Accept connections until `shutdown` flips to true
    async fn serve(
        self: Box<Self>,
        handler: Arc<dyn InboundHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

pub type InboundFactory = fn(&ListenerConfig) -> Result<Box<dyn Inbound>>;

/// Listener type name -> constructor
pub struct InboundRegistry {
    factories: HashMap<String, InboundFactory>,
}

impl Default for InboundRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("http", HttpInbound::from_config);
        registry.register("https", HttpInbound::from_config);
        registry
    }
}

impl InboundRegistry {
    pub fn register(&mut self, typ: &str, factory: InboundFactory) {
        self.factories.insert(typ.to_lowercase(), factory);
    }

    pub fn build(&self, listener: &ListenerConfig) -> Result<Box<dyn Inbound>> {
        let factory = self
            .factories
            .get(&listener.typ.to_lowercase())
            .ok_or_else(|| JunctionError::UnsupportedProtocol(listener.typ.clone()))?;
        factory(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn listener(typ: &str, params: &[(&str, &str)]) -> ListenerConfig {
        ListenerConfig {
            typ: typ.to_string(),
            addr: "127.0.0.1:0".to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_registry_builds_known_types() {
        let registry = InboundRegistry::default();
        let http = registry.build(&listener("http", &[])).unwrap();
        assert_eq!(http.typ(), "http");
        assert_eq!(http.addr(), "127.0.0.1:0");
        assert!(registry.build(&listener("HTTPS", &[])).is_ok());
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let registry = InboundRegistry::default();
        assert!(matches!(
            registry.build(&listener("socks5", &[])),
            Err(JunctionError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_registry_checks_body_limit() {
        let registry = InboundRegistry::default();
        assert!(registry
            .build(&listener("http", &[("max_body_size", "1048576")]))
            .is_ok());
        for bad in ["0", "lots"] {
            assert!(matches!(
                registry.build(&listener("http", &[("max_body_size", bad)])),
                Err(JunctionError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_registry_surfaces_auth_errors() {
        let registry = InboundRegistry::default();
        assert!(matches!(
            registry.build(&listener("http", &[("auth_type", "basic")])),
            Err(JunctionError::InvalidConfig(_))
        ));
    }
}

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::Dialer;
use crate::error::{JunctionError, Result};
use crate::models::{Request, Server};
use crate::proxy::conn::Connection;

/// Connects straight to the request target
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, _server: &Server, request: &Request) -> Result<Connection> {
        let addr = request.host_port();
        debug!("Establishing direct connection to {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| JunctionError::Dial(format!("direct connect to {} failed: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();

        let conn = Connection::wrap(stream);
        if let Some(peer) = peer {
            conn.set_peer_addr(peer);
        }
        Ok(conn)
    }
}

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::Dialer;
use crate::error::{JunctionError, Result};
use crate::models::{Request, Server};
use crate::proxy::conn::Connection;
use crate::proxy::inbound::message::{parse_response_head, MAX_HEAD_SIZE};

/// Tunnels through an upstream HTTP proxy with CONNECT
pub struct HttpConnectDialer;

#[async_trait]
impl Dialer for HttpConnectDialer {
    async fn dial(&self, server: &Server, request: &Request) -> Result<Connection> {
        let proxy_addr = server.address();
        debug!("Connecting to HTTP proxy at {}", proxy_addr);

        let (stream, leftover) = connect_via_http_proxy(server, &proxy_addr, request)
            .await
            .map_err(|e| {
                JunctionError::Dial(format!(
                    "HTTP proxy {} ({} -> {}): {}",
                    server.name,
                    proxy_addr,
                    request.host_port(),
                    e
                ))
            })?;

        debug!("HTTP CONNECT tunnel established");
        let mut conn = Connection::wrap(stream);
        conn.push_prefix(leftover.freeze());
        Ok(conn)
    }
}

fn build_connect_request(server: &Server, authority: &str) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(user) = server.param("user") {
        let password = server.param("password").unwrap_or("");
        let credentials = format!("{}:{}", user, password);
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    request
}

async fn connect_via_http_proxy(
    server: &Server,
    proxy_addr: &str,
    request: &Request,
) -> std::result::Result<(TcpStream, BytesMut), anyhow::Error> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    let _ = stream.set_nodelay(true);

    let connect = build_connect_request(server, &request.host_port());
    stream.write_all(connect.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(1024);
    let (head, head_len) = loop {
        if let Some(parsed) = parse_response_head(&buf)? {
            break parsed;
        }
        if buf.len() > MAX_HEAD_SIZE {
            anyhow::bail!("CONNECT response head too large");
        }
        if stream.read_buf(&mut buf).await? == 0 {
            anyhow::bail!("proxy closed connection during CONNECT");
        }
    };

    if head.status != 200 {
        anyhow::bail!("CONNECT failed with status {}", head.status);
    }

    let _ = buf.split_to(head_len);
    Ok((stream, buf))
}

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use super::Dialer;
use crate::error::{JunctionError, Result};
use crate::models::{Request, Server};
use crate::proxy::conn::Connection;

/// Connects through an upstream SOCKS5 proxy
pub struct Socks5Dialer;

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, server: &Server, request: &Request) -> Result<Connection> {
        let proxy_addr = server.address();
        debug!("Connecting to SOCKS5 proxy at {}", proxy_addr);

        let stream = connect_via_socks5_proxy(server, &proxy_addr, request)
            .await
            .map_err(|e| {
                JunctionError::Dial(format!(
                    "SOCKS5 proxy {} ({} -> {}): {}",
                    server.name,
                    proxy_addr,
                    request.host_port(),
                    e
                ))
            })?;

        debug!("SOCKS5 connection established");
        Ok(Connection::wrap(stream))
    }
}

async fn connect_via_socks5_proxy(
    server: &Server,
    proxy_addr: &str,
    request: &Request,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy_addr).await?;
    let _ = socket.set_nodelay(true);
    let target = (request.domain(), request.port());

    let stream = match (server.param("user"), server.param("password")) {
        (Some(user), Some(password)) => {
            Socks5Stream::connect_with_password_and_socket(socket, target, user, password).await?
        }
        _ => Socks5Stream::connect_with_socket(socket, target).await?,
    };

    Ok(stream.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_connect_via_socks5_proxy_tunnels_bytes() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        let target_task = tokio::spawn(async move {
            let (mut stream, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        // Minimal SOCKS5 proxy with username/password auth
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let proxy_task = tokio::spawn(async move {
            let (mut client, _) = proxy_listener.accept().await.unwrap();

            let mut header = [0u8; 2];
            client.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 0x05);
            let mut methods = vec![0u8; header[1] as usize];
            client.read_exact(&mut methods).await.unwrap();
            assert!(methods.contains(&0x02));
            client.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth_head = [0u8; 2];
            client.read_exact(&mut auth_head).await.unwrap();
            let mut uname = vec![0u8; auth_head[1] as usize];
            client.read_exact(&mut uname).await.unwrap();
            let mut plen = [0u8; 1];
            client.read_exact(&mut plen).await.unwrap();
            let mut passwd = vec![0u8; plen[0] as usize];
            client.read_exact(&mut passwd).await.unwrap();
            assert_eq!(uname, b"root");
            assert_eq!(passwd, b"123123");
            client.write_all(&[0x01, 0x00]).await.unwrap();

            let mut req_head = [0u8; 4];
            client.read_exact(&mut req_head).await.unwrap();
            assert_eq!(req_head[1], 0x01);
            assert_eq!(req_head[3], 0x01);
            let mut dst_ip = [0u8; 4];
            client.read_exact(&mut dst_ip).await.unwrap();
            let mut dst_port = [0u8; 2];
            client.read_exact(&mut dst_port).await.unwrap();
            let dest = std::net::SocketAddr::from((
                std::net::Ipv4Addr::from(dst_ip),
                u16::from_be_bytes(dst_port),
            ));
            assert_eq!(dest, target_addr);

            let mut server = TcpStream::connect(dest).await.unwrap();
            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut relay_buf = [0u8; 64];
            let n = client.read(&mut relay_buf).await.unwrap();
            server.write_all(&relay_buf[..n]).await.unwrap();
            let n = server.read(&mut relay_buf).await.unwrap();
            client.write_all(&relay_buf[..n]).await.unwrap();
        });

        let mut params = BTreeMap::new();
        params.insert("user".to_string(), "root".to_string());
        params.insert("password".to_string(), "123123".to_string());
        let server = Server::new("JP1", "socks5", "127.0.0.1", proxy_addr.port()).with_params(params);
        let request = Request::new(Protocol::Https, "127.0.0.1", Some(target_addr.port()), "", 1);

        let mut conn = Socks5Dialer.dial(&server, &request).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        timeout(Duration::from_secs(1), conn.read_exact(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&out, b"ping");

        proxy_task.await.unwrap();
        target_task.await.unwrap();
    }
}

//! HTTP proxy inbound
//!
//! Serves plain HTTP proxy requests and CONNECT tunnels on one listener.
//! Plain requests are dispatched concurrently; a CONNECT ends the request
//! loop and turns the connection into a tunnel.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::message::{MessageReader, ParsedRequest, DEFAULT_MAX_BODY_SIZE};
use super::{ClientSide, Downstream, Inbound, InboundHandler};
use crate::error::{JunctionError, Result};
use crate::models::{ListenerConfig, Protocol, Request};
use crate::proxy::auth::ProxyAuth;
use crate::proxy::conn::Connection;

pub type SharedWriter = Arc<Mutex<WriteHalf<Connection>>>;

pub struct HttpInbound {
    addr: String,
    auth: ProxyAuth,
    max_body: usize,
}

impl HttpInbound {
    pub fn new(addr: impl Into<String>, auth: ProxyAuth) -> Self {
        Self {
            addr: addr.into(),
            auth,
            max_body: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Listener params: auth keys plus optional `max_body_size` in bytes
    pub fn from_config(listener: &ListenerConfig) -> Result<Box<dyn Inbound>> {
        let auth = ProxyAuth::from_params(&listener.params)?;
        let mut inbound = Self::new(listener.addr.clone(), auth);
        if let Some(raw) = listener.params.get("max_body_size") {
            let max_body = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| {
                    JunctionError::InvalidConfig(format!("invalid max_body_size: {}", raw))
                })?;
            inbound = inbound.with_max_body(max_body);
        }
        Ok(Box::new(inbound))
    }

    /// Run the request loop for one client connection
    pub async fn handle_connection(
        conn: Connection,
        auth: &ProxyAuth,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<()> {
        Self::handle_connection_with_limit(conn, auth, DEFAULT_MAX_BODY_SIZE, handler).await
    }

    /// Request loop with an explicit cap on buffered request bodies
    #[instrument(skip_all, fields(conn_id = conn.id()))]
    pub async fn handle_connection_with_limit(
        conn: Connection,
        auth: &ProxyAuth,
        max_body: usize,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<()> {
        let conn_id = conn.id();
        let meta = conn.meta_handle();
        let (read_half, write_half) = tokio::io::split(conn);
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));
        let mut reader = MessageReader::new(read_half).with_max_body(max_body);
        let mut children = JoinSet::new();

        loop {
            // Dropping `children` on an early return aborts in-flight requests
            let mut parsed = match reader.read_request().await? {
                Some(parsed) => parsed,
                None => {
                    drain(&mut children).await;
                    let _ = writer.lock().await.shutdown().await;
                    debug!("Client closed connection");
                    return Ok(());
                }
            };

            if let Err(e) = auth.validate(&parsed) {
                let mut w = writer.lock().await;
                let _ = w
                    .write_all(&auth.challenge_response(parsed.version_str()))
                    .await;
                let _ = w.shutdown().await;
                return Err(e);
            }

            let (host, port) = parsed.target_authority()?;

            if parsed.is_connect() {
                {
                    let mut w = writer.lock().await;
                    let reply = format!("{} 200 Connection established\r\n\r\n", parsed.version_str());
                    w.write_all(reply.as_bytes()).await?;
                    w.flush().await?;
                }

                let request =
                    Request::new(Protocol::Https, &host, port, parsed.target.clone(), conn_id);
                debug!(target = %request.host_port(), "CONNECT accepted");

                // Earlier pipelined responses must reach the client before tunnel bytes
                drain(&mut children).await;

                let (read_half, leftover) = reader.into_parts();
                let write_half = Arc::try_unwrap(writer)
                    .map_err(|_| {
                        JunctionError::Internal("connection writer still shared".to_string())
                    })?
                    .into_inner();
                let mut conn = read_half.unsplit(write_half);
                conn.push_prefix(leftover.freeze());
                conn.set_protocol(Protocol::Https);
                conn.set_request(request.clone());

                handler
                    .handle(Downstream {
                        request,
                        client: ClientSide::Tunnel(conn),
                    })
                    .await;
                return Ok(());
            }

            parsed.strip_proxy_headers();
            let request = Request::new(Protocol::Http, &host, port, parsed.absolute_url(), conn_id);
            {
                let mut meta = meta.lock();
                meta.protocol = Some(Protocol::Http);
                meta.request = Some(request.clone());
            }

            let replay = HttpReplayConn::new(conn_id, parsed, writer.clone());
            let handler = handler.clone();
            children.spawn(async move {
                handler
                    .handle(Downstream {
                        request,
                        client: ClientSide::Replay(replay),
                    })
                    .await;
            });
        }
    }
}

async fn drain(children: &mut JoinSet<()>) {
    while let Some(result) = children.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Request task panicked: {}", e);
            }
        }
    }
}

/// Listener addresses may omit the host (`:8080`)
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

#[async_trait]
impl Inbound for HttpInbound {
    fn typ(&self) -> &'static str {
        "http"
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn serve(
        self: Box<Self>,
        handler: Arc<dyn InboundHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind_addr(&self.addr)).await?;
        info!(
            "HTTP proxy listening on {} (auth: {})",
            listener.local_addr()?,
            self.auth.is_enabled()
        );
        let auth = Arc::new(self.auth);
        let max_body = self.max_body;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let conn = Connection::wrap(stream);
                            conn.set_peer_addr(client_addr);
                            let handler = handler.clone();
                            let auth = auth.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection_with_limit(conn, &auth, max_body, handler).await
                                {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("HTTP proxy on {} shutting down", self.addr);
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// One parsed plain-HTTP request bound to the client's write side.
///
/// The request is replayed upstream with [`write_to`](Self::write_to); the
/// response goes back through [`writer`](Self::writer). Reading from it is
/// an error since the client bytes were already consumed by the parser.
pub struct HttpReplayConn {
    id: u64,
    request: Option<ParsedRequest>,
    is_head: bool,
    writer: SharedWriter,
}

impl HttpReplayConn {
    pub fn new(id: u64, request: ParsedRequest, writer: SharedWriter) -> Self {
        Self {
            id,
            is_head: request.is_head(),
            request: Some(request),
            writer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> Option<&ParsedRequest> {
        self.request.as_ref()
    }

    pub fn is_head(&self) -> bool {
        self.is_head
    }

    /// Serialize the pending request onto `upstream`, returning bytes written
    pub async fn write_to<W>(&self, upstream: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let request = self
            .request
            .as_ref()
            .ok_or_else(|| JunctionError::Transport("request already released".to_string()))?;
        let bytes = request.encode()?;
        upstream.write_all(&bytes).await?;
        upstream.flush().await?;
        Ok(bytes.len() as u64)
    }

    /// Exclusive access to the client's write side
    pub async fn writer(&self) -> MutexGuard<'_, WriteHalf<Connection>> {
        self.writer.lock().await
    }

    /// Release the request body
    pub fn close(&mut self) {
        if self.request.take().is_none() {
            warn!(conn_id = self.id, "Replay connection closed twice");
        }
    }
}

impl AsyncRead for HttpReplayConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "replayed HTTP request cannot be read",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    /// Records requests; tunnels echo the first 5 bytes read back as a message
    struct Collect {
        tx: mpsc::UnboundedSender<(Request, Vec<u8>)>,
    }

    #[async_trait]
    impl InboundHandler for Collect {
        async fn handle(&self, downstream: Downstream) {
            let payload = match downstream.client {
                ClientSide::Tunnel(mut conn) => {
                    let mut buf = [0u8; 5];
                    conn.read_exact(&mut buf).await.unwrap();
                    buf.to_vec()
                }
                ClientSide::Replay(mut replay) => {
                    let mut sink = Vec::new();
                    replay.write_to(&mut sink).await.unwrap();
                    {
                        let mut w = replay.writer().await;
                        w.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
                    }
                    replay.close();
                    sink
                }
            };
            let _ = self.tx.send((downstream.request, payload));
        }
    }

    fn spawn_connection(
        auth: ProxyAuth,
    ) -> (
        DuplexStream,
        mpsc::UnboundedReceiver<(Request, Vec<u8>)>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn InboundHandler> = Arc::new(Collect { tx });
        let handle = tokio::spawn(async move {
            HttpInbound::handle_connection(Connection::wrap(server), &auth, handler).await
        });
        (client, rx, handle)
    }

    #[tokio::test]
    async fn test_connect_replays_leftover_bytes() {
        let (mut client, mut rx, handle) = spawn_connection(ProxyAuth::Disabled);

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nHELLO")
            .await
            .unwrap();

        let expected = b"HTTP/1.1 200 Connection established\r\n\r\n";
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], expected);

        let (request, payload) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.protocol(), Protocol::Https);
        assert_eq!(request.domain(), "example.com");
        assert_eq!(request.port(), 443);
        assert_eq!(payload, b"HELLO");
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pipelined_requests_are_dispatched() {
        let (mut client, mut rx, handle) = spawn_connection(ProxyAuth::Disabled);

        client
            .write_all(
                b"GET http://a.com/one HTTP/1.1\r\nHost: a.com\r\nProxy-Connection: keep-alive\r\n\r\n\
GET http://b.com:8080/two HTTP/1.1\r\nHost: b.com:8080\r\n\r\n",
            )
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (request, replayed) = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let replayed = String::from_utf8(replayed).unwrap();
            assert!(!replayed.to_lowercase().contains("proxy-connection"));
            seen.push((request.domain().to_string(), request.port(), replayed));
        }
        seen.sort();

        assert_eq!(seen[0].0, "a.com");
        assert_eq!(seen[0].1, 80);
        assert!(seen[0].2.starts_with("GET /one HTTP/1.1\r\n"));
        assert_eq!(seen[1].0, "b.com");
        assert_eq!(seen[1].1, 8080);

        assert!(handle.await.unwrap().is_ok());

        let mut responses = Vec::new();
        client.read_to_end(&mut responses).await.unwrap();
        assert_eq!(
            responses,
            b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_auth_failure_returns_407() {
        let (mut client, mut rx, handle) = spawn_connection(ProxyAuth::basic("root", "123123"));

        client
            .write_all(b"GET http://a.com/ HTTP/1.1\r\nHost: a.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 407"));

        assert!(matches!(
            handle.await.unwrap(),
            Err(JunctionError::AuthenticationFailed)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auth_success_dispatches() {
        let (mut client, mut rx, handle) = spawn_connection(ProxyAuth::basic("root", "123123"));
        let credentials = BASE64.encode(b"root:123123");

        client
            .write_all(
                format!(
                    "CONNECT secure.example:8443 HTTP/1.1\r\nProxy-Authorization: Basic {}\r\n\r\n12345",
                    credentials
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let (request, payload) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.port(), 8443);
        assert_eq!(payload, b"12345");
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_parse_error_closes_connection() {
        let (mut client, _rx, handle) = spawn_connection(ProxyAuth::Disabled);
        client.write_all(b"\x00\x01 not http\r\n\r\n").await.unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(JunctionError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_upload_is_refused() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn InboundHandler> = Arc::new(Collect { tx });
        let handle = tokio::spawn(async move {
            HttpInbound::handle_connection_with_limit(
                Connection::wrap(server),
                &ProxyAuth::Disabled,
                1024,
                handler,
            )
            .await
        });

        client
            .write_all(b"POST http://a.com/up HTTP/1.1\r\nHost: a.com\r\nContent-Length: 67108864\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            timeout(Duration::from_secs(2), handle).await.unwrap().unwrap(),
            Err(JunctionError::Parse(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replay_conn_rejects_reads() {
        let (_client, server) = tokio::io::duplex(64);
        let (_, write_half) = tokio::io::split(Connection::wrap(server));
        let request = ParsedRequest {
            method: "GET".to_string(),
            target: "http://a.com/".to_string(),
            version: 1,
            headers: Vec::new(),
            body: bytes::Bytes::new(),
        };
        let mut replay = HttpReplayConn::new(1, request, Arc::new(Mutex::new(write_half)));

        let mut buf = [0u8; 8];
        let err = replay.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        replay.close();
        let mut sink = Vec::new();
        assert!(replay.write_to(&mut sink).await.is_err());
    }

    #[test]
    fn test_bind_addr() {
        assert_eq!(bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(bind_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }
}

//! Transport pump
//!
//! Moves bytes between a client and its upstream until one side is done.
//! Tunnels are copied raw in both directions; plain HTTP requests are replayed
//! upstream and exactly one framed response is relayed back.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use pin_project_lite::pin_project;
use serde::{Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::error::{JunctionError, Result};
use crate::models::{Protocol, RecordOutcome};
use crate::proxy::conn::Connection;
use crate::proxy::inbound::message::{
    parse_response_head, BodyFraming, ChunkScanner, MAX_HEAD_SIZE,
};
use crate::proxy::inbound::{ClientSide, HttpReplayConn};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// How long the open direction may keep flowing after its peer reached EOF
const HALF_CLOSE_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// Opaque bidirectional copy
    Raw,
    /// Replay one parsed request and relay its response
    HttpAware,
    /// Raw copy of decrypted traffic, tapped into the capture channel
    Capturing,
}

impl PumpMode {
    pub fn select(protocol: Protocol, capture_enabled: bool, mitm_engaged: bool) -> Self {
        match protocol {
            Protocol::Http => PumpMode::HttpAware,
            Protocol::Https if mitm_engaged && capture_enabled => PumpMode::Capturing,
            Protocol::Https => PumpMode::Raw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PumpMode::Raw => "raw",
            PumpMode::HttpAware => "http",
            PumpMode::Capturing => "capturing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to upstream
    Upstream,
    /// Upstream to client
    Downstream,
}

/// Bytes observed on an upstream connection
#[derive(Debug, Clone, Serialize)]
pub struct CaptureFrame {
    pub conn_id: u64,
    pub direction: Direction,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
}

fn serialize_base64<S: Serializer>(data: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(data))
}

pin_project! {
    /// Stream adapter that publishes every byte read or written
    pub struct CapturingStream<S> {
        #[pin]
        inner: S,
        conn_id: u64,
        tap: broadcast::Sender<CaptureFrame>,
    }
}

impl<S> CapturingStream<S> {
    pub fn new(inner: S, conn_id: u64, tap: broadcast::Sender<CaptureFrame>) -> Self {
        Self {
            inner,
            conn_id,
            tap,
        }
    }
}

fn publish(tap: &broadcast::Sender<CaptureFrame>, conn_id: u64, direction: Direction, data: &[u8]) {
    if data.is_empty() || tap.receiver_count() == 0 {
        return;
    }
    let _ = tap.send(CaptureFrame {
        conn_id,
        direction,
        data: Bytes::copy_from_slice(data),
        timestamp: Utc::now(),
    });
}

impl<S: AsyncRead> AsyncRead for CapturingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            publish(this.tap, *this.conn_id, Direction::Downstream, &buf.filled()[before..]);
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for CapturingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            publish(this.tap, *this.conn_id, Direction::Upstream, &buf[..*n]);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Byte counts and terminal error of one pump run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpOutcome {
    pub sent: u64,
    pub received: u64,
    pub error: Option<String>,
}

impl PumpOutcome {
    fn failed(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_record_outcome(self) -> RecordOutcome {
        match self.error {
            None => RecordOutcome::closed(self.sent, self.received),
            Some(error) => RecordOutcome::error(error).with_bytes(self.sent, self.received),
        }
    }
}

#[derive(Clone, Default)]
pub struct TransportPump {
    capture: Option<broadcast::Sender<CaptureFrame>>,
}

impl TransportPump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pump that publishes observed traffic on a channel of `capacity` frames
    pub fn with_capture(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { capture: Some(tx) }
    }

    pub fn capture_enabled(&self) -> bool {
        self.capture.is_some()
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<CaptureFrame>> {
        self.capture.as_ref().map(|tx| tx.subscribe())
    }

    pub fn mode_for(&self, protocol: Protocol, mitm_engaged: bool) -> PumpMode {
        PumpMode::select(protocol, self.capture_enabled(), mitm_engaged)
    }

    /// Run until both directions finish or either fails.
    ///
    /// Errors end up in the outcome; both sides are dropped on return.
    #[instrument(skip_all, fields(conn_id = client.id(), mode = mode.as_str()))]
    pub async fn pump(&self, client: ClientSide, upstream: Connection, mode: PumpMode) -> PumpOutcome {
        let outcome = match (mode, client) {
            (PumpMode::Raw, ClientSide::Tunnel(client)) => relay_raw(client, upstream).await,
            (PumpMode::Capturing, ClientSide::Tunnel(client)) => match &self.capture {
                Some(tap) => {
                    let id = upstream.id();
                    relay_raw(client, CapturingStream::new(upstream, id, tap.clone())).await
                }
                None => relay_raw(client, upstream).await,
            },
            (PumpMode::HttpAware, ClientSide::Replay(replay)) => match &self.capture {
                Some(tap) => {
                    let id = upstream.id();
                    relay_http(replay, CapturingStream::new(upstream, id, tap.clone())).await
                }
                None => relay_http(replay, upstream).await,
            },
            (mode, client) => PumpOutcome::failed(format!(
                "pump mode {} cannot carry connection {}",
                mode.as_str(),
                client.id()
            )),
        };

        match &outcome.error {
            None => debug!(
                bytes_sent = outcome.sent,
                bytes_received = outcome.received,
                "Pump finished"
            ),
            Some(error) => warn!(
                bytes_sent = outcome.sent,
                bytes_received = outcome.received,
                "Pump aborted: {}",
                error
            ),
        }
        outcome
    }
}

/// Copy one direction; on EOF half-close the writer
async fn copy_half<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn relay_raw<C, U>(client: C, upstream: U) -> PumpOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let result = {
        let up = copy_half(client_read, upstream_write, &sent);
        let down = copy_half(upstream_read, client_write, &received);
        tokio::pin!(up);
        tokio::pin!(down);

        // An error in either direction drops both. EOF leaves the other
        // direction a short drain window, then both sides are dropped.
        tokio::select! {
            r = &mut up => match r {
                Ok(()) => drain(down).await,
                Err(e) => Err(e),
            },
            r = &mut down => match r {
                Ok(()) => drain(up).await,
                Err(e) => Err(e),
            },
        }
    };

    PumpOutcome {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
        error: result.err().map(|e| e.to_string()),
    }
}

async fn drain<F>(remaining: F) -> io::Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    match tokio::time::timeout(HALF_CLOSE_DRAIN, remaining).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Half-closed peer stayed idle, closing pair");
            Ok(())
        }
    }
}

async fn relay_http<U>(mut replay: HttpReplayConn, mut upstream: U) -> PumpOutcome
where
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut counts = (0, 0);
    let result = relay_one_response(&replay, &mut upstream, &mut counts).await;
    replay.close();
    let _ = upstream.shutdown().await;

    PumpOutcome {
        sent: counts.0,
        received: counts.1,
        error: result.err().map(|e| e.to_string()),
    }
}

async fn read_more<U: AsyncRead + Unpin>(upstream: &mut U, buf: &mut BytesMut) -> Result<()> {
    if upstream.read_buf(buf).await? == 0 {
        return Err(JunctionError::Transport(
            "upstream closed mid-response".to_string(),
        ));
    }
    Ok(())
}

async fn relay_one_response<U>(
    replay: &HttpReplayConn,
    upstream: &mut U,
    counts: &mut (u64, u64),
) -> Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    counts.0 = replay.write_to(upstream).await?;

    let mut buf = BytesMut::with_capacity(COPY_BUF_SIZE);
    let mut client = replay.writer().await;

    loop {
        let (head, head_len) = loop {
            if let Some(parsed) = parse_response_head(&buf)? {
                break parsed;
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(JunctionError::Transport(
                    "response head too large".to_string(),
                ));
            }
            read_more(upstream, &mut buf).await?;
        };

        let head_bytes = buf.split_to(head_len);
        client.write_all(&head_bytes).await?;
        counts.1 += head_len as u64;

        if head.is_interim() {
            continue;
        }

        match head.framing(replay.is_head())? {
            BodyFraming::Empty => {}
            BodyFraming::Length(mut remaining) => {
                while remaining > 0 {
                    if buf.is_empty() {
                        read_more(upstream, &mut buf).await?;
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    client.write_all(&buf.split_to(take)).await?;
                    counts.1 += take as u64;
                    remaining -= take as u64;
                }
            }
            BodyFraming::Chunked => {
                let mut scanner = ChunkScanner::new();
                while !scanner.is_done() {
                    if buf.is_empty() {
                        read_more(upstream, &mut buf).await?;
                    }
                    let n = scanner.advance(&buf)?;
                    client.write_all(&buf.split_to(n)).await?;
                    counts.1 += n as u64;
                }
            }
            BodyFraming::UntilClose => {
                // The client can only see the end of this body by the close
                loop {
                    if !buf.is_empty() {
                        client.write_all(&buf).await?;
                        counts.1 += buf.len() as u64;
                        buf.clear();
                    }
                    if upstream.read_buf(&mut buf).await? == 0 {
                        break;
                    }
                }
                client.flush().await?;
                client.shutdown().await?;
                return Ok(());
            }
        }

        if !buf.is_empty() {
            debug!(extra = buf.len(), "Discarding bytes after upstream response");
        }
        client.flush().await?;
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::inbound::http::SharedWriter;
    use crate::proxy::inbound::message::MessageReader;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    #[test]
    fn test_mode_selection() {
        assert_eq!(PumpMode::select(Protocol::Http, false, false), PumpMode::HttpAware);
        assert_eq!(PumpMode::select(Protocol::Http, true, true), PumpMode::HttpAware);
        assert_eq!(PumpMode::select(Protocol::Https, false, false), PumpMode::Raw);
        assert_eq!(PumpMode::select(Protocol::Https, true, false), PumpMode::Raw);
        assert_eq!(PumpMode::select(Protocol::Https, false, true), PumpMode::Raw);
        assert_eq!(PumpMode::select(Protocol::Https, true, true), PumpMode::Capturing);
    }

    #[tokio::test]
    async fn test_raw_pump_copies_both_ways() {
        let (client_local, mut client_remote) = tokio::io::duplex(1024);
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(1024);

        let pump = TransportPump::new();
        let task = tokio::spawn(async move {
            pump.pump(
                ClientSide::Tunnel(Connection::wrap(client_local)),
                Connection::wrap(upstream_local),
                PumpMode::Raw,
            )
            .await
        });

        client_remote.write_all(b"hello from client").await.unwrap();
        client_remote.shutdown().await.unwrap();

        let mut from_client = Vec::new();
        upstream_remote.read_to_end(&mut from_client).await.unwrap();
        assert_eq!(from_client, b"hello from client");

        upstream_remote.write_all(b"hello from server").await.unwrap();
        upstream_remote.shutdown().await.unwrap();

        let mut from_server = Vec::new();
        client_remote.read_to_end(&mut from_server).await.unwrap();
        assert_eq!(from_server, b"hello from server");

        let outcome = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.sent, 17);
        assert_eq!(outcome.received, 17);
    }

    #[tokio::test]
    async fn test_raw_pump_ends_when_client_closes_and_upstream_idles() {
        let (client_local, mut client_remote) = tokio::io::duplex(1024);
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(1024);

        let pump = TransportPump::new();
        let task = tokio::spawn(async move {
            pump.pump(
                ClientSide::Tunnel(Connection::wrap(client_local)),
                Connection::wrap(upstream_local),
                PumpMode::Raw,
            )
            .await
        });

        client_remote.write_all(b"bye").await.unwrap();
        client_remote.shutdown().await.unwrap();
        drop(client_remote);

        // Upstream stays open and never answers
        let outcome = timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.sent, 3);
        assert_eq!(outcome.received, 0);

        let mut leftover = Vec::new();
        upstream_remote.read_to_end(&mut leftover).await.unwrap();
        assert_eq!(leftover, b"bye");
    }

    #[tokio::test]
    async fn test_raw_pump_error_tears_down() {
        let (client_local, client_remote) = tokio::io::duplex(1024);
        let (upstream_local, upstream_remote) = tokio::io::duplex(1024);
        let mut client = Connection::wrap(client_local);
        client.push_prefix(Bytes::from_static(b"pending"));

        // Upstream peer is gone before anything can be written
        drop(upstream_remote);
        let outcome = TransportPump::new()
            .pump(
                ClientSide::Tunnel(client),
                Connection::wrap(upstream_local),
                PumpMode::Raw,
            )
            .await;
        assert!(outcome.error.is_some());
        drop(client_remote);
    }

    async fn replay_for(raw: &'static [u8]) -> (HttpReplayConn, DuplexStream) {
        let (client_local, mut client_remote) = tokio::io::duplex(4096);
        client_remote.write_all(raw).await.unwrap();

        let conn = Connection::wrap(client_local);
        let id = conn.id();
        let (read_half, write_half) = tokio::io::split(conn);
        let mut reader = MessageReader::new(read_half);
        let mut parsed = reader.read_request().await.unwrap().unwrap();
        parsed.strip_proxy_headers();

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
        (HttpReplayConn::new(id, parsed, writer), client_remote)
    }

    async fn read_until_contains(stream: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while !out.windows(needle.len()).any(|w| w == needle) {
            let n = timeout(Duration::from_secs(1), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "stream closed early");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_http_pump_relays_one_length_framed_response() {
        let (replay, mut client_remote) = replay_for(
            b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await;
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(4096);

        let origin = tokio::spawn(async move {
            let request = read_until_contains(&mut upstream_remote, b"\r\n\r\n").await;
            let text = String::from_utf8(request).unwrap();
            assert!(text.starts_with("GET /a HTTP/1.1\r\n"));
            assert!(!text.to_lowercase().contains("proxy-connection"));
            // Trailing bytes past the declared body must not reach the client
            upstream_remote
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloEXTRA")
                .await
                .unwrap();
        });

        let outcome = TransportPump::new()
            .pump(
                ClientSide::Replay(replay),
                Connection::wrap(upstream_local),
                PumpMode::HttpAware,
            )
            .await;
        origin.await.unwrap();
        assert!(outcome.is_ok(), "{:?}", outcome.error);

        let response = read_until_contains(&mut client_remote, b"hello").await;
        assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(outcome.received, response.len() as u64);
    }

    #[tokio::test]
    async fn test_http_pump_chunked_with_interim() {
        let (replay, mut client_remote) =
            replay_for(b"POST http://example.com/u HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").await;
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(4096);

        let origin = tokio::spawn(async move {
            read_until_contains(&mut upstream_remote, b"abc").await;
            upstream_remote
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await
                .unwrap();
            upstream_remote
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n0\r\n\r\n")
                .await
                .unwrap();
        });

        let outcome = TransportPump::new()
            .pump(
                ClientSide::Replay(replay),
                Connection::wrap(upstream_local),
                PumpMode::HttpAware,
            )
            .await;
        origin.await.unwrap();
        assert!(outcome.is_ok(), "{:?}", outcome.error);

        let response = read_until_contains(&mut client_remote, b"0\r\n\r\n").await;
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("4\r\nwiki\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_http_pump_head_response_has_no_body() {
        let (replay, mut client_remote) =
            replay_for(b"HEAD http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(4096);

        let origin = tokio::spawn(async move {
            read_until_contains(&mut upstream_remote, b"\r\n\r\n").await;
            upstream_remote
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n")
                .await
                .unwrap();
        });

        let outcome = TransportPump::new()
            .pump(
                ClientSide::Replay(replay),
                Connection::wrap(upstream_local),
                PumpMode::HttpAware,
            )
            .await;
        origin.await.unwrap();
        assert!(outcome.is_ok(), "{:?}", outcome.error);

        let response = read_until_contains(&mut client_remote, b"\r\n\r\n").await;
        assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n");
    }

    #[tokio::test]
    async fn test_http_pump_upstream_closes_early() {
        let (replay, _client_remote) =
            replay_for(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            read_until_contains(&mut upstream_remote, b"\r\n\r\n").await;
            upstream_remote
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
                .await
                .unwrap();
        });

        let outcome = TransportPump::new()
            .pump(
                ClientSide::Replay(replay),
                Connection::wrap(upstream_local),
                PumpMode::HttpAware,
            )
            .await;
        assert!(outcome.error.unwrap().contains("mid-response"));
    }

    #[tokio::test]
    async fn test_capturing_pump_taps_both_directions() {
        let pump = TransportPump::with_capture(16);
        let mut frames = pump.subscribe().unwrap();

        let (client_local, mut client_remote) = tokio::io::duplex(1024);
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(1024);
        let upstream = Connection::wrap(upstream_local);
        let upstream_id = upstream.id();

        let task = tokio::spawn(async move {
            pump.pump(
                ClientSide::Tunnel(Connection::wrap(client_local)),
                upstream,
                PumpMode::Capturing,
            )
            .await
        });

        client_remote.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        client_remote.shutdown().await.unwrap();
        let mut request = Vec::new();
        upstream_remote.read_to_end(&mut request).await.unwrap();
        upstream_remote.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        upstream_remote.shutdown().await.unwrap();

        let outcome = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(outcome.is_ok());

        let first = frames.recv().await.unwrap();
        assert_eq!(first.conn_id, upstream_id);
        assert_eq!(first.direction, Direction::Upstream);
        assert_eq!(&first.data[..], b"GET / HTTP/1.1\r\n\r\n");

        let second = frames.recv().await.unwrap();
        assert_eq!(second.direction, Direction::Downstream);
        assert_eq!(&second.data[..], b"HTTP/1.1 204 No Content\r\n\r\n");

        let json = serde_json::to_value(&second).unwrap();
        assert_eq!(json["direction"], "downstream");
        assert_eq!(json["data"], BASE64.encode(b"HTTP/1.1 204 No Content\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_mismatched_mode_fails() {
        let (client_local, _client_remote) = tokio::io::duplex(64);
        let (upstream_local, _upstream_remote) = tokio::io::duplex(64);
        let outcome = TransportPump::new()
            .pump(
                ClientSide::Tunnel(Connection::wrap(client_local)),
                Connection::wrap(upstream_local),
                PumpMode::HttpAware,
            )
            .await;
        assert!(outcome.error.is_some());
        assert!(outcome.into_record_outcome().status.is_terminal());
    }
}

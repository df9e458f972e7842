//! Connection wrapper
//!
//! Every accepted or dialed stream is wrapped in a [`Connection`] that carries a
//! process-unique id, shared metadata and an optional replay prefix.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::models::{Protocol, Request};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Draw an id from the connection counter for records that have no connection of their own
pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Trait for byte streams a connection can wrap
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxStream = Box<dyn ProxyConnection>;

/// Metadata attached to a connection while it is being handled
#[derive(Debug, Clone, Default)]
pub struct ConnMeta {
    pub protocol: Option<Protocol>,
    pub request: Option<Request>,
    pub peer_addr: Option<SocketAddr>,
}

pub struct Connection {
    id: u64,
    inner: BoxStream,
    meta: Arc<Mutex<ConnMeta>>,
    prefix: Bytes,
    closed: bool,
}

impl Connection {
    /// Wrap a stream, assigning the next connection id
    pub fn wrap<S: ProxyConnection>(stream: S) -> Self {
        Self {
            id: next_conn_id(),
            inner: Box::new(stream),
            meta: Arc::new(Mutex::new(ConnMeta::default())),
            prefix: Bytes::new(),
            closed: false,
        }
    }

    /// Wrap a stream layered over an existing connection, keeping its identity
    pub fn layered<S: ProxyConnection>(id: u64, meta: Arc<Mutex<ConnMeta>>, stream: S) -> Self {
        Self {
            id,
            inner: Box::new(stream),
            meta,
            prefix: Bytes::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the current metadata
    pub fn meta(&self) -> ConnMeta {
        self.meta.lock().clone()
    }

    /// Shared metadata handle for values derived from this connection
    pub fn meta_handle(&self) -> Arc<Mutex<ConnMeta>> {
        self.meta.clone()
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        self.meta.lock().protocol = Some(protocol);
    }

    pub fn set_request(&self, request: Request) {
        self.meta.lock().request = Some(request);
    }

    pub fn set_peer_addr(&self, addr: SocketAddr) {
        self.meta.lock().peer_addr = Some(addr);
    }

    pub fn request(&self) -> Option<Request> {
        self.meta.lock().request.clone()
    }

    /// Queue bytes to be returned by subsequent reads before the transport
    pub fn push_prefix(&mut self, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return;
        }
        if self.prefix.is_empty() {
            self.prefix = bytes;
        } else {
            let mut joined = BytesMut::with_capacity(bytes.len() + self.prefix.len());
            joined.extend_from_slice(&bytes);
            joined.extend_from_slice(&self.prefix);
            self.prefix = joined.freeze();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut down the transport. Calling it again is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("prefix", &self.prefix.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            self.closed = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_ids_are_unique() {
        let (a, _) = tokio::io::duplex(16);
        let (b, _) = tokio::io::duplex(16);
        let first = Connection::wrap(a);
        let second = Connection::wrap(b);
        assert!(second.id() > first.id());
    }

    #[tokio::test]
    async fn test_prefix_is_read_first() {
        let (client, mut peer) = tokio::io::duplex(64);
        let mut conn = Connection::wrap(client);
        conn.push_prefix(Bytes::from_static(b"world"));
        conn.push_prefix(Bytes::from_static(b"hello "));

        peer.write_all(b"!").await.unwrap();
        peer.shutdown().await.unwrap();

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world!");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, mut peer) = tokio::io::duplex(64);
        let mut conn = Connection::wrap(client);

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        conn.close().await.unwrap();

        let mut out = Vec::new();
        peer.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_meta_is_shared() {
        let (client, _) = tokio::io::duplex(16);
        let conn = Connection::wrap(client);
        let handle = conn.meta_handle();

        conn.set_protocol(Protocol::Https);
        conn.set_request(Request::new(
            Protocol::Https,
            "example.com",
            None,
            "example.com:443",
            conn.id(),
        ));

        let meta = handle.lock().clone();
        assert_eq!(meta.protocol, Some(Protocol::Https));
        assert_eq!(meta.request.unwrap().domain(), "example.com");
        assert!(conn.meta().peer_addr.is_none());
    }

    #[test]
    fn test_layered_keeps_identity() {
        let (a, _) = tokio::io::duplex(16);
        let (b, _) = tokio::io::duplex(16);
        let base = Connection::wrap(a);
        base.set_protocol(Protocol::Https);

        let layered = Connection::layered(base.id(), base.meta_handle(), b);
        assert_eq!(layered.id(), base.id());
        assert_eq!(layered.meta().protocol, Some(Protocol::Https));
    }
}

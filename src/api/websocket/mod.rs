//! WebSocket handlers
//!
//! Each socket gets a bounded buffer fed with `try_send`; a slow client
//! loses messages instead of holding up the broadcast.

pub mod capture;
pub mod records;

use std::fmt::Display;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Maximum number of messages to buffer per WebSocket connection
pub const WS_BUFFER_SIZE: usize = 256;

/// Forward every broadcast item to the socket as JSON until either side closes
async fn stream_broadcast<T>(socket: WebSocket, source: broadcast::Receiver<T>, label: &'static str)
where
    T: Serialize + Clone + Send + 'static,
{
    let (sender, receiver) = socket.split();
    info!("{} WebSocket connected", label);
    relay_broadcast(sender, receiver, source, label).await;
    info!("{} WebSocket disconnected", label);
}

/// Runs the forward, send and receive tasks; the first to end stops the others
async fn relay_broadcast<T, S, R, E>(
    mut sender: S,
    mut receiver: R,
    source: broadcast::Receiver<T>,
    label: &'static str,
) where
    T: Serialize + Clone + Send + 'static,
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Send,
    R: Stream<Item = std::result::Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<T>(WS_BUFFER_SIZE);
    let mut tasks = JoinSet::new();

    tasks.spawn(async move {
        let mut source = BroadcastStream::new(source);
        while let Some(item) = source.next().await {
            match item {
                Ok(item) => {
                    if tx.try_send(item).is_err() {
                        debug!("{} WebSocket buffer full, dropping message", label);
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("{} WebSocket lagged, missed {} messages", label, n);
                }
            }
        }
        "forward"
    });

    tasks.spawn(async move {
        while let Some(item) = rx.recv().await {
            match serde_json::to_string(&item) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize {} message: {}", label, e);
                }
            }
        }
        "send"
    });

    // Incoming messages only matter for close; pongs are handled by axum
    tasks.spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("{} WebSocket error: {}", label, e);
                    break;
                }
                _ => {}
            }
        }
        "receive"
    });

    if let Some(Ok(task)) = tasks.join_next().await {
        debug!("{} {} task ended", label, task);
    }
    // Drops the broadcast subscription held by the forward task
    tasks.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as chan;
    use serde_json::Value;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_relay_releases_subscription_on_close() {
        let (source_tx, source_rx) = broadcast::channel::<Value>(16);
        let (out_tx, mut out_rx) = chan::channel::<Message>(16);
        let (in_tx, in_rx) = chan::unbounded::<std::result::Result<Message, axum::Error>>();

        let relay = tokio::spawn(relay_broadcast(out_tx, in_rx, source_rx, "Test"));

        source_tx.send(serde_json::json!({ "id": 1 })).unwrap();
        let first = timeout(Duration::from_secs(1), out_rx.next())
            .await
            .unwrap()
            .unwrap();
        match first {
            Message::Text(text) => assert_eq!(text, r#"{"id":1}"#),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(source_tx.receiver_count(), 1);

        // Client goes away
        drop(in_tx);
        timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
        assert_eq!(source_tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_stops_on_close_frame() {
        let (source_tx, source_rx) = broadcast::channel::<Value>(16);
        let (out_tx, _out_rx) = chan::channel::<Message>(16);
        let (in_tx, in_rx) = chan::unbounded::<std::result::Result<Message, axum::Error>>();

        let relay = tokio::spawn(relay_broadcast(out_tx, in_rx, source_rx, "Test"));
        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();

        timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
        assert_eq!(source_tx.receiver_count(), 0);
    }
}

//! Record registry
//!
//! Connection handlers report record events through a cloneable
//! [`RecordRegistry`]. Sending never blocks: when the queue is full the event
//! is dropped and counted. A single [`RecordSink`] task applies events to a
//! bounded history and re-broadcasts every change.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::models::{Record, RecordOutcome, RecordStatus};

const UPDATE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub enum RecordEvent {
    Opened(Record),
    Finished { id: u64, outcome: RecordOutcome },
}

/// Handle used by connection handlers to report records
#[derive(Clone)]
pub struct RecordRegistry {
    tx: mpsc::Sender<RecordEvent>,
    dropped: Arc<AtomicU64>,
}

impl RecordRegistry {
    /// Create a registry with a queue of `queue_size` events and a sink
    /// keeping the newest `history` records
    pub fn channel(queue_size: usize, history: usize) -> (Self, RecordSink) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let store = RecordStore::new(history, dropped.clone());

        (Self { tx, dropped }, RecordSink { rx, store })
    }

    pub fn open(&self, record: Record) {
        self.send(RecordEvent::Opened(record));
    }

    pub fn finish(&self, id: u64, outcome: RecordOutcome) {
        self.send(RecordEvent::Finished { id, outcome });
    }

    /// Events dropped because the queue was full or the sink was gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, event: RecordEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped = total, "Record queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordStats {
    pub history: usize,
    pub capacity: usize,
    pub active: usize,
    pub closed: usize,
    pub errors: usize,
    pub dropped: u64,
}

/// Shared view of the record history
#[derive(Clone)]
pub struct RecordStore {
    records: Arc<RwLock<VecDeque<Record>>>,
    capacity: usize,
    updates: broadcast::Sender<Record>,
    dropped: Arc<AtomicU64>,
}

impl RecordStore {
    fn new(capacity: usize, dropped: Arc<AtomicU64>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        Self {
            records: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
            updates,
            dropped,
        }
    }

    /// Newest records first, at most `limit`
    pub fn snapshot(&self, limit: usize) -> Vec<Record> {
        self.records.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<Record> {
        self.records.read().iter().rev().find(|r| r.id == id).cloned()
    }

    pub fn stats(&self) -> RecordStats {
        let records = self.records.read();
        let count = |status: RecordStatus| records.iter().filter(|r| r.status == status).count();

        RecordStats {
            history: records.len(),
            capacity: self.capacity,
            active: count(RecordStatus::Active),
            closed: count(RecordStatus::Closed),
            errors: count(RecordStatus::Error),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Receive every record state change
    pub fn subscribe(&self) -> broadcast::Receiver<Record> {
        self.updates.subscribe()
    }

    fn apply(&self, event: RecordEvent) {
        let changed = match event {
            RecordEvent::Opened(record) => {
                let mut records = self.records.write();
                records.push_back(record.clone());
                while records.len() > self.capacity {
                    records.pop_front();
                }
                record
            }
            RecordEvent::Finished { id, outcome } => {
                let mut records = self.records.write();
                match records.iter_mut().rev().find(|r| r.id == id) {
                    Some(record) => {
                        outcome.apply(record);
                        record.clone()
                    }
                    None => {
                        debug!(conn_id = id, "Finished event for unknown record");
                        return;
                    }
                }
            }
        };

        // No subscribers is fine
        let _ = self.updates.send(changed);
    }
}

/// Single consumer of record events
pub struct RecordSink {
    rx: mpsc::Receiver<RecordEvent>,
    store: RecordStore,
}

impl RecordSink {
    pub fn store(&self) -> RecordStore {
        self.store.clone()
    }

    /// Apply events until every registry handle is dropped or shutdown is signalled
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Record sink started (history: {})", self.store.capacity);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.store.apply(event),
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Keep what was already queued
                        while let Ok(event) = self.rx.try_recv() {
                            self.store.apply(event);
                        }
                        break;
                    }
                }
            }
        }

        let dropped = self.store.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("Record sink stopped; {} events were dropped", dropped);
        } else {
            info!("Record sink stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;
    use tokio::time::{timeout, Duration};

    fn record(id: u64) -> Record {
        Record::active(
            id,
            Protocol::Https,
            "JP1",
            "AUTO",
            "example.com:443",
            "DOMAIN-SUFFIX,example.com",
        )
    }

    #[tokio::test]
    async fn test_open_and_finish() {
        let (registry, sink) = RecordRegistry::channel(16, 16);
        let store = sink.store();
        let mut updates = store.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(sink.run(shutdown_rx));

        registry.open(record(1));
        registry.finish(1, RecordOutcome::closed(10, 20));

        let opened = timeout(Duration::from_secs(1), updates.recv()).await.unwrap().unwrap();
        assert_eq!(opened.status, RecordStatus::Active);
        let finished = timeout(Duration::from_secs(1), updates.recv()).await.unwrap().unwrap();
        assert_eq!(finished.status, RecordStatus::Closed);
        assert_eq!(finished.bytes_received, 20);
        assert!(finished.finished.is_some());

        let stored = store.get(1).unwrap();
        assert_eq!(stored.bytes_sent, 10);
        assert_eq!(store.stats().closed, 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_full_queue_drops_events() {
        let (registry, sink) = RecordRegistry::channel(2, 16);
        registry.open(record(1));
        registry.open(record(2));
        assert_eq!(registry.dropped(), 0);

        registry.finish(1, RecordOutcome::error("boom"));
        registry.open(record(3));
        assert_eq!(registry.dropped(), 2);
        assert_eq!(sink.store().stats().dropped, 2);
    }

    #[test]
    fn test_closed_sink_counts_drops() {
        let (registry, sink) = RecordRegistry::channel(2, 16);
        drop(sink);
        registry.open(record(1));
        assert_eq!(registry.dropped(), 1);
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let (_registry, sink) = RecordRegistry::channel(16, 3);
        let store = sink.store();
        for id in 1..=5 {
            store.apply(RecordEvent::Opened(record(id)));
        }

        let ids: Vec<u64> = store.snapshot(10).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(store.snapshot(1)[0].id, 5);
        assert_eq!(store.stats().history, 3);
        assert_eq!(store.stats().active, 3);

        // Evicted records are ignored
        store.apply(RecordEvent::Finished {
            id: 1,
            outcome: RecordOutcome::closed(0, 0),
        });
        assert!(store.get(1).is_none());
    }

    #[tokio::test]
    async fn test_sink_drains_queue_on_shutdown() {
        let (registry, sink) = RecordRegistry::channel(16, 16);
        let store = sink.store();
        registry.open(record(7));
        registry.finish(7, RecordOutcome::error("dial failed"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        sink.run(shutdown_rx).await;

        let stored = store.get(7).unwrap();
        assert_eq!(stored.status, RecordStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("dial failed"));
    }
}

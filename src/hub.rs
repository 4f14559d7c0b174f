//! In-memory fan-out of decoded events and externally published payloads.
//!
//! Every subscriber owns a bounded queue. [`Hub::publish`] offers the payload
//! to a snapshot of the current subscribers with `try_send`, so a slow
//! consumer only ever loses its own events: when its queue is full the new
//! event is dropped for that subscriber (drop-newest) and its drop counter
//! goes up. Publishing never blocks and never fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde_derive::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::health::Health;
use crate::protocol::DecodedEvent;
use crate::store::PersistenceSink;

pub type SubscriberId = u64;

/// What flows through the hub.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Decoded(DecodedEvent),
    /// A JSON object submitted through the publish endpoint, forwarded verbatim.
    External(serde_json::Value),
}

impl Payload {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Payload::Decoded(event) => Some(&event.device_id),
            Payload::External(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriberStats {
    queued: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl SubscriberStats {
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Called by delivery adapters when an event could not be handed on.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscriberReport {
    pub id: SubscriberId,
    pub label: String,
    pub queued: u64,
    pub dropped: u64,
    pub failed: u64,
}

enum Offer {
    Queued,
    Full,
    Gone,
}

struct Slot {
    id: SubscriberId,
    label: String,
    // Taken on unsubscribe so nothing can be queued afterwards.
    tx: Mutex<Option<mpsc::Sender<Arc<Payload>>>>,
    stats: Arc<SubscriberStats>,
}

impl Slot {
    fn offer(&self, payload: &Arc<Payload>) -> Offer {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Offer::Gone;
        };
        match tx.try_send(Arc::clone(payload)) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                Offer::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Offer::Full
            }
            Err(TrySendError::Closed(_)) => Offer::Gone,
        }
    }

    fn close(&self) {
        *self.tx.lock() = None;
    }
}

/// Receiving side of one subscription.
#[derive(Debug)]
pub struct SubscriberHandle {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<Payload>>,
    stats: Arc<SubscriberStats>,
}

impl SubscriberHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next payload, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Payload>> {
        self.rx.recv().await
    }

    pub fn stats(&self) -> Arc<SubscriberStats> {
        Arc::clone(&self.stats)
    }
}

pub struct Hub {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Slot>>>,
    // Taken on close so the persistence worker can drain and exit.
    persistence: Mutex<Option<PersistenceSink>>,
    health: Arc<Health>,
}

impl Hub {
    /// `capacity` is the queue bound of every subscriber.
    pub fn new(capacity: usize, health: Arc<Health>) -> Self {
        Hub {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
            persistence: Mutex::new(None),
            health,
        }
    }

    /// Decoded events are also appended through `sink`.
    pub fn with_persistence(mut self, sink: PersistenceSink) -> Self {
        *self.persistence.get_mut() = Some(sink);
        self
    }

    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    pub fn subscribe(&self, label: impl Into<String>) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        let stats = Arc::new(SubscriberStats::default());
        let slot = Arc::new(Slot {
            id,
            label: label.clone(),
            tx: Mutex::new(Some(tx)),
            stats: Arc::clone(&stats),
        });
        self.subscribers.write().insert(id, slot);
        info!("Subscriber {id} ({label}) registered");
        SubscriberHandle { id, rx, stats }
    }

    /// Remove a subscriber and close its queue. Returns `false` if it was
    /// already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id);
        match removed {
            Some(slot) => {
                slot.close();
                info!("Subscriber {id} ({}) removed", slot.label);
                true
            }
            None => false,
        }
    }

    /// Offer `payload` to every current subscriber. Returns how many queued it.
    pub fn publish(&self, payload: Payload) -> usize {
        if let Payload::Decoded(event) = &payload {
            if let Some(sink) = self.persistence.lock().as_ref() {
                sink.submit(event.clone());
            }
        }

        let payload = Arc::new(payload);
        let snapshot: Vec<Arc<Slot>> = self.subscribers.read().values().cloned().collect();

        let mut queued = 0;
        for slot in snapshot {
            match slot.offer(&payload) {
                Offer::Queued => queued += 1,
                Offer::Full => {
                    debug!("Subscriber {} ({}) is full, dropping event", slot.id, slot.label);
                }
                Offer::Gone => {
                    if self.unsubscribe(slot.id) {
                        debug!("Subscriber {} went away", slot.id);
                    }
                }
            }
        }
        queued
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn report(&self) -> Vec<SubscriberReport> {
        let mut reports: Vec<SubscriberReport> = self
            .subscribers
            .read()
            .values()
            .map(|slot| SubscriberReport {
                id: slot.id,
                label: slot.label.clone(),
                queued: slot.stats.queued(),
                dropped: slot.stats.dropped(),
                failed: slot.stats.failed(),
            })
            .collect();
        reports.sort_by_key(|r| r.id);
        reports
    }

    /// Unsubscribe everyone and release the persistence sink. Delivery tasks
    /// and the persistence worker drain what is queued and exit.
    pub fn close(&self) {
        self.persistence.lock().take();
        let slots: Vec<Arc<Slot>> = self.subscribers.write().drain().map(|(_, s)| s).collect();
        if !slots.is_empty() {
            info!("Closing {} subscriber(s)", slots.len());
        }
        for slot in slots {
            slot.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{RawFrame, decode};
    use crate::store::{EventStore, StoreError, spawn_persistence};

    fn hub(capacity: usize) -> Hub {
        Hub::new(capacity, Arc::new(Health::default()))
    }

    fn numbered(n: u64) -> Payload {
        Payload::External(serde_json::json!({ "n": n }))
    }

    fn number(payload: &Payload) -> u64 {
        match payload {
            Payload::External(value) => value["n"].as_u64().unwrap(),
            Payload::Decoded(_) => panic!("unexpected decoded event"),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_in_order() {
        let hub = hub(16);
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        for n in 0..10 {
            assert_eq!(hub.publish(numbered(n)), 2);
        }
        for sub in [&mut a, &mut b] {
            for n in 0..10 {
                assert_eq!(number(&sub.recv().await.unwrap()), n);
            }
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_for_that_subscriber_only() {
        let hub = hub(4);
        let mut slow = hub.subscribe("slow");
        let mut fast = hub.subscribe("fast");

        for n in 0..10 {
            hub.publish(numbered(n));
            assert_eq!(number(&fast.recv().await.unwrap()), n);
        }

        assert_eq!(slow.stats().dropped(), 6);
        assert_eq!(fast.stats().dropped(), 0);
        for n in 0..4 {
            assert_eq!(number(&slow.recv().await.unwrap()), n);
        }
        hub.publish(numbered(99));
        assert_eq!(number(&slow.recv().await.unwrap()), 99);
    }

    #[tokio::test]
    async fn test_slow_consumers_see_ordered_subsequences() {
        let hub = Arc::new(hub(8));
        let delays = [0u64, 1, 5];
        let mut consumers = Vec::new();
        for delay in delays {
            let mut sub = hub.subscribe(format!("delay-{delay}"));
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(payload) = sub.recv().await {
                    seen.push(number(&payload));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                seen
            }));
        }

        let started = tokio::time::Instant::now();
        for n in 0..200 {
            hub.publish(numbered(n));
            if n % 20 == 0 {
                tokio::task::yield_now().await;
            }
        }
        // Publishing never waited on the slow consumers.
        assert!(started.elapsed() < Duration::from_millis(500));
        hub.close();

        for consumer in consumers {
            let seen = consumer.await.unwrap();
            assert!(!seen.is_empty());
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_queue_and_stops_delivery() {
        let hub = hub(8);
        let mut sub = hub.subscribe("leaving");
        let other = hub.subscribe("staying");

        hub.publish(numbered(1));
        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));
        assert_eq!(hub.publish(numbered(2)), 1);

        assert_eq!(number(&sub.recv().await.unwrap()), 1);
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 1);
        drop(other);
    }

    #[tokio::test]
    async fn test_unsubscribe_during_concurrent_publish() {
        let hub = Arc::new(hub(1024));
        let mut subs: Vec<SubscriberHandle> = (0..8).map(|i| hub.subscribe(format!("s{i}"))).collect();

        let publisher = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for n in 0..500 {
                    hub.publish(numbered(n));
                    tokio::task::yield_now().await;
                }
            })
        };
        for sub in &subs {
            hub.unsubscribe(sub.id());
            tokio::task::yield_now().await;
        }
        publisher.await.unwrap();

        for sub in &mut subs {
            let mut last = None;
            while let Some(payload) = sub.recv().await {
                let n = number(&payload);
                assert!(last.is_none_or(|l| l < n));
                last = Some(n);
            }
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let hub = hub(8);
        let sub = hub.subscribe("gone");
        drop(sub);
        assert_eq!(hub.publish(numbered(1)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_report_lists_subscribers() {
        let hub = hub(1);
        let _a = hub.subscribe("webhook http://localhost/hook");
        hub.publish(numbered(1));
        hub.publish(numbered(2));
        let report = hub.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].queued, 1);
        assert_eq!(report[0].dropped, 1);
    }

    struct BrokenStore;

    impl EventStore for BrokenStore {
        fn append(
            &mut self,
            _event: &DecodedEvent,
            _recorded_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery))
        }
    }

    #[test]
    fn test_close_lets_persistence_worker_drain_and_exit() {
        let health = Arc::new(Health::default());
        let store = crate::store::SqliteStore::open_in_memory().unwrap();
        let (sink, worker) = spawn_persistence(store, 8, Arc::clone(&health)).unwrap();
        let hub = Hub::new(8, Arc::clone(&health)).with_persistence(sink);

        for face in 1..=3 {
            let event = decode(&RawFrame::new("die", vec![3, 1, face])).unwrap();
            hub.publish(Payload::Decoded(event));
        }
        hub.close();
        worker.join().unwrap();

        let report = health.report(crate::connection::ConnectionState::Idle, Vec::new());
        assert_eq!(report.persisted, 3);
        assert_eq!(report.persist_dropped, 0);

        // Nothing is submitted after close.
        let late = decode(&RawFrame::new("die", vec![3, 1, 4])).unwrap();
        hub.publish(Payload::Decoded(late));
        let report = health.report(crate::connection::ConnectionState::Idle, Vec::new());
        assert_eq!(report.persist_failures, 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block_fan_out() {
        let health = Arc::new(Health::default());
        let (sink, _worker) = spawn_persistence(BrokenStore, 8, Arc::clone(&health)).unwrap();
        let hub = Hub::new(8, Arc::clone(&health)).with_persistence(sink);
        let mut sub = hub.subscribe("live");

        let event = decode(&RawFrame::new("die", vec![3, 1, 5])).unwrap();
        assert_eq!(hub.publish(Payload::Decoded(event.clone())), 1);
        assert_eq!(*sub.recv().await.unwrap(), Payload::Decoded(event));

        for _ in 0..200 {
            if !health.persistence_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!health.persistence_ok());
    }
}

//! In-process fan-out of live telemetry to realtime consumers.
//!
//! Every subscriber owns a bounded buffer. Publishing never waits: a full
//! buffer loses that one event for that one subscriber, and a closed buffer is
//! pruned from the registry.

use crate::telemetry::SharedEvent;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 200;

pub type SubscriptionId = u64;

#[derive(Debug, Default)]
pub struct BusStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped_slow: AtomicU64,
    pub removed_closed: AtomicU64,
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<SharedEvent>,
}

struct BusInner {
    capacity: usize,
    next_id: AtomicU64,
    // Copy-on-write: publishers clone the Arc and iterate outside the lock.
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    stats: BusStats,
}

impl BusInner {
    fn snapshot(&self) -> Arc<Vec<Subscriber>> {
        match self.subscribers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn mutate<F>(&self, f: F) -> usize
    where
        F: FnOnce(&mut Vec<Subscriber>),
    {
        let mut guard = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next: Vec<Subscriber> = guard
            .iter()
            .map(|s| Subscriber {
                id: s.id,
                tx: s.tx.clone(),
            })
            .collect();
        f(&mut next);
        let len = next.len();
        *guard = Arc::new(next);
        len
    }

    fn remove(&self, ids: &[SubscriptionId]) -> usize {
        self.mutate(|subs| subs.retain(|s| !ids.contains(&s.id)))
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventBus {
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: subscriber_capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Arc::new(Vec::new())),
                stats: BusStats::default(),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.inner.mutate(|subs| subs.push(Subscriber { id, tx }));
        tracing::info!(subscription = id, subscribers, "event bus subscribe");
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Stops delivery to `subscription`. Events it already buffered stay readable.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.unsubscribe_id(subscription.id);
    }

    fn unsubscribe_id(&self, id: SubscriptionId) {
        let subscribers = self.inner.remove(&[id]);
        tracing::info!(subscription = id, subscribers, "event bus unsubscribe");
    }

    /// Fans `event` out to every current subscriber without waiting on any of them.
    pub fn publish(&self, event: &SharedEvent) {
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.inner.snapshot();
        let mut closed: Vec<SubscriptionId> = Vec::new();

        for subscriber in snapshot.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    self.inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.inner.stats.dropped_slow.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription = subscriber.id,
                        device_uid = %event.device_uid,
                        "slow subscriber; dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
            }
        }

        if !closed.is_empty() {
            self.inner
                .stats
                .removed_closed
                .fetch_add(closed.len() as u64, Ordering::Relaxed);
            let subscribers = self.inner.remove(&closed);
            tracing::info!(removed = closed.len(), subscribers, "pruned closed subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.snapshot().len()
    }

    pub fn subscriber_capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> &BusStats {
        &self.inner.stats
    }
}

/// One consumer's bounded buffer. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<SharedEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next buffered event; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<SharedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SharedEvent> {
        self.rx.try_recv().ok()
    }

    /// Events waiting in this subscriber's buffer.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Stream for Subscription {
    type Item = SharedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&[self.id]);
        }
    }
}

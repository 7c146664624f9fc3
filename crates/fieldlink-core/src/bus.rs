// ── Message bus ──
//
// Publish/consume seam between acquisition and reconciliation. The
// production broker connection lives outside this crate; `MemoryBus`
// gives the same at-least-once semantics in-process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use crate::error::BusError;

// ── Traits ──────────────────────────────────────────────────────────

/// Outbound side: publish raw bytes to an exchange.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes)
    -> Result<(), BusError>;
}

/// Inbound side: yields deliveries until the source closes.
#[async_trait]
pub trait MessageSource: Send {
    async fn next(&mut self) -> Option<Delivery>;
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BusError>;
}

// ── Delivery ────────────────────────────────────────────────────────

/// One consumed message. Must be settled exactly once.
pub struct Delivery {
    payload: Bytes,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Bytes, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    /// Negative acknowledgement. With `requeue` the broker redelivers
    /// the message later; without it the message is dropped.
    pub async fn nack(self, requeue: bool) -> Result<(), BusError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

// ── MemoryBus ───────────────────────────────────────────────────────

/// Settlement counters for one in-memory queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicUsize,
    acked: AtomicUsize,
    requeued: AtomicUsize,
    dropped: AtomicUsize,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<(Bytes, bool)>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<(Bytes, bool)>>>,
    counters: Arc<Counters>,
}

/// In-process exchange/queue router.
///
/// Exchanges fan out to every bound queue; each queue has a single
/// consumer obtained through [`MemoryBus::consume`].
#[derive(Clone, Default)]
pub struct MemoryBus {
    bindings: Arc<DashMap<String, Vec<String>>>,
    queues: Arc<DashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `queue` (if needed) and bind it to `exchange`.
    pub fn bind(&self, exchange: &str, queue: &str) {
        self.declare(queue);
        let mut bound = self.bindings.entry(exchange.to_owned()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_owned());
        }
    }

    fn declare(&self, queue: &str) -> Arc<MemoryQueue> {
        Arc::clone(
            self.queues
                .entry(queue.to_owned())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    Arc::new(MemoryQueue {
                        tx,
                        rx: Mutex::new(Some(rx)),
                        counters: Arc::default(),
                    })
                })
                .value(),
        )
    }

    /// Take the consumer side of `queue`. Returns `None` if another
    /// consumer already holds it.
    pub async fn consume(&self, queue: &str) -> Option<MemorySource> {
        let declared = self.declare(queue);
        let rx = declared.rx.lock().await.take()?;
        Some(MemorySource {
            rx,
            tx: declared.tx.clone(),
            counters: Arc::clone(&declared.counters),
        })
    }

    pub fn stats(&self, queue: &str) -> QueueStats {
        self.queues
            .get(queue)
            .map(|q| {
                let c = &q.counters;
                QueueStats {
                    published: c.published.load(Ordering::Relaxed),
                    acked: c.acked.load(Ordering::Relaxed),
                    requeued: c.requeued.load(Ordering::Relaxed),
                    dropped: c.dropped.load(Ordering::Relaxed),
                }
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageSink for MemoryBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        let targets = self
            .bindings
            .get(exchange)
            .map(|b| b.value().clone())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| BusError::Unroutable {
                exchange: exchange.to_owned(),
            })?;

        for name in targets {
            let queue = self.declare(&name);
            queue
                .tx
                .send((payload.clone(), false))
                .map_err(|_| BusError::Closed)?;
            queue.counters.published.fetch_add(1, Ordering::Relaxed);
            trace!(exchange, routing_key, queue = %name, "published message");
        }
        Ok(())
    }
}

/// Consumer handle for one in-memory queue.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<(Bytes, bool)>,
    tx: mpsc::UnboundedSender<(Bytes, bool)>,
    counters: Arc<Counters>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next(&mut self) -> Option<Delivery> {
        let (payload, redelivered) = self.rx.recv().await?;
        let acker = MemoryAcker {
            payload: payload.clone(),
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
        };
        Some(Delivery::new(payload, redelivered, Box::new(acker)))
    }
}

struct MemoryAcker {
    payload: Bytes,
    tx: mpsc::UnboundedSender<(Bytes, bool)>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BusError> {
        if requeue {
            self.counters.requeued.fetch_add(1, Ordering::Relaxed);
            self.tx
                .send((self.payload.clone(), true))
                .map_err(|_| BusError::Closed)
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_fans_out_to_bound_queues() {
        let bus = MemoryBus::new();
        bus.bind("uo.raw", "store");
        bus.bind("uo.raw", "websocket");

        bus.publish("uo.raw", "", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let mut store = bus.consume("store").await.unwrap();
        let mut ws = bus.consume("websocket").await.unwrap();
        assert_eq!(store.next().await.unwrap().payload(), b"{}");
        assert_eq!(ws.next().await.unwrap().payload(), b"{}");
    }

    #[tokio::test]
    async fn unbound_exchange_is_unroutable() {
        let bus = MemoryBus::new();
        let err = bus
            .publish("nowhere", "", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Unroutable { .. }));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let bus = MemoryBus::new();
        bus.bind("x", "q");
        bus.publish("x", "", Bytes::from_static(b"a")).await.unwrap();

        let mut source = bus.consume("q").await.unwrap();
        let first = source.next().await.unwrap();
        assert!(!first.redelivered());
        first.nack(true).await.unwrap();

        let again = source.next().await.unwrap();
        assert!(again.redelivered());
        again.ack().await.unwrap();

        let stats = bus.stats("q");
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test]
    async fn queue_has_a_single_consumer() {
        let bus = MemoryBus::new();
        bus.bind("x", "q");
        assert!(bus.consume("q").await.is_some());
        assert!(bus.consume("q").await.is_none());
    }
}

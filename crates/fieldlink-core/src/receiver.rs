// ── Receiver ──
//
// Consumes normalized events. The fast path appends a row to the insert
// buffer; the slow path ("full update") reconciles the entity graph for a
// natural key inside one transaction. At most one full update per natural
// key is in flight, and all of them run through the receiver's own queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bus::MessageSource;
use crate::cache::{EXPIRY_HORIZON, QueryCache, purge_task};
use crate::error::CoreError;
use crate::event::{NaturalKey, NormalizedEvent, StorageClass};
use crate::graph::{AssertOutcome, DesiredPlatform, GraphStore, ResolvedSensor, assert_platform};
use crate::queue::RequestQueue;
use crate::values::{
    DEFAULT_BUFFER_LIMIT, DEFAULT_TRANSACTION_FREQUENCY, DataRow, InsertBuffer, ValueStore,
};

/// Default period after which a natural key is reconciled again.
pub const DEFAULT_FULL_UPDATE_FREQUENCY: Duration = Duration::from_secs(1800);

/// Pause before pulling the next message after a backpressure nack.
const BACKPRESSURE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSettings {
    /// Zero disables staleness-driven reconciliation.
    pub full_update_frequency: Duration,
    pub transaction_frequency: Duration,
    pub buffer_limit: usize,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            full_update_frequency: DEFAULT_FULL_UPDATE_FREQUENCY,
            transaction_frequency: DEFAULT_TRANSACTION_FREQUENCY,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

/// What happened to one consumed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumed {
    /// Buffered for the next batch insert.
    Stored,
    /// Dropped; the event was invalid or carried no value.
    Rejected(String),
    /// The insert buffer is full; the caller should retry later.
    Backpressure,
    /// Held until the source's reconciliation completes.
    Deferred,
}

struct ReceiverInner {
    graph: Arc<dyn GraphStore>,
    buffer: InsertBuffer,
    staleness: Arc<QueryCache<bool>>,
    sensors: Arc<QueryCache<ResolvedSensor>>,
    /// Natural keys with a full update in flight, and the events waiting
    /// on each.
    pending: DashMap<String, Vec<NormalizedEvent>>,
    queue: RequestQueue,
    settings: ReceiverSettings,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to the reconciliation engine.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<ReceiverInner>,
}

impl Receiver {
    /// Must be called within a Tokio runtime.
    pub fn new(
        graph: Arc<dyn GraphStore>,
        values: Arc<dyn ValueStore>,
        settings: ReceiverSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                graph,
                buffer: InsertBuffer::new(values, settings.buffer_limit),
                staleness: Arc::new(QueryCache::with_horizon(
                    settings.full_update_frequency.max(EXPIRY_HORIZON),
                )),
                sensors: Arc::new(QueryCache::new()),
                pending: DashMap::new(),
                queue: RequestQueue::new("receiver"),
                settings,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &ReceiverSettings {
        &self.inner.settings
    }

    pub fn buffer(&self) -> &InsertBuffer {
        &self.inner.buffer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether `key` was reconciled within the staleness window.
    pub fn is_fresh(&self, key: &NaturalKey) -> bool {
        self.inner.staleness.contains(&key.staleness_key())
    }

    pub fn is_pending(&self, key: &NaturalKey) -> bool {
        self.inner.pending.contains_key(&key.pending_id())
    }

    /// Spawn the insert flush loop and the cache expiry sweeps.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.inner
                .buffer
                .spawn_flush_task(self.inner.settings.transaction_frequency, cancel.child_token()),
            tokio::spawn(purge_task(
                Arc::clone(&self.inner.staleness),
                cancel.child_token(),
            )),
            tokio::spawn(purge_task(Arc::clone(&self.inner.sensors), cancel.child_token())),
        ]
    }

    /// Stop accepting events and write out buffered rows.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.buffer.shutdown().await;
    }

    /// Wait until every reconciliation queued so far has finished.
    pub async fn settle(&self) -> Result<(), CoreError> {
        self.inner.queue.submit(|_| async {}).await
    }

    // ── Consumption ──────────────────────────────────────────────

    /// Process one event. Store lookups that fail are returned as errors;
    /// everything else resolves to a [`Consumed`] outcome.
    pub async fn consume(&self, event: NormalizedEvent) -> Result<Consumed, CoreError> {
        if self.is_closed() {
            return Ok(Consumed::Rejected("receiver is shutting down".into()));
        }

        let storage = match event.validate() {
            Ok(storage) => storage,
            Err(e) => {
                warn!(error = %e, "rejecting event");
                return Ok(Consumed::Rejected(e.to_string()));
            }
        };
        let key = event.natural_key();

        let frequency = self.inner.settings.full_update_frequency;
        if !frequency.is_zero() && self.inner.staleness.fetch(&key.staleness_key(), frequency).is_none()
        {
            self.schedule_full_update(&key, event.clone(), storage, false);
        }

        let Some(sensor) = self.resolve_sensor(&key).await? else {
            self.schedule_full_update(&key, event, storage, true);
            return Ok(Consumed::Deferred);
        };
        let Some(timeseries) = sensor.timeseries.iter().find(|t| t.storage == storage) else {
            debug!(source = %key.source_id, storage = %storage, "no timeseries for storage class yet");
            self.schedule_full_update(&key, event, storage, true);
            return Ok(Consumed::Deferred);
        };

        let value = &event.timeseries.value;
        let Some(data) = value.data.clone() else {
            warn!(source = %key.source_id, broker = %key.broker_id, "event carries no value");
            return Ok(Consumed::Rejected("event carries no value".into()));
        };

        let row = DataRow {
            time: value.time,
            // the sample covers the interval ending at `time`
            duration: -value.time_accuracy.unwrap_or(0.0),
            value: data,
            timeseries_num: timeseries.num,
        };
        if self.inner.buffer.insert(row).await {
            trace!(source = %key.source_id, timeseries = timeseries.num, "buffered value");
            Ok(Consumed::Stored)
        } else {
            debug!(source = %key.source_id, "insert buffer full");
            Ok(Consumed::Backpressure)
        }
    }

    async fn resolve_sensor(&self, key: &NaturalKey) -> Result<Option<ResolvedSensor>, CoreError> {
        let cache_key = sensor_cache_key(key);
        if let Some(sensor) = self.inner.sensors.fetch(&cache_key, EXPIRY_HORIZON) {
            return Ok(Some(sensor));
        }
        let resolved = self
            .inner
            .graph
            .sensor_for_brokerage(&key.broker_id, &key.source_id)
            .await?;
        if let Some(sensor) = &resolved {
            self.inner
                .sensors
                .commit(cache_key, sensor.clone(), sensor.entity_ids());
        }
        Ok(resolved)
    }

    /// Queue a full update for `key` unless one is already in flight.
    /// With `defer`, `event` is consumed again once it completes.
    fn schedule_full_update(
        &self,
        key: &NaturalKey,
        event: NormalizedEvent,
        storage: StorageClass,
        defer: bool,
    ) {
        let pending_id = key.pending_id();
        match self.inner.pending.entry(pending_id.clone()) {
            Entry::Occupied(mut waiting) => {
                if defer {
                    waiting.get_mut().push(event);
                }
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(if defer { vec![event.clone()] } else { Vec::new() });
            }
        }

        info!(source = %key.source_id, broker = %key.broker_id, "creating or updating sensor");
        let receiver = self.clone();
        let queued = self.inner.queue.enqueue(move |_| async move {
            let outcome = receiver.full_update(&event, storage).await;
            let waiting = receiver
                .inner
                .pending
                .remove(&pending_id)
                .map(|(_, events)| events)
                .unwrap_or_default();
            match outcome {
                Ok(_) => receiver.redeliver(waiting).await,
                Err(_) if !waiting.is_empty() => {
                    warn!(
                        source = %event.brokerage.id,
                        dropped = waiting.len(),
                        "dropping events for a source that could not be reconciled"
                    );
                }
                Err(_) => {}
            }
        });
        if queued.is_err() {
            warn!(source = %key.source_id, "receiver queue closed; full update not scheduled");
            self.inner.pending.remove(&key.pending_id());
        }
    }

    /// Consume events that waited on a full update. Their deliveries were
    /// already acked, so a full buffer is waited out instead of dropping
    /// them.
    async fn redeliver(&self, events: Vec<NormalizedEvent>) {
        for event in events {
            let source = event.brokerage.id.clone();
            loop {
                match Box::pin(self.consume(event.clone())).await {
                    Ok(Consumed::Stored) => break,
                    Ok(Consumed::Backpressure) => {
                        debug!(source = %source, "insert buffer full, flushing before redelivery");
                        if self.inner.buffer.flush().await == 0 {
                            tokio::time::sleep(BACKPRESSURE_DELAY).await;
                        }
                    }
                    Ok(other) => {
                        warn!(source = %source, outcome = ?other, "deferred event not stored");
                        break;
                    }
                    Err(e) => {
                        warn!(source = %source, error = %e, "failed to consume deferred event");
                        break;
                    }
                }
            }
        }
    }

    // ── Reconciliation ───────────────────────────────────────────

    /// Reconcile the graph for `event`'s natural key. A duplicate-key
    /// failure, the expected result of racing another writer, is retried
    /// once from scratch.
    pub async fn full_update(
        &self,
        event: &NormalizedEvent,
        storage: StorageClass,
    ) -> Result<AssertOutcome, CoreError> {
        let key = event.natural_key();
        let desired = DesiredPlatform::from_event(event, storage);

        let result = match self.reconcile(&desired).await {
            Err(CoreError::Store(e)) if e.is_unique_violation() => {
                warn!(source = %key.source_id, error = %e, "duplicate key during full update, retrying");
                self.reconcile(&desired).await
            }
            other => other,
        };

        match result {
            Ok(outcome) => {
                debug!(
                    source = %key.source_id,
                    broker = %key.broker_id,
                    created = outcome.created,
                    patched = outcome.patched,
                    "full update complete"
                );
                self.inner.sensors.purge(&sensor_cache_key(&key));
                self.inner.staleness.commit(
                    key.staleness_key(),
                    true,
                    [outcome.sensor_id.to_string(), outcome.platform_id.to_string()],
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(source = %key.source_id, broker = %key.broker_id, error = %e, "full update failed");
                Err(e)
            }
        }
    }

    async fn reconcile(&self, desired: &DesiredPlatform) -> Result<AssertOutcome, CoreError> {
        let mut tx = self.inner.graph.begin().await?;
        let outcome = assert_platform(tx.as_mut(), desired).await?;
        for id in tx.commit().await? {
            self.inner.sensors.purge_by_id(&id.to_string());
        }
        Ok(outcome)
    }

    // ── Consumer loop ────────────────────────────────────────────

    /// Consume from `source` until it ends or `cancel` fires, then flush.
    /// When the source ends, queued reconciliations finish first so their
    /// deferred events are stored.
    ///
    /// Returns [`CoreError::Fatal`] if applying a message failed in a way
    /// that could leave stored data inconsistent; the message is requeued
    /// first.
    pub async fn run<S: MessageSource>(
        &self,
        mut source: S,
        cancel: CancellationToken,
    ) -> Result<(), CoreError> {
        info!("receiver consuming");
        let result = loop {
            let delivery = tokio::select! {
                biased;
                () = cancel.cancelled() => break Ok(()),
                delivery = source.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break self.settle().await,
                },
            };

            if self.is_closed() {
                settle(delivery.nack(true).await);
                continue;
            }

            let event = match NormalizedEvent::from_slice(delivery.payload()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "discarding malformed message");
                    settle(delivery.ack().await);
                    continue;
                }
            };

            match self.consume(event).await {
                Ok(Consumed::Backpressure) => {
                    settle(delivery.nack(true).await);
                    tokio::select! {
                        () = cancel.cancelled() => break Ok(()),
                        () = tokio::time::sleep(BACKPRESSURE_DELAY) => {}
                    }
                }
                Ok(_) => settle(delivery.ack().await),
                Err(e) => {
                    error!(error = %e, "unrecoverable failure while consuming message");
                    settle(delivery.nack(true).await);
                    break Err(CoreError::Fatal {
                        reason: e.to_string(),
                    });
                }
            }
        };

        self.shutdown().await;
        info!("receiver stopped");
        result
    }
}

fn sensor_cache_key(key: &NaturalKey) -> String {
    format!("sensor for {} on {}", key.source_id, key.broker_id)
}

fn settle(result: Result<(), crate::error::BusError>) {
    if let Err(e) = result {
        warn!(error = %e, "failed to settle delivery");
    }
}

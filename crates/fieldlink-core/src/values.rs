// ── Value store ──
//
// Append-only timeseries rows and the insert buffer in front of them.
// Rows are collected in memory and written as one batch per flush tick;
// a failed batch falls back to row-by-row inserts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::schedule::CycleGuard;

/// Default cap on buffered rows.
pub const DEFAULT_BUFFER_LIMIT: usize = 100;

/// Default flush period.
pub const DEFAULT_TRANSACTION_FREQUENCY: Duration = Duration::from_millis(2000);

/// One stored reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub time: DateTime<Utc>,
    /// Seconds the reading covers before `time`, stored as a negative
    /// offset.
    pub duration: f64,
    pub value: serde_json::Value,
    pub timeseries_num: i64,
}

#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Write every row in one transaction; all or nothing.
    async fn insert_batch(&self, rows: &[DataRow]) -> Result<(), StoreError>;

    async fn insert_one(&self, row: &DataRow) -> Result<(), StoreError>;
}

// ── InsertBuffer ────────────────────────────────────────────────────

struct BufferInner {
    store: Arc<dyn ValueStore>,
    limit: usize,
    rows: Mutex<Vec<DataRow>>,
    guard: CycleGuard,
    closed: AtomicBool,
}

/// Bounded buffer of rows awaiting a batched write. Cheap to clone.
#[derive(Clone)]
pub struct InsertBuffer {
    inner: Arc<BufferInner>,
}

impl InsertBuffer {
    pub fn new(store: Arc<dyn ValueStore>, limit: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                store,
                limit,
                rows: Mutex::new(Vec::new()),
                guard: CycleGuard::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a row. Returns `false` when the buffer is full or shut down.
    pub async fn insert(&self, row: DataRow) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut rows = self.inner.rows.lock().await;
        if rows.len() >= self.inner.limit {
            return false;
        }
        rows.push(row);
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Write out buffered rows. Skipped (returning 0) while another flush
    /// is still running.
    pub async fn flush(&self) -> usize {
        let Some(_token) = self.inner.guard.try_enter() else {
            trace!("insert flush still in progress, skipping tick");
            return 0;
        };
        self.drain().await
    }

    /// Reject further rows and write out whatever is buffered.
    pub async fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        let _token = loop {
            if let Some(token) = self.inner.guard.try_enter() {
                break token;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let pending = self.len().await;
        if pending > 0 {
            info!(rows = pending, "flushing insert buffer before shutdown");
        }
        self.drain().await
    }

    /// Flush every `period` until `cancel` fires, then shut down.
    pub fn spawn_flush_task(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        buffer.flush().await;
                    }
                }
            }
            buffer.shutdown().await;
            debug!("insert flush task stopped");
        })
    }

    async fn drain(&self) -> usize {
        let rows = std::mem::take(&mut *self.inner.rows.lock().await);
        if rows.is_empty() {
            return 0;
        }
        debug!(rows = rows.len(), "committing buffered rows");

        match self.inner.store.insert_batch(&rows).await {
            Ok(()) => {
                trace!(rows = rows.len(), "batch insert successful");
                rows.len()
            }
            Err(e) => {
                if !e.is_unique_violation() && !e.is_transaction_aborted() {
                    warn!(error = %e, "error during batch insert");
                }
                debug!(rows = rows.len(), "falling back to singular inserts");
                self.insert_singly(&rows).await
            }
        }
    }

    async fn insert_singly(&self, rows: &[DataRow]) -> usize {
        let mut written = 0;
        for row in rows {
            match self.inner.store.insert_one(row).await {
                Ok(()) => written += 1,
                Err(e) if e.is_unique_violation() || e.is_transaction_aborted() => {
                    trace!(timeseries = row.timeseries_num, "skipping row: {e}");
                }
                Err(e) => {
                    warn!(timeseries = row.timeseries_num, error = %e, "error during timeseries insert");
                }
            }
        }
        written
    }
}

// ── MemoryValueStore ────────────────────────────────────────────────

/// Rows unique on `(timeseries_num, time)`.
#[derive(Default)]
pub struct MemoryValueStore {
    rows: Mutex<Vec<DataRow>>,
}

impl MemoryValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<DataRow> {
        self.rows.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn conflicts(existing: &[DataRow], row: &DataRow) -> bool {
        existing
            .iter()
            .any(|r| r.timeseries_num == row.timeseries_num && r.time == row.time)
    }
}

#[async_trait]
impl ValueStore for MemoryValueStore {
    async fn insert_batch(&self, rows: &[DataRow]) -> Result<(), StoreError> {
        let mut stored = self.rows.lock().await;
        let mut staged: Vec<DataRow> = Vec::with_capacity(rows.len());
        for row in rows {
            if Self::conflicts(&stored, row) || Self::conflicts(&staged, row) {
                return Err(StoreError::unique("data_timeseries_time_key"));
            }
            staged.push(row.clone());
        }
        stored.extend(staged);
        Ok(())
    }

    async fn insert_one(&self, row: &DataRow) -> Result<(), StoreError> {
        let mut stored = self.rows.lock().await;
        if Self::conflicts(&stored, row) {
            return Err(StoreError::unique("data_timeseries_time_key"));
        }
        stored.push(row.clone());
        Ok(())
    }
}

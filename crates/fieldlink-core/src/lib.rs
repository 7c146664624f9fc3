//! Acquisition and reconciliation pipeline for fieldlink.
//!
//! Two halves share the normalized event model:
//!
//! - **Acquisition**: [`ProtocolController`] implementations
//!   ([`BacnetController`], [`ApiController`], [`SocketController`]) are
//!   driven by a [`ControllerRuntime`] through resolve, discovery and
//!   acquisition cycles. Datapoints apply change-of-value suppression and
//!   publish [`NormalizedEvent`]s through an [`Emitter`]. BACnet requests
//!   from every controller pass through one [`RequestQueue`].
//!
//! - **Reconciliation**: the [`Receiver`] consumes events from a
//!   [`MessageSource`], buffers readings into a [`ValueStore`] and, at most
//!   once per source at a time, asserts the platform, sensor and timeseries
//!   in the [`GraphStore`].
//!
//! [`AppContext`] holds the state both halves share.

pub mod api;
pub mod bacnet;
pub mod bus;
pub mod cache;
pub mod classify;
pub mod context;
pub mod controller;
pub mod datapoint;
pub mod emit;
pub mod error;
pub mod event;
pub mod graph;
pub mod queue;
pub mod receiver;
pub mod schedule;
pub mod socket;
pub mod values;

// ── Primary re-exports ──────────────────────────────────────────────
pub use api::{ApiController, ApiOptions, ApiRequest, DownloadOptions, ValuePointers};
pub use bacnet::{BacnetController, BacnetOptions, DiscoveryOptions};
pub use bus::{Delivery, MemoryBus, MessageSink, MessageSource};
pub use cache::QueryCache;
pub use classify::{ViewClassifier, ViewClassifierOptions};
pub use context::{AppContext, ContextSettings};
pub use controller::{
    ControllerRuntime, ControllerState, ProtocolController, RuntimeSettings, Schedule, Sweep,
};
pub use datapoint::{
    CovPolicy, DebounceRule, DebounceTable, MetadataTemplate, Observation, PrecisionRule,
};
pub use emit::{Emitted, Emitter, PreSendHook};
pub use error::{BusError, CoreError, StoreError};
pub use event::{Meta, NaturalKey, NormalizedEvent, StorageClass};
pub use graph::{GraphStore, GraphTransaction, MemoryGraphStore};
pub use queue::{Requeue, RequestQueue, submit_with_retry};
pub use receiver::{Consumed, Receiver, ReceiverSettings};
pub use socket::{CastAs, SocketController, SocketOptions, ValueDescription};
pub use values::{DataRow, InsertBuffer, MemoryValueStore, ValueStore};

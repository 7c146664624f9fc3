// ── Controller framework ──
//
// One trait per protocol family plus a generic runtime that owns the
// connection lifecycle: address resolution, snapshot rehydration and the
// discovery, acquisition and snapshot timers.

pub mod runtime;
pub mod snapshot;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::event::Meta;

pub use runtime::{ControllerRuntime, RuntimeSettings, resolve_endpoint};
pub use snapshot::SnapshotCache;

// ── Lifecycle state ─────────────────────────────────────────────────

/// What a connected controller is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Discovering,
    Acquiring,
}

/// Controller lifecycle, published through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Unresolved,
    Resolving,
    Connected(Activity),
    Disconnecting,
    Disconnected,
}

impl ControllerState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Result of one discovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// More of the address space remains in this sweep.
    Continue,
    /// The cursor wrapped; wait for the next aligned interval.
    Complete,
}

/// Which timers the runtime drives for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Schedule {
    /// Sweep period, aligned to wall-clock multiples. `None` disables.
    pub discovery: Option<Duration>,
    /// Fixed acquisition period. `None` disables.
    pub acquisition: Option<Duration>,
    /// Whether [`ProtocolController::stream`] should be driven.
    pub streaming: bool,
}

// ── ProtocolController ──────────────────────────────────────────────

/// A source of readings speaking one protocol.
///
/// Implementations hold their own instance map and emit events
/// themselves; the runtime only decides when each phase runs.
#[async_trait]
pub trait ProtocolController: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Protocol tag, e.g. `"BACNET"`.
    fn protocol(&self) -> &'static str;

    /// Broker metadata attached to every emitted event.
    fn metadata(&self) -> Meta;

    /// Configured network address. `None` means the controller works
    /// from its snapshot alone.
    fn address(&self) -> Option<&str>;

    fn port(&self) -> u16;

    fn schedule(&self) -> Schedule;

    async fn connect(&self, endpoint: Option<SocketAddr>) -> Result<(), CoreError>;

    /// Advance discovery by one batch.
    async fn discover_step(&self) -> Result<Sweep, CoreError> {
        Ok(Sweep::Complete)
    }

    /// Poll every known instance once.
    async fn acquire(&self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Consume a push-style transport until it fails or `cancel` fires.
    async fn stream(&self, cancel: CancellationToken) -> Result<(), CoreError> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoreError>;

    /// Release resources beyond the connection. Called once at shutdown.
    async fn destroy(&self) {}

    /// State worth persisting across restarts.
    async fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    async fn restore(&self, _snapshot: serde_json::Value) -> Result<(), CoreError> {
        Ok(())
    }
}

// ── Controller runtime ──
//
// Drives one `ProtocolController` through its lifecycle. Discovery and
// acquisition are independent timers, each guarded so a tick that finds
// the previous cycle still running is skipped.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{Activity, ControllerState, ProtocolController, Sweep};
use crate::controller::snapshot::SnapshotCache;
use crate::error::CoreError;
use crate::schedule::{CycleGuard, next_aligned};

/// Fixed delay between connection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub cache_dir: PathBuf,
    /// Period of snapshot writes. Zero disables the timer; a final
    /// snapshot is still written on disconnect.
    pub snapshot_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            snapshot_interval: Duration::from_secs(60),
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

// ── ControllerRuntime ───────────────────────────────────────────────

/// Cheaply cloneable handle driving one controller.
#[derive(Clone)]
pub struct ControllerRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    controller: Arc<dyn ProtocolController>,
    settings: RuntimeSettings,
    snapshot: SnapshotCache,
    state: watch::Sender<ControllerState>,
    cancel: CancellationToken,
    /// Child token for the current connection, replaced on reconnect.
    cancel_child: Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Acquisition cycles started by the timer.
    cycles: TaskTracker,
    discovery_guard: CycleGuard,
    acquisition_guard: CycleGuard,
    restored: AtomicBool,
}

impl ControllerRuntime {
    pub fn new(
        controller: Arc<dyn ProtocolController>,
        settings: RuntimeSettings,
        cancel: &CancellationToken,
    ) -> Self {
        let snapshot = SnapshotCache::new(&settings.cache_dir, controller.name());
        let (state, _) = watch::channel(ControllerState::Unresolved);
        let cancel = cancel.child_token();
        let cancel_child = cancel.child_token();
        Self {
            inner: Arc::new(RuntimeInner {
                controller,
                settings,
                snapshot,
                state,
                cancel,
                cancel_child: Mutex::new(cancel_child),
                task_handles: Mutex::new(Vec::new()),
                cycles: TaskTracker::new(),
                discovery_guard: CycleGuard::new(),
                acquisition_guard: CycleGuard::new(),
                restored: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.controller.name()
    }

    pub fn controller(&self) -> &Arc<dyn ProtocolController> {
        &self.inner.controller
    }

    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: ControllerState) {
        self.inner.state.send_replace(state);
    }

    /// Re-derive the connected activity from the cycle guards.
    fn publish_activity(&self) {
        let activity = if self.inner.discovery_guard.is_active() {
            Activity::Discovering
        } else if self.inner.acquisition_guard.is_active() {
            Activity::Acquiring
        } else {
            Activity::Idle
        };
        self.inner.state.send_if_modified(|state| {
            let next = ControllerState::Connected(activity);
            if state.is_connected() && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Resolve, connect, rehydrate and start the scheduled timers.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let controller = &self.inner.controller;
        let name = controller.name().to_owned();

        self.set_state(ControllerState::Resolving);
        let endpoint = match resolve_endpoint(&name, controller.address(), controller.port()).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.set_state(ControllerState::Unresolved);
                return Err(e);
            }
        };
        match endpoint {
            Some(addr) => info!(controller = %name, %addr, "connecting"),
            None => info!(controller = %name, snapshot = %self.inner.snapshot.path().display(), "no network address, using snapshot only"),
        }

        if let Err(e) = controller.connect(endpoint).await {
            self.set_state(ControllerState::Disconnected);
            return Err(e);
        }

        if !self.inner.restored.swap(true, Ordering::AcqRel) {
            if let Some(snapshot) = self.inner.snapshot.read().await {
                if let Err(e) = controller.restore(snapshot).await {
                    warn!(controller = %name, error = %e, "unable to restore from snapshot");
                }
            }
        }

        self.set_state(ControllerState::Connected(Activity::Idle));

        let child = self.inner.cancel.child_token();
        *self.inner.cancel_child.lock().await = child.clone();

        let schedule = controller.schedule();
        let mut handles = self.inner.task_handles.lock().await;
        if let Some(period) = schedule.discovery {
            handles.push(tokio::spawn(discovery_task(self.clone(), period, child.clone())));
        }
        if let Some(period) = schedule.acquisition {
            handles.push(tokio::spawn(acquisition_task(self.clone(), period, child.clone())));
        }
        if schedule.streaming {
            handles.push(tokio::spawn(stream_task(self.clone(), child.clone())));
        }
        if !self.inner.settings.snapshot_interval.is_zero() {
            let period = self.inner.settings.snapshot_interval;
            handles.push(tokio::spawn(snapshot_task(self.clone(), period, child)));
        }
        info!(controller = %name, tasks = handles.len(), "controller connected");
        Ok(())
    }

    /// Stop the timers, let a running acquisition finish, then persist a
    /// final snapshot and tear down transport.
    pub async fn disconnect(&self) {
        let name = self.name().to_owned();
        self.set_state(ControllerState::Disconnecting);
        self.inner.cancel_child.lock().await.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        self.inner.cycles.close();
        self.inner.cycles.wait().await;
        self.inner.cycles.reopen();

        self.write_snapshot().await;
        if let Err(e) = self.inner.controller.disconnect().await {
            warn!(controller = %name, error = %e, "error while disconnecting");
        }
        self.set_state(ControllerState::Disconnected);
        info!(controller = %name, "controller disconnected");
    }

    /// Connect with a fixed backoff, then hold until shutdown.
    pub async fn run(&self) {
        let name = self.name().to_owned();
        let cancel = self.inner.cancel.clone();

        loop {
            match self.connect().await {
                Ok(()) => break,
                Err(e) => {
                    let delay = self.inner.settings.reconnect_delay;
                    warn!(controller = %name, error = %e, retry_in = ?delay, "connection failed");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            self.inner.controller.destroy().await;
                            self.set_state(ControllerState::Disconnected);
                            return;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        cancel.cancelled().await;
        self.disconnect().await;
        self.inner.controller.destroy().await;
    }

    /// Run one discovery sweep to completion, honouring cancellation
    /// between steps.
    pub async fn sweep(&self, cancel: &CancellationToken) {
        let name = self.name();
        let mut steps = 0u32;
        loop {
            if cancel.is_cancelled() {
                debug!(controller = %name, "discovery interrupted by shutdown");
                return;
            }
            steps += 1;
            match self.inner.controller.discover_step().await {
                Ok(Sweep::Continue) => {}
                Ok(Sweep::Complete) => {
                    info!(controller = %name, steps, "discovery sweep complete");
                    return;
                }
                Err(e) => {
                    warn!(controller = %name, error = %e, "discovery step failed");
                    return;
                }
            }
        }
    }

    async fn write_snapshot(&self) {
        let Some(snapshot) = self.inner.controller.snapshot().await else {
            return;
        };
        if let Err(e) = self.inner.snapshot.write(&snapshot).await {
            warn!(controller = %self.name(), error = %e, "unable to write snapshot");
        }
    }
}

// ── Background tasks ────────────────────────────────────────────────

async fn discovery_task(rt: ControllerRuntime, period: Duration, cancel: CancellationToken) {
    loop {
        match rt.inner.discovery_guard.try_enter() {
            Some(token) => {
                rt.publish_activity();
                info!(controller = %rt.name(), "starting discovery");
                rt.sweep(&cancel).await;
                drop(token);
                rt.publish_activity();
            }
            None => debug!(controller = %rt.name(), "discovery still in progress, skipping"),
        }

        let delay = next_aligned(Utc::now(), period);
        debug!(controller = %rt.name(), next_in = ?delay, "discovery paused until next interval");
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn acquisition_task(rt: ControllerRuntime, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(token) = rt.inner.acquisition_guard.try_enter() else {
                    debug!(controller = %rt.name(), "acquisition still in progress, skipping tick");
                    continue;
                };
                let cycle = rt.clone();
                rt.inner.cycles.spawn(async move {
                    cycle.publish_activity();
                    if let Err(e) = cycle.inner.controller.acquire().await {
                        warn!(controller = %cycle.name(), error = %e, "acquisition failed");
                    }
                    drop(token);
                    cycle.publish_activity();
                });
            }
        }
    }
}

async fn stream_task(rt: ControllerRuntime, cancel: CancellationToken) {
    let delay = rt.inner.settings.reconnect_delay;
    loop {
        match rt.inner.controller.stream(cancel.clone()).await {
            Ok(()) if cancel.is_cancelled() => break,
            Ok(()) => debug!(controller = %rt.name(), "stream ended, reconnecting"),
            Err(e) => warn!(controller = %rt.name(), error = %e, retry_in = ?delay, "stream failed"),
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn snapshot_task(rt: ControllerRuntime, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => rt.write_snapshot().await,
        }
    }
}

// ── Address resolution ──────────────────────────────────────────────

/// Resolve a configured address. An absent or empty address yields
/// `None`; hostnames prefer an IPv4 result.
pub async fn resolve_endpoint(
    controller: &str,
    address: Option<&str>,
    port: u16,
) -> Result<Option<SocketAddr>, CoreError> {
    let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(Some(SocketAddr::new(ip, port)));
    }

    let resolve_err = |reason: String| CoreError::Resolve {
        controller: controller.to_owned(),
        address: address.to_owned(),
        reason,
    };
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((address, port))
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .collect();
    candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .map(Some)
        .ok_or_else(|| resolve_err("no addresses returned".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::controller::Schedule;
    use crate::event::Meta;

    #[tokio::test]
    async fn literal_and_empty_addresses_resolve_without_dns() {
        assert_eq!(resolve_endpoint("x", None, 47808).await.unwrap(), None);
        assert_eq!(resolve_endpoint("x", Some("  "), 47808).await.unwrap(), None);
        assert_eq!(
            resolve_endpoint("x", Some("10.0.0.5"), 47808).await.unwrap(),
            Some("10.0.0.5:47808".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let addr = resolve_endpoint("x", Some("localhost"), 80).await.unwrap().unwrap();
        assert!(addr.ip().is_loopback());
    }

    /// Counts phases; each discovery sweep takes `steps` steps.
    struct Counting {
        steps: u32,
        step_calls: AtomicU32,
        acquisitions: AtomicU32,
        completed: AtomicU32,
        acquire_delay: Duration,
        disconnected: AtomicBool,
    }

    #[async_trait]
    impl ProtocolController for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn protocol(&self) -> &'static str {
            "TEST"
        }
        fn metadata(&self) -> Meta {
            Meta::new()
        }
        fn address(&self) -> Option<&str> {
            None
        }
        fn port(&self) -> u16 {
            0
        }
        fn schedule(&self) -> Schedule {
            Schedule {
                discovery: Some(Duration::from_secs(3600)),
                acquisition: Some(Duration::from_secs(10)),
                streaming: false,
            }
        }
        async fn connect(&self, _endpoint: Option<SocketAddr>) -> Result<(), CoreError> {
            Ok(())
        }
        async fn discover_step(&self) -> Result<Sweep, CoreError> {
            let n = self.step_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n % self.steps == 0 {
                Sweep::Complete
            } else {
                Sweep::Continue
            })
        }
        async fn acquire(&self) -> Result<(), CoreError> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.acquire_delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), CoreError> {
            self.disconnected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn snapshot(&self) -> Option<serde_json::Value> {
            Some(serde_json::json!({
                "steps": self.step_calls.load(Ordering::SeqCst),
                "completed": self.completed.load(Ordering::SeqCst),
            }))
        }
    }

    fn counting(acquire_delay: Duration) -> Arc<Counting> {
        Arc::new(Counting {
            steps: 3,
            step_calls: AtomicU32::new(0),
            acquisitions: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            acquire_delay,
            disconnected: AtomicBool::new(false),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acquisition_skips_overlapping_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let controller = counting(Duration::from_secs(25));
        let cancel = CancellationToken::new();
        let settings = RuntimeSettings {
            cache_dir: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        };
        let rt = ControllerRuntime::new(Arc::clone(&controller) as Arc<dyn ProtocolController>, settings, &cancel);

        rt.connect().await.unwrap();
        // Ticks at 0, 10, 20, 30, 40, 50; a 25 s cycle admits 0, 30.
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(controller.acquisitions.load(Ordering::SeqCst), 2);

        // Sweeps run to completion: whole multiples of the step count.
        let steps = controller.step_calls.load(Ordering::SeqCst);
        assert!(steps >= 3 && steps % 3 == 0);
        rt.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_writes_a_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let controller = counting(Duration::ZERO);
        let cancel = CancellationToken::new();
        let settings = RuntimeSettings {
            cache_dir: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        };
        let rt = ControllerRuntime::new(Arc::clone(&controller) as Arc<dyn ProtocolController>, settings, &cancel);

        let run = tokio::spawn({
            let rt = rt.clone();
            async move { rt.run().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rt.state().borrow().is_connected());

        cancel.cancel();
        run.await.unwrap();

        assert!(controller.disconnected.load(Ordering::SeqCst));
        assert_eq!(*rt.state().borrow(), ControllerState::Disconnected);
        let written = SnapshotCache::new(dir.path(), "counting").read().await.unwrap();
        assert_eq!(written["steps"], controller.step_calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_waits_for_the_running_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let controller = counting(Duration::from_secs(25));
        let cancel = CancellationToken::new();
        let settings = RuntimeSettings {
            cache_dir: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        };
        let rt = ControllerRuntime::new(Arc::clone(&controller) as Arc<dyn ProtocolController>, settings, &cancel);

        rt.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.completed.load(Ordering::SeqCst), 0);

        rt.disconnect().await;

        assert_eq!(controller.completed.load(Ordering::SeqCst), 1);
        let written = SnapshotCache::new(dir.path(), "counting").read().await.unwrap();
        assert_eq!(written["completed"], 1);
    }
}

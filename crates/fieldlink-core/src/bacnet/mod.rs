// ── BACnet controller ──
//
// Discovers objects by sweeping an instance range and polls their
// present values in batches. Every read goes through a request queue
// shared by all BACnet controllers, bounding traffic on the network.

pub mod discovery;
pub mod object;
pub mod response;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fieldlink_api::bacnet::codec::{MAX_APDU_LEN, split_read_access};
use fieldlink_api::{ObjectId, ObjectType, PropertyId, ReadAccessSpec, ReadPropertyMultiple};
use futures_util::future::join_all;
use indexmap::IndexMap;
use strum::IntoEnumIterator;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::controller::{ProtocolController, Schedule, Sweep};
use crate::datapoint::{CovPolicy, MetadataTemplate};
use crate::emit::Emitter;
use crate::error::CoreError;
use crate::event::Meta;
use crate::queue::{RequestQueue, RetryError, submit_with_retry};

pub use discovery::DiscoveryCursor;
pub use object::{BacnetObject, SnapshotEntry};
pub use response::{ObjectResponse, PropertyData, PropertyMap, map_response};

/// Standard BACnet/IP port.
pub const DEFAULT_PORT: u16 = 47808;

/// Properties requested for a newly discovered object.
pub const METADATA_PROPERTIES: [PropertyId; 5] = [
    PropertyId::Name,
    PropertyId::Description,
    PropertyId::Units,
    PropertyId::PresentValue,
    PropertyId::OutOfService,
];

// ── Options ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub object_id_start: u32,
    /// Exclusive end of the swept instance range.
    pub object_id_end: u32,
    pub object_batch_size: u32,
    /// Sweep period. `None` disables discovery.
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BacnetOptions {
    pub name: String,
    pub address: Option<String>,
    pub port: u16,
    pub discovery: DiscoveryOptions,
    /// Acquisition period. `None` disables acquisition.
    pub update_interval: Option<Duration>,
    pub update_batch_size: usize,
    pub cov: CovPolicy,
    /// Total attempts for a request that keeps timing out.
    pub max_attempts: u32,
    pub template: MetadataTemplate,
}

// ── Controller ──────────────────────────────────────────────────────

struct BacnetState {
    device: Option<SocketAddr>,
    cursor: DiscoveryCursor,
    objects: IndexMap<ObjectId, BacnetObject>,
}

pub struct BacnetController {
    options: BacnetOptions,
    transport: Arc<dyn ReadPropertyMultiple>,
    queue: RequestQueue,
    emitter: Emitter,
    state: Mutex<BacnetState>,
}

impl BacnetController {
    /// `queue` should be the one shared by every BACnet controller.
    pub fn new(
        options: BacnetOptions,
        transport: Arc<dyn ReadPropertyMultiple>,
        queue: RequestQueue,
        emitter: Emitter,
    ) -> Self {
        let d = &options.discovery;
        let cursor = DiscoveryCursor::new(d.object_id_start, d.object_id_end, d.object_batch_size);
        Self {
            options,
            transport,
            queue,
            emitter,
            state: Mutex::new(BacnetState {
                device: None,
                cursor,
                objects: IndexMap::new(),
            }),
        }
    }

    pub fn options(&self) -> &BacnetOptions {
        &self.options
    }

    pub async fn object_count(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn object(&self, id: ObjectId) -> Option<BacnetObject> {
        self.state.lock().await.objects.get(&id).cloned()
    }

    async fn device(&self) -> Result<SocketAddr, CoreError> {
        self.state
            .lock()
            .await
            .device
            .ok_or_else(|| CoreError::NotConnected {
                controller: self.options.name.clone(),
            })
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Read through the shared queue, retrying timeouts at the tail.
    /// Requests are split so neither the request nor its reply needs
    /// segmentation; each part enters the queue on its own. A failed part
    /// degrades to "no data" for the objects it covered.
    pub async fn read(&self, specs: Vec<ReadAccessSpec>) -> Result<Vec<ObjectResponse>, CoreError> {
        let device = self.device().await?;
        let mut responses = Vec::with_capacity(specs.len());
        for group in split_read_access(&specs, MAX_APDU_LEN) {
            responses.extend(self.read_group(device, group).await?);
        }
        Ok(responses)
    }

    async fn read_group(
        &self,
        device: SocketAddr,
        specs: Vec<ReadAccessSpec>,
    ) -> Result<Vec<ObjectResponse>, CoreError> {
        let specs = Arc::new(specs);
        let request = Arc::clone(&specs);
        let transport = Arc::clone(&self.transport);
        let name = self.options.name.clone();

        let outcome = submit_with_retry(
            &self.queue,
            self.options.max_attempts,
            move |attempt| {
                let transport = Arc::clone(&transport);
                let request = Arc::clone(&request);
                let name = name.clone();
                async move {
                    debug!(controller = %name, attempt, objects = request.len(), "sending BACnet request");
                    transport.read_property_multiple(device, &request).await
                }
            },
            fieldlink_api::Error::is_timeout,
        )
        .await;

        let (first, last) = (
            specs.first().map(|s| s.object),
            specs.last().map(|s| s.object),
        );
        match outcome {
            Ok(results) => Ok(map_response(&specs, Some(results.as_slice()))),
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(
                    controller = %self.options.name,
                    attempts,
                    first = ?first,
                    last = ?last,
                    "request timed out repeatedly, will not retry"
                );
                Ok(map_response(&specs, None))
            }
            Err(RetryError::Failed(e)) => {
                debug!(controller = %self.options.name, error = %e, "request failed");
                Ok(map_response(&specs, None))
            }
            Err(RetryError::Closed) => Err(CoreError::QueueClosed),
        }
    }

    /// Merge responses into known objects and emit the resulting changes.
    async fn apply(&self, responses: Vec<ObjectResponse>) {
        let now = Utc::now();
        let events = {
            let mut state = self.state.lock().await;
            let mut events = Vec::new();
            for response in responses.into_iter().filter(|r| r.exists) {
                let object = state
                    .objects
                    .entry(response.object)
                    .or_insert_with(|| BacnetObject::new(response.object, None));
                let observation = object.consume(&response.properties, &self.options.cov, now);
                if observation.should_emit() {
                    if let Some(event) =
                        object.to_event(&self.options.name, &self.metadata(), &self.options.template)
                    {
                        events.push(event);
                    }
                }
            }
            events
        };

        for event in events {
            self.emitter.emit(event).await;
        }
    }

    async fn request_metadata(&self, objects: &[ObjectId]) -> Result<(), CoreError> {
        for chunk in objects.chunks(self.options.update_batch_size.max(1)) {
            let specs = chunk
                .iter()
                .map(|&id| ReadAccessSpec::new(id, METADATA_PROPERTIES))
                .collect();
            let responses = self.read(specs).await?;
            self.apply(responses).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolController for BacnetController {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn protocol(&self) -> &'static str {
        "BACNET"
    }

    fn metadata(&self) -> Meta {
        let mut meta = Meta::new();
        meta.insert("protocol".into(), self.protocol().into());
        meta
    }

    fn address(&self) -> Option<&str> {
        self.options.address.as_deref()
    }

    fn port(&self) -> u16 {
        self.options.port
    }

    fn schedule(&self) -> Schedule {
        if self.options.address.as_deref().is_none_or(str::is_empty) {
            return Schedule::default();
        }
        Schedule {
            discovery: self.options.discovery.interval,
            acquisition: self.options.update_interval,
            streaming: false,
        }
    }

    async fn connect(&self, endpoint: Option<SocketAddr>) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.device = endpoint;
        state.cursor.reset();
        Ok(())
    }

    async fn discover_step(&self) -> Result<Sweep, CoreError> {
        let (ids, sweep) = {
            let mut state = self.state.lock().await;
            if state.device.is_none() {
                return Err(CoreError::NotConnected {
                    controller: self.options.name.clone(),
                });
            }
            state.cursor.next_batch()
        };
        if ids.is_empty() {
            return Ok(sweep);
        }

        debug!(
            controller = %self.options.name,
            from = ids.start,
            to = ids.end,
            "performing discovery"
        );
        let specs: Vec<ReadAccessSpec> = ids
            .flat_map(|instance| {
                ObjectType::iter().map(move |t| {
                    ReadAccessSpec::new(ObjectId::new(t, instance), [PropertyId::Name])
                })
            })
            .collect();
        let responses = self.read(specs).await?;

        let now = Utc::now();
        let fresh: Vec<ObjectId> = {
            let mut state = self.state.lock().await;
            responses
                .into_iter()
                .filter(|r| r.exists)
                .filter_map(|r| {
                    if state.objects.contains_key(&r.object) {
                        return None;
                    }
                    let name = r
                        .properties
                        .get(&PropertyId::Name)
                        .filter(|p| p.exists)
                        .and_then(PropertyData::text);
                    info!(
                        controller = %self.options.name,
                        object = %r.object,
                        name = name.as_deref().unwrap_or("?"),
                        "discovered BACnet object"
                    );
                    state
                        .objects
                        .insert(r.object, BacnetObject::discovered(r.object, name, now));
                    Some(r.object)
                })
                .collect()
        };

        if !fresh.is_empty() {
            debug!(controller = %self.options.name, count = fresh.len(), "requesting metadata for new objects");
            self.request_metadata(&fresh).await?;
        }
        Ok(sweep)
    }

    async fn acquire(&self) -> Result<(), CoreError> {
        let known: Vec<ObjectId> = self.state.lock().await.objects.keys().copied().collect();
        if known.is_empty() {
            return Ok(());
        }

        debug!(controller = %self.options.name, objects = known.len(), "requesting present values");
        let batches = known
            .chunks(self.options.update_batch_size.max(1))
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|&id| ReadAccessSpec::new(id, [PropertyId::PresentValue]))
                    .collect::<Vec<_>>()
            })
            .map(|specs| self.read(specs));

        for result in join_all(batches).await {
            match result {
                Ok(responses) => self.apply(responses).await,
                Err(e) => warn!(controller = %self.options.name, error = %e, "error during value update"),
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        info!(controller = %self.options.name, "disconnecting from BACnet controller");
        self.state.lock().await.device = None;
        Ok(())
    }

    async fn snapshot(&self) -> Option<serde_json::Value> {
        let entries: Vec<SnapshotEntry> = self
            .state
            .lock()
            .await
            .objects
            .values()
            .map(BacnetObject::to_snapshot)
            .collect();
        serde_json::to_value(entries).ok()
    }

    async fn restore(&self, snapshot: serde_json::Value) -> Result<(), CoreError> {
        let entries: Vec<SnapshotEntry> =
            serde_json::from_value(snapshot).map_err(|e| CoreError::Snapshot {
                controller: self.options.name.clone(),
                reason: e.to_string(),
            })?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for entry in entries {
            let id = ObjectId::new(entry.object_type, entry.identifier);
            let object = state
                .objects
                .entry(id)
                .or_insert_with(|| BacnetObject::new(id, None));
            object.consume(&entry.properties, &self.options.cov, now);
        }
        info!(controller = %self.options.name, objects = state.objects.len(), "restored objects from snapshot");
        Ok(())
    }
}

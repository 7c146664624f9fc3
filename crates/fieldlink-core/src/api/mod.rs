// ── REST API controller ──
//
// Polls a remote JSON service. Discovery GETs the discovery path and
// creates an instance per keyed item; acquisition GETs the acquisition
// path and feeds each item to its instance. Keyed objects are treated as
// arrays of their values, each tagged with its key as `responseIdKey`.

pub mod download;
pub mod instance;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fieldlink_api::RestClient;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::controller::{ProtocolController, Schedule, Sweep};
use crate::datapoint::{DebounceTable, MetadataTemplate};
use crate::emit::Emitter;
use crate::error::CoreError;
use crate::event::{Meta, NormalizedEvent};

pub use download::{DownloadOptions, Downloader};
pub use instance::{ApiInstance, ValuePointers};

/// Key added to items of a keyed-object response.
pub const RESPONSE_ID_KEY: &str = "responseIdKey";

/// Delay before retrying a malformed acquisition response.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub path: String,
    /// JSON pointer selecting the item set inside the response. `None`
    /// uses the whole response.
    pub collection: Option<String>,
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ApiOptions {
    pub name: String,
    pub discovery: ApiRequest,
    pub acquisition: ApiRequest,
    /// JSON pointer to each item's unique key.
    pub instance_key: String,
    pub pointers: ValuePointers,
    pub retry_interval: Duration,
    pub template: MetadataTemplate,
    /// Archive files linked from changed items and emit only once they
    /// are stored.
    pub downloads: Option<DownloadOptions>,
}

type Instances = Arc<Mutex<IndexMap<String, ApiInstance>>>;

/// A changed instance whose event waits on its files.
struct PendingDownload {
    key: String,
    files: Vec<(String, String)>,
    event: Option<NormalizedEvent>,
}

pub struct ApiController {
    options: ApiOptions,
    client: RestClient,
    emitter: Emitter,
    debounce: Arc<DebounceTable>,
    instances: Instances,
    downloader: Option<Arc<Downloader>>,
    downloads: TaskTracker,
}

impl ApiController {
    pub fn new(
        options: ApiOptions,
        client: RestClient,
        emitter: Emitter,
        debounce: Arc<DebounceTable>,
    ) -> Self {
        let downloader = options
            .downloads
            .clone()
            .map(|d| Arc::new(Downloader::new(client.clone(), d)));
        Self {
            options,
            client,
            emitter,
            debounce,
            instances: Arc::new(Mutex::new(IndexMap::new())),
            downloader,
            downloads: TaskTracker::new(),
        }
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn instance(&self, key: &str) -> Option<ApiInstance> {
        self.instances.lock().await.get(key).cloned()
    }

    async fn fetch_items(&self, request: &ApiRequest) -> Result<Option<Vec<Value>>, CoreError> {
        let response = self.client.get_json(&request.path).await?;
        let set = match request.collection.as_deref() {
            Some(pointer) => response.pointer(pointer).cloned().unwrap_or(Value::Null),
            None => response,
        };
        Ok(into_items(set))
    }

    fn spawn_download(&self, downloader: &Arc<Downloader>, pending: PendingDownload) {
        let downloader = Arc::clone(downloader);
        let instances = Arc::clone(&self.instances);
        let emitter = self.emitter.clone();
        let controller = self.options.name.clone();
        self.downloads.spawn(async move {
            let outcome = downloader.fetch_all(&pending.files).await;
            if let Some(instance) = instances.lock().await.get_mut(&pending.key) {
                instance.end_download();
            }
            match outcome {
                Ok(()) => {
                    for (_, target) in &pending.files {
                        debug!(controller = %controller, instance = %pending.key, target, "stored file");
                    }
                    if let Some(event) = pending.event {
                        emitter.emit(event).await;
                    }
                }
                Err(e) => {
                    warn!(controller = %controller, instance = %pending.key, error = %e, "download failed, reading dropped");
                }
            }
        });
    }

    fn key_of(&self, item: &Value) -> Option<String> {
        match item.pointer(&self.options.instance_key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Normalize a response into a list of items.
fn into_items(set: Value) -> Option<Vec<Value>> {
    match set {
        Value::Array(items) => Some(items),
        Value::Object(map) => Some(
            map.into_iter()
                .map(|(key, value)| {
                    let mut item = match value {
                        Value::Object(fields) => fields,
                        other => {
                            let mut fields = serde_json::Map::new();
                            fields.insert("value".into(), other);
                            fields
                        }
                    };
                    item.insert(RESPONSE_ID_KEY.into(), Value::String(key));
                    Value::Object(item)
                })
                .collect(),
        ),
        _ => None,
    }
}

#[async_trait]
impl ProtocolController for ApiController {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn protocol(&self) -> &'static str {
        "API"
    }

    fn metadata(&self) -> Meta {
        let mut meta = Meta::new();
        meta.insert("protocol".into(), self.protocol().into());
        meta
    }

    fn address(&self) -> Option<&str> {
        None
    }

    fn port(&self) -> u16 {
        self.client.base_url().port_or_known_default().unwrap_or(80)
    }

    fn schedule(&self) -> Schedule {
        Schedule {
            discovery: self.options.discovery.interval,
            acquisition: self.options.acquisition.interval,
            streaming: false,
        }
    }

    async fn connect(&self, _endpoint: Option<SocketAddr>) -> Result<(), CoreError> {
        info!(controller = %self.options.name, url = %self.client.base_url(), "polling REST service");
        Ok(())
    }

    async fn discover_step(&self) -> Result<Sweep, CoreError> {
        let Some(items) = self.fetch_items(&self.options.discovery).await? else {
            warn!(controller = %self.options.name, "discovery response is neither an array nor an object");
            return Ok(Sweep::Complete);
        };

        let now = Utc::now();
        let mut instances = self.instances.lock().await;
        let mut discovered = 0usize;
        for item in items {
            let Some(key) = self.key_of(&item) else {
                debug!(controller = %self.options.name, "skipping item without a key");
                continue;
            };
            let instance = instances.entry(key.clone()).or_insert_with(|| {
                debug!(controller = %self.options.name, instance = %key, "discovered new instance");
                discovered += 1;
                ApiInstance::discovered(key, now)
            });
            instance.consume_static(item);
        }

        if discovered > 0 {
            info!(controller = %self.options.name, discovered, "discovered new devices");
        }
        Ok(Sweep::Complete)
    }

    async fn acquire(&self) -> Result<(), CoreError> {
        let mut items = self.fetch_items(&self.options.acquisition).await?;
        if items.is_none() {
            warn!(
                controller = %self.options.name,
                retry_in = ?self.options.retry_interval,
                "acquisition returned a non-array response"
            );
            tokio::time::sleep(self.options.retry_interval).await;
            items = self.fetch_items(&self.options.acquisition).await?;
        }
        let Some(items) = items else {
            warn!(controller = %self.options.name, "acquisition response still malformed, skipping cycle");
            return Ok(());
        };

        let now = Utc::now();
        let total = items.len();
        let (events, downloads) = {
            let mut instances = self.instances.lock().await;
            let mut events = Vec::new();
            let mut downloads = Vec::new();
            for item in items {
                let Some(key) = self.key_of(&item) else {
                    continue;
                };
                let Some(instance) = instances.get_mut(&key) else {
                    debug!(
                        controller = %self.options.name,
                        instance = %key,
                        "response for unknown instance, discovery should be repeated"
                    );
                    continue;
                };
                if !instance.consume_data(item, &self.options.pointers, &self.debounce, now) {
                    continue;
                }
                debug!(controller = %self.options.name, instance = %key, "instance updated");

                let files = self.downloader.as_ref().and_then(|downloader| {
                    let urls = instance.dynamic_data().map(download::file_urls)?;
                    if urls.is_empty() {
                        return None;
                    }
                    let targets = downloader.options().targets(&key, &urls, now);
                    instance.begin_download(&targets);
                    Some(urls.into_iter().zip(targets).collect::<Vec<_>>())
                });
                let event = instance.to_event(
                    &self.options.name,
                    &self.metadata(),
                    &self.options.template,
                    &self.options.pointers,
                );
                match files {
                    Some(files) => downloads.push(PendingDownload { key, files, event }),
                    None => events.extend(event),
                }
            }
            (events, downloads)
        };

        if let Some(downloader) = &self.downloader {
            for pending in downloads {
                self.spawn_download(downloader, pending);
            }
        }
        for event in events {
            self.emitter.emit(event).await;
        }
        info!(controller = %self.options.name, items = total, "updated from REST service");
        Ok(())
    }

    /// Waits for downloads already started.
    async fn disconnect(&self) -> Result<(), CoreError> {
        self.downloads.close();
        self.downloads.wait().await;
        self.downloads.reopen();
        Ok(())
    }

    async fn snapshot(&self) -> Option<Value> {
        let instances: Vec<ApiInstance> =
            self.instances.lock().await.values().cloned().collect();
        serde_json::to_value(instances).ok()
    }

    async fn restore(&self, snapshot: Value) -> Result<(), CoreError> {
        let restored: Vec<ApiInstance> =
            serde_json::from_value(snapshot).map_err(|e| CoreError::Snapshot {
                controller: self.options.name.clone(),
                reason: e.to_string(),
            })?;
        let mut instances = self.instances.lock().await;
        for instance in restored {
            instances
                .entry(instance.key().to_owned())
                .or_insert(instance);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn keyed_objects_become_tagged_items() {
        let items = into_items(json!({ "A1": { "v": 1 }, "A2": 2 })).unwrap_or_default();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], json!({ "v": 1, "responseIdKey": "A1" }));
        assert_eq!(items[1], json!({ "value": 2, "responseIdKey": "A2" }));
    }

    #[test]
    fn scalars_are_not_item_sets() {
        assert!(into_items(json!("oops")).is_none());
        assert!(into_items(Value::Null).is_none());
    }
}

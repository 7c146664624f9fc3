#![allow(clippy::unwrap_used)]
// ── Acquisition to storage over the in-memory bus ──
//
// A scripted BACnet device feeds a real controller; its events travel
// through a MemoryBus into a Receiver backed by the in-memory stores.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fieldlink_api::{
    ApplicationValue, ObjectId, ObjectType, PropertyError, PropertyId, PropertyResult,
    ReadAccessResult, ReadAccessSpec, ReadPropertyMultiple,
};
use fieldlink_api::bacnet::codec::{MAX_APDU_LEN, encode_read_property_multiple, split_read_access};
use fieldlink_core::bacnet::DEFAULT_PORT;
use fieldlink_core::{
    BacnetController, BacnetOptions, CovPolicy, DiscoveryOptions, Emitter, MemoryBus,
    MemoryGraphStore, MemoryValueStore, MessageSource, MetadataTemplate, NaturalKey,
    NormalizedEvent, ProtocolController, Receiver, ReceiverSettings, RequestQueue, Sweep,
    ValueStore,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;

const EXCHANGE: &str = "uo.raw";
const QUEUE: &str = "uo.master.store";

// ── Scripted device ─────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedDevice {
    objects: Mutex<HashMap<ObjectId, HashMap<PropertyId, ApplicationValue>>>,
    /// APDU length of every request received.
    requests: Mutex<Vec<usize>>,
}

impl ScriptedDevice {
    fn set(&self, object: ObjectId, property: PropertyId, value: ApplicationValue) {
        self.objects
            .lock()
            .unwrap()
            .entry(object)
            .or_default()
            .insert(property, value);
    }

    fn requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn largest_request(&self) -> usize {
        self.requests.lock().unwrap().iter().copied().max().unwrap_or(0)
    }
}

#[async_trait]
impl ReadPropertyMultiple for ScriptedDevice {
    async fn read_property_multiple(
        &self,
        _device: SocketAddr,
        specs: &[ReadAccessSpec],
    ) -> Result<Vec<ReadAccessResult>, fieldlink_api::Error> {
        // BVLC and NPDU headers are not part of the APDU
        let apdu = encode_read_property_multiple(0, specs).len() - 6;
        self.requests.lock().unwrap().push(apdu);
        let objects = self.objects.lock().unwrap();
        Ok(specs
            .iter()
            .filter_map(|spec| {
                let properties = objects.get(&spec.object)?;
                let results = spec
                    .properties
                    .iter()
                    .map(|&property| PropertyResult {
                        property,
                        array_index: None,
                        value: properties
                            .get(&property)
                            .cloned()
                            .map(|v| vec![v])
                            .ok_or(PropertyError { class: 2, code: 32 }),
                    })
                    .collect();
                Some(ReadAccessResult {
                    object: spec.object,
                    results,
                })
            })
            .collect())
    }
}

fn supply_air() -> ObjectId {
    ObjectId::new(ObjectType::AnalogInput, 2)
}

fn device() -> Arc<ScriptedDevice> {
    let device = Arc::new(ScriptedDevice::default());
    let id = supply_air();
    device.set(id, PropertyId::Name, ApplicationValue::CharacterString("AHU1.SAT".into()));
    device.set(
        id,
        PropertyId::Description,
        ApplicationValue::CharacterString("Supply air temperature".into()),
    );
    device.set(id, PropertyId::Units, ApplicationValue::CharacterString("degC".into()));
    device.set(id, PropertyId::OutOfService, ApplicationValue::Boolean(false));
    device.set(id, PropertyId::PresentValue, ApplicationValue::Real(21.5));
    device
}

fn options() -> BacnetOptions {
    BacnetOptions {
        name: "BMS".into(),
        address: Some("127.0.0.1".into()),
        port: DEFAULT_PORT,
        discovery: DiscoveryOptions {
            object_id_start: 0,
            object_id_end: 4,
            object_batch_size: 2,
            interval: Some(Duration::from_secs(3600)),
        },
        update_interval: Some(Duration::from_secs(60)),
        update_batch_size: 10,
        cov: CovPolicy {
            precision: 1,
            minimum_interval: Duration::ZERO,
            overrides: Vec::new(),
        },
        max_attempts: 3,
        template: MetadataTemplate {
            platform: "AHU1".into(),
            ..MetadataTemplate::default()
        },
    }
}

async fn controller(bus: &MemoryBus, device: Arc<ScriptedDevice>) -> BacnetController {
    bus.bind(EXCHANGE, QUEUE);
    let emitter = Emitter::new(Arc::new(bus.clone()), EXCHANGE);
    let controller = BacnetController::new(options(), device, RequestQueue::new("bacnet"), emitter);
    controller
        .connect(Some(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))))
        .await
        .unwrap();
    controller
}

async fn sweep(controller: &BacnetController) {
    for _ in 0..10 {
        if controller.discover_step().await.unwrap() == Sweep::Complete {
            return;
        }
    }
    panic!("discovery never completed");
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_records_objects_without_emitting() {
    let bus = MemoryBus::new();
    let device = device();
    let controller = controller(&bus, Arc::clone(&device)).await;

    sweep(&controller).await;

    assert_eq!(controller.object_count().await, 1);
    let object = controller.object(supply_air()).await.unwrap();
    assert_eq!(object.name(), Some("AHU1.SAT"));
    assert_eq!(bus.stats(QUEUE).published, 0);

    // each two-instance name sweep is split into unsegmented requests,
    // followed by one metadata read
    let step: Vec<ReadAccessSpec> = (0..2)
        .flat_map(|instance| {
            ObjectType::iter()
                .map(move |t| ReadAccessSpec::new(ObjectId::new(t, instance), [PropertyId::Name]))
        })
        .collect();
    let per_step = split_read_access(&step, MAX_APDU_LEN).len();
    assert!(per_step > 1);
    assert_eq!(device.requests(), 2 * per_step + 1);
    assert!(device.largest_request() <= MAX_APDU_LEN);
}

#[tokio::test]
async fn changed_present_value_is_published() {
    let bus = MemoryBus::new();
    let device = device();
    let controller = controller(&bus, Arc::clone(&device)).await;
    sweep(&controller).await;

    controller.acquire().await.unwrap();
    assert_eq!(bus.stats(QUEUE).published, 0);

    device.set(supply_air(), PropertyId::PresentValue, ApplicationValue::Real(22.0));
    controller.acquire().await.unwrap();
    assert_eq!(bus.stats(QUEUE).published, 1);

    // below the configured precision
    device.set(supply_air(), PropertyId::PresentValue, ApplicationValue::Real(22.03));
    controller.acquire().await.unwrap();
    assert_eq!(bus.stats(QUEUE).published, 1);

    let mut source = bus.consume(QUEUE).await.unwrap();
    let delivery = source.next().await.unwrap();
    let event = NormalizedEvent::from_slice(delivery.payload()).unwrap();
    assert_eq!(event.brokerage.broker.id, "BMS");
    assert_eq!(event.brokerage.id, "AHU1.SAT");
    assert_eq!(event.platform.name, "AHU1");
    assert_eq!(event.sensor.observed_property, "Supply air temperature");
    assert_eq!(event.timeseries.unit.as_deref(), Some("degC"));
    assert_eq!(event.timeseries.value.kind, "Real");
    assert_eq!(event.timeseries.value.data, Some(json!(22.0)));
}

#[tokio::test]
async fn snapshot_restores_known_objects() {
    let bus = MemoryBus::new();
    let controller = controller(&bus, device()).await;
    sweep(&controller).await;
    let snapshot = controller.snapshot().await.unwrap();

    let restored = BacnetController::new(
        options(),
        Arc::new(ScriptedDevice::default()),
        RequestQueue::new("bacnet"),
        Emitter::new(Arc::new(bus.clone()), EXCHANGE),
    );
    restored.restore(snapshot).await.unwrap();
    assert_eq!(restored.object_count().await, 1);
    assert_eq!(restored.object(supply_air()).await.unwrap().name(), Some("AHU1.SAT"));
}

#[tokio::test]
async fn published_events_are_reconciled_and_stored() {
    let bus = MemoryBus::new();
    let device = device();
    let controller = controller(&bus, Arc::clone(&device)).await;
    sweep(&controller).await;
    controller.acquire().await.unwrap();
    for value in [22.25, 23.5, 24.75] {
        device.set(supply_air(), PropertyId::PresentValue, ApplicationValue::Real(value));
        controller.acquire().await.unwrap();
    }
    assert_eq!(bus.stats(QUEUE).published, 3);

    let graph = MemoryGraphStore::new();
    let values = Arc::new(MemoryValueStore::new());
    let receiver = Receiver::new(
        Arc::new(graph.clone()),
        Arc::clone(&values) as Arc<dyn ValueStore>,
        ReceiverSettings::default(),
    );
    let cancel = CancellationToken::new();
    let source = bus.consume(QUEUE).await.unwrap();
    let task = tokio::spawn({
        let receiver = receiver.clone();
        let cancel = cancel.clone();
        async move { receiver.run(source, cancel).await }
    });

    wait_for(|| bus.stats(QUEUE).acked == 3).await;
    receiver.settle().await.unwrap();
    cancel.cancel();
    task.await.unwrap().unwrap();

    let counts = graph.counts().await;
    assert_eq!(counts.platforms, 1);
    assert_eq!(counts.sensors, 1);
    assert_eq!(counts.timeseries, 1);
    assert_eq!(values.len().await, 3);
    assert!(receiver.is_fresh(&NaturalKey::new("BMS", "AHU1.SAT")));
}

#[tokio::test]
async fn malformed_messages_are_acked_and_dropped() {
    let bus = MemoryBus::new();
    bus.bind(EXCHANGE, QUEUE);
    fieldlink_core::MessageSink::publish(&bus, EXCHANGE, "", bytes::Bytes::from_static(b"{not json"))
        .await
        .unwrap();

    let values = Arc::new(MemoryValueStore::new());
    let receiver = Receiver::new(
        Arc::new(MemoryGraphStore::new()),
        Arc::clone(&values) as Arc<dyn ValueStore>,
        ReceiverSettings::default(),
    );
    let cancel = CancellationToken::new();
    let source = bus.consume(QUEUE).await.unwrap();
    let task = tokio::spawn({
        let receiver = receiver.clone();
        let cancel = cancel.clone();
        async move { receiver.run(source, cancel).await }
    });

    wait_for(|| bus.stats(QUEUE).acked == 1).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let stats = bus.stats(QUEUE);
    assert_eq!(stats.requeued, 0);
    assert!(values.is_empty().await);
    assert!(receiver.is_closed());
}

#![allow(clippy::unwrap_used)]
// ── REST polling controller against a mock service ──

use std::sync::Arc;
use std::time::Duration;

use fieldlink_api::{RestClient, RestClientConfig};
use fieldlink_core::{
    ApiController, ApiOptions, ApiRequest, CoreError, DebounceTable, Emitter, MemoryBus,
    DownloadOptions, MessageSource, MetadataTemplate, NormalizedEvent, ProtocolController, ValuePointers,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EXCHANGE: &str = "uo.raw";
const QUEUE: &str = "store";

fn options(instance_key: &str) -> ApiOptions {
    ApiOptions {
        name: "WEATHER".into(),
        discovery: ApiRequest {
            path: "/stations".into(),
            collection: None,
            interval: Some(Duration::from_secs(3600)),
        },
        acquisition: ApiRequest {
            path: "/readings".into(),
            collection: None,
            interval: Some(Duration::from_secs(300)),
        },
        instance_key: instance_key.into(),
        pointers: ValuePointers {
            value: Some("/temp".into()),
            time: Some("/time".into()),
        },
        retry_interval: Duration::from_millis(10),
        template: MetadataTemplate {
            platform: "{name}".into(),
            observed_property: "air temperature".into(),
            unit: Some("degC".into()),
            ..MetadataTemplate::default()
        },
        downloads: None,
    }
}

fn controller(server: &MockServer, bus: &MemoryBus, instance_key: &str) -> ApiController {
    with_options(server, bus, options(instance_key))
}

fn with_options(server: &MockServer, bus: &MemoryBus, options: ApiOptions) -> ApiController {
    bus.bind(EXCHANGE, QUEUE);
    let client = RestClient::new(RestClientConfig::new(Url::parse(&server.uri()).unwrap())).unwrap();
    ApiController::new(
        options,
        client,
        Emitter::new(Arc::new(bus.clone()), EXCHANGE),
        Arc::new(DebounceTable::default()),
    )
}

async fn mount_stations(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/stations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "ST1", "name": "North mast" },
            { "id": "ST2", "name": "South mast" },
            { "name": "no key" },
        ])))
        .mount(server)
        .await;
}

fn readings() -> serde_json::Value {
    json!([
        { "id": "ST1", "temp": 12.5, "time": "2024-03-01T10:00:00Z" },
        { "id": "ST2", "temp": [9.0, 8.5], "time": "2024-03-01T10:00:00Z" },
        { "id": "ST9", "temp": 1.0, "time": "2024-03-01T10:00:00Z" },
    ])
}

#[tokio::test]
async fn discovery_creates_keyed_instances() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    let bus = MemoryBus::new();
    let controller = controller(&server, &bus, "/id");

    controller.discover_step().await.unwrap();

    assert_eq!(controller.instance_count().await, 2);
    assert!(controller.instance("ST1").await.is_some());
    assert_eq!(bus.stats(QUEUE).published, 0);
}

#[tokio::test]
async fn acquisition_emits_changed_instances_only() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(readings()))
        .mount(&server)
        .await;
    let bus = MemoryBus::new();
    let controller = controller(&server, &bus, "/id");
    controller.discover_step().await.unwrap();

    controller.acquire().await.unwrap();
    assert_eq!(bus.stats(QUEUE).published, 2);

    controller.acquire().await.unwrap();
    assert_eq!(bus.stats(QUEUE).published, 2);

    let mut source = bus.consume(QUEUE).await.unwrap();
    let first = NormalizedEvent::from_slice(source.next().await.unwrap().payload()).unwrap();
    let second = NormalizedEvent::from_slice(source.next().await.unwrap().payload()).unwrap();

    assert_eq!(first.brokerage.id, "ST1");
    assert_eq!(first.platform.name, "North mast");
    assert_eq!(first.sensor.observed_property, "air temperature");
    assert_eq!(first.timeseries.value.kind, "Real");
    assert_eq!(first.timeseries.value.data, Some(json!(12.5)));
    assert_eq!(first.timeseries.value.time.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    // arrays report their first element
    assert_eq!(second.timeseries.value.data, Some(json!(9.0)));
}

#[tokio::test]
async fn keyed_object_responses_use_response_id_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "A1": { "name": "Roof" },
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "A1": { "temp": 3.5, "time": 1_709_287_200_000_i64 },
        })))
        .mount(&server)
        .await;
    let bus = MemoryBus::new();
    let controller = controller(&server, &bus, "/responseIdKey");

    controller.discover_step().await.unwrap();
    controller.acquire().await.unwrap();

    assert_eq!(controller.instance_count().await, 1);
    assert_eq!(bus.stats(QUEUE).published, 1);
    let mut source = bus.consume(QUEUE).await.unwrap();
    let event = NormalizedEvent::from_slice(source.next().await.unwrap().payload()).unwrap();
    assert_eq!(event.brokerage.id, "A1");
    assert_eq!(event.platform.name, "Roof");
    assert_eq!(event.timeseries.value.time.timestamp_millis(), 1_709_287_200_000);
}

#[tokio::test]
async fn malformed_acquisition_is_retried_once() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("maintenance")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(readings()))
        .mount(&server)
        .await;
    let bus = MemoryBus::new();
    let controller = controller(&server, &bus, "/id");
    controller.discover_step().await.unwrap();

    controller.acquire().await.unwrap();

    assert_eq!(bus.stats(QUEUE).published, 2);
}

#[tokio::test]
async fn server_errors_fail_the_cycle() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let bus = MemoryBus::new();
    let controller = controller(&server, &bus, "/id");
    controller.discover_step().await.unwrap();

    let err = controller.acquire().await.unwrap_err();

    assert!(matches!(
        err,
        CoreError::Api(fieldlink_api::Error::HttpStatus { status: 503, .. })
    ));
    assert_eq!(bus.stats(QUEUE).published, 0);
}

#[tokio::test]
async fn snapshot_round_trips_instances() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    let bus = MemoryBus::new();
    let controller = controller(&server, &bus, "/id");
    controller.discover_step().await.unwrap();

    let restored = self::controller(&server, &bus, "/id");
    restored.restore(controller.snapshot().await.unwrap()).await.unwrap();

    assert_eq!(restored.instance_count().await, 2);
}

// ── File downloads ──────────────────────────────────────────────────

fn camera_options(archive: &std::path::Path) -> ApiOptions {
    ApiOptions {
        pointers: ValuePointers {
            value: None,
            time: None,
        },
        downloads: Some(DownloadOptions {
            filename: "{key}-{index}.{ext}".into(),
            ..DownloadOptions::new(archive)
        }),
        ..options("/id")
    }
}

fn camera_reading(server: &MockServer, image: &str) -> serde_json::Value {
    json!([{ "id": "ST1", "image": format!("{}/cams/{image}", server.uri()) }])
}

#[tokio::test]
async fn changed_items_are_emitted_after_their_files_are_archived() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(camera_reading(&server, "a1.png")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cams/a1.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png!".to_vec()))
        .mount(&server)
        .await;
    let archive = tempfile::tempdir().unwrap();
    let bus = MemoryBus::new();
    let controller = with_options(&server, &bus, camera_options(archive.path()));
    controller.discover_step().await.unwrap();

    controller.acquire().await.unwrap();
    controller.disconnect().await.unwrap();

    assert_eq!(std::fs::read(archive.path().join("ST1-0.png")).unwrap(), b"png!");
    assert_eq!(bus.stats(QUEUE).published, 1);
    let mut source = bus.consume(QUEUE).await.unwrap();
    let event = NormalizedEvent::from_slice(source.next().await.unwrap().payload()).unwrap();
    let data = event.timeseries.value.data.unwrap();
    assert_eq!(data["fileURL"], json!(["ST1-0.png"]));
    assert!(!controller.instance("ST1").await.unwrap().download_pending());
}

#[tokio::test]
async fn failed_downloads_drop_the_reading() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(camera_reading(&server, "gone.jpg")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cams/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let archive = tempfile::tempdir().unwrap();
    let bus = MemoryBus::new();
    let controller = with_options(&server, &bus, camera_options(archive.path()));
    controller.discover_step().await.unwrap();

    controller.acquire().await.unwrap();
    controller.disconnect().await.unwrap();

    assert_eq!(bus.stats(QUEUE).published, 0);
    assert!(!archive.path().join("ST1-0.jpg").exists());
    assert!(!controller.instance("ST1").await.unwrap().download_pending());
}

#[tokio::test]
async fn changes_during_a_download_are_skipped() {
    let server = MockServer::start().await;
    mount_stations(&server).await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(camera_reading(&server, "a1.jpg")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(camera_reading(&server, "a2.jpg")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cams/a1.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"jpg!".to_vec())
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    let archive = tempfile::tempdir().unwrap();
    let bus = MemoryBus::new();
    let controller = with_options(&server, &bus, camera_options(archive.path()));
    controller.discover_step().await.unwrap();

    controller.acquire().await.unwrap();
    controller.acquire().await.unwrap();
    let held = controller.instance("ST1").await.unwrap();
    assert!(held.download_pending());
    assert!(held.dynamic_data().unwrap()["image"].as_str().unwrap().ends_with("a1.jpg"));

    controller.disconnect().await.unwrap();
    assert_eq!(bus.stats(QUEUE).published, 1);
    assert!(archive.path().join("ST1-0.jpg").exists());
}

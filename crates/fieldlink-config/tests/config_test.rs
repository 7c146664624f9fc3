#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::time::Duration;

use fieldlink_config::{Config, ConfigError, load};
use fieldlink_core::{CastAs, PreSendHook};
use pretty_assertions::assert_eq;

const SITE: &str = r#"
[broker]
exchange = "site.raw"

[storage]
insert_buffer_limit = 250
full_update_frequency_secs = 0

[acquisition]
minimum_cov_interval_secs = 10
debounce = [{ pattern = "LUFFT", window_secs = 120 }]

[controllers.bacnet.AHU]
address = "10.0.0.20"
object_id_start = 0
object_id_end = 200
object_batch_size = 25
update_interval_secs = 30
cov_precision = 1
cov_precision_overrides = [{ pattern = "kWh", precision = 0 }]
platform = "{name}"
observed_property = "{description}"

[controllers.api.WEATHER]
url = "https://weather.example.net/v2/"
username = "reader"
password = "hunter2"
discovery_path = "stations"
acquisition_path = "observations"
acquisition_interval_secs = 300
instance_key = "/id"
value = "/temp"
time = "/time"
platform = "{name}"
observed_property = "air temperature"
unit = "degC"
target_type = "real"

[controllers.socket.WX]
address = "10.0.0.30"
port = 4001
delimiter = ","
values = [
  { name = "temperature", cast_as = "float" },
  { name = "wind", cast_as = "integer", length = 2 },
]
platform = "Mast"
observed_property = "{name}"
"#;

fn write(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn file_overrides_defaults() {
    let file = write(SITE);
    let config = load(Some(file.path())).unwrap();

    assert_eq!(config.broker.exchange, "site.raw");
    assert_eq!(config.broker.queue, "uo.master.store");
    assert_eq!(config.storage.insert_buffer_limit, 250);
    assert_eq!(config.storage.transaction_frequency_ms, 2000);
    assert_eq!(config.acquisition.debounce.len(), 1);

    let receiver = config.receiver_settings();
    assert_eq!(receiver.buffer_limit, 250);
    assert_eq!(receiver.full_update_frequency, Duration::ZERO);
}

#[test]
fn bacnet_controllers_translate() {
    let config = Config::from_toml(SITE).unwrap();
    let options = config.bacnet_options();

    assert_eq!(options.len(), 1);
    let ahu = &options[0];
    assert_eq!(ahu.name, "AHU");
    assert_eq!(ahu.address.as_deref(), Some("10.0.0.20"));
    assert_eq!(ahu.port, 47808);
    assert_eq!(ahu.discovery.object_id_end, 200);
    assert_eq!(ahu.discovery.object_batch_size, 25);
    assert_eq!(ahu.discovery.interval, Some(Duration::from_secs(3600)));
    assert_eq!(ahu.update_interval, Some(Duration::from_secs(30)));
    assert_eq!(ahu.cov.precision, 1);
    assert_eq!(ahu.cov.precision_for("Main meter", "", "kWh"), 0);
    assert_eq!(ahu.cov.precision_for("AHU1-SAT", "", "degC"), 1);
    assert_eq!(ahu.cov.minimum_interval, Duration::from_secs(10));
    assert_eq!(ahu.max_attempts, 5);
    assert_eq!(ahu.template.observed_property, "{description}");
}

#[test]
fn api_controllers_carry_credentials_and_pointers() {
    let config = Config::from_toml(SITE).unwrap();
    let endpoints = config.api_endpoints().unwrap();

    assert_eq!(endpoints.len(), 1);
    let weather = &endpoints[0];
    assert_eq!(weather.client.base_url.as_str(), "https://weather.example.net/v2/");
    assert_eq!(weather.client.auth.as_ref().unwrap().username, "reader");
    assert_eq!(weather.options.acquisition.path, "observations");
    assert_eq!(weather.options.acquisition.interval, Some(Duration::from_secs(300)));
    assert_eq!(weather.options.pointers.value.as_deref(), Some("/temp"));
    assert_eq!(weather.options.template.target_type.as_deref(), Some("real"));
    assert_eq!(weather.options.template.unit.as_deref(), Some("degC"));
    assert!(weather.options.downloads.is_none());
}

#[test]
fn api_downloads_take_layout_defaults() {
    let config = Config::from_toml(
        r#"
        [controllers.api.CCTV]
        url = "https://traffic.example.net/"
        instance_key = "/systemCodeNumber"
        platform = "{shortDescription}"
        observed_property = "Camera image"

        [controllers.api.CCTV.downloads]
        archive_dir = "/archive/public/camera-feeds"
        "#,
    )
    .unwrap();
    let endpoints = config.api_endpoints().unwrap();
    let downloads = endpoints[0].options.downloads.as_ref().unwrap();

    assert_eq!(downloads.archive_dir, std::path::PathBuf::from("/archive/public/camera-feeds"));
    assert_eq!(downloads.filename, "{key}/{date}/{time}.{ext}");
    assert_eq!(downloads.timeout, Duration::from_millis(1500));
}

#[test]
fn zero_download_timeout_is_rejected() {
    let field = rejected(
        r#"
        [controllers.api.CCTV]
        url = "https://traffic.example.net/"
        instance_key = "/id"
        platform = "cam"
        observed_property = "Camera image"

        [controllers.api.CCTV.downloads]
        archive_dir = "/archive"
        timeout_ms = 0
        "#,
    );
    assert_eq!(field, "controllers.api.CCTV.downloads.timeout_ms");
}

#[test]
fn socket_values_are_cast() {
    let config = Config::from_toml(SITE).unwrap();
    let sockets = config.socket_options().unwrap();

    let wx = &sockets[0];
    assert_eq!(wx.delimiter, ",");
    assert_eq!(wx.values[0].cast_as, CastAs::Float);
    assert_eq!(wx.values[1].cast_as, CastAs::Integer);
    assert_eq!(wx.values[1].width(), 2);
}

#[test]
fn redacted_output_hides_passwords() {
    let config = Config::from_toml(SITE).unwrap();
    let shown = config.to_redacted_toml().unwrap();

    assert!(!shown.contains("hunter2"));
    assert!(shown.contains("********"));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

fn rejected(text: &str) -> String {
    match Config::from_toml(text).unwrap_err() {
        ConfigError::Validation { field, .. } => field,
        other => panic!("expected a validation error, got {other}"),
    }
}

#[test]
fn empty_discovery_range_is_rejected() {
    let field = rejected(
        r#"
        [controllers.bacnet.AHU]
        address = "10.0.0.20"
        object_id_start = 50
        object_id_end = 50
        "#,
    );
    assert_eq!(field, "controllers.bacnet.AHU.object_id_end");
}

#[test]
fn zero_batch_size_is_rejected() {
    let field = rejected(
        r#"
        [controllers.bacnet.AHU]
        object_batch_size = 0
        "#,
    );
    assert_eq!(field, "controllers.bacnet.AHU.object_batch_size");
}

#[test]
fn unknown_cast_is_rejected() {
    let field = rejected(
        r#"
        [controllers.socket.WX]
        address = "10.0.0.30"
        port = 4001
        values = [{ name = "t", cast_as = "decimal" }]
        "#,
    );
    assert_eq!(field, "controllers.socket.WX.values.cast_as");
}

#[test]
fn unknown_target_type_is_rejected() {
    let field = rejected(
        r#"
        [controllers.socket.WX]
        address = "10.0.0.30"
        port = 4001
        values = [{ name = "t", cast_as = "float" }]
        target_type = "unknown"
        "#,
    );
    assert_eq!(field, "controllers.socket.WX.target_type");
}

#[test]
fn names_must_be_unique_across_protocols() {
    let field = rejected(
        r#"
        [controllers.bacnet.SITE]
        address = "10.0.0.20"

        [controllers.socket.SITE]
        address = "10.0.0.30"
        port = 4001
        values = [{ name = "t", cast_as = "float" }]
        "#,
    );
    assert_eq!(field, "controllers.SITE");
}

#[test]
fn view_classifier_becomes_a_pre_send_hook() {
    let config = Config::from_toml(
        r#"
        [hooks.view_classifier]
        program = "/opt/cam2views/classify_view.py"
        archive_dir = "/archive"
        disabled = ["TT2", "METCCTV"]
        "#,
    )
    .unwrap();
    let classifier = config.hooks.view_classifier.as_ref().unwrap();
    assert_eq!(classifier.args, vec!["{image}"]);
    assert_eq!(classifier.timeout_secs, 30);

    let hooks = config.pre_send_hooks();
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].name(), "view-classifier");
    assert!(Config::default().pre_send_hooks().is_empty());
}

#[test]
fn classifier_for_unknown_controller_is_rejected() {
    let field = rejected(
        r#"
        [hooks.view_classifier]
        controllers = ["CCTV"]
        program = "classify"
        archive_dir = "/archive"
        "#,
    );
    assert_eq!(field, "hooks.view_classifier.controllers");
}

//! Configuration for fieldlink.
//!
//! Layered loading (built-in defaults, then a TOML file, then
//! `FIELDLINK_`-prefixed environment variables), validation, and
//! translation into the option types `fieldlink-core` consumes.
//!
//! Nested keys are addressed in the environment with `__`, e.g.
//! `FIELDLINK_STORAGE__INSERT_BUFFER_LIMIT=200`.

mod convert;

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use fieldlink_core::{MetadataTemplate, PrecisionRule};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use convert::ApiEndpoint;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "FIELDLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── Top level ───────────────────────────────────────────────────────

/// Full configuration as loaded from TOML and the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerSection,
    pub acquisition: AcquisitionSection,
    pub storage: StorageSection,
    pub bacnet: BacnetSection,
    pub controllers: ControllersSection,
    pub hooks: HooksSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Exchange raw events are published to.
    pub exchange: String,
    /// Queue the receiver consumes.
    pub queue: String,
    pub routing_key: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            exchange: "uo.raw".into(),
            queue: "uo.master.store".into(),
            routing_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSection {
    pub minimum_cov_interval_secs: u64,
    pub file_cache_frequency_secs: u64,
    pub cache_dir: PathBuf,
    pub reconnect_delay_secs: u64,
    pub debounce: Vec<DebounceEntry>,
}

impl Default for AcquisitionSection {
    fn default() -> Self {
        Self {
            minimum_cov_interval_secs: 30,
            file_cache_frequency_secs: 60,
            cache_dir: PathBuf::from("cache"),
            reconnect_delay_secs: 30,
            debounce: vec![
                DebounceEntry {
                    pattern: "VAISALA".into(),
                    window_secs: 550,
                },
                DebounceEntry {
                    pattern: "METCCTV".into(),
                    window_secs: 550,
                },
            ],
        }
    }
}

/// Sources whose identity contains `pattern` ignore samples reported
/// less than `window_secs` apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceEntry {
    pub pattern: String,
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub transaction_frequency_ms: u64,
    /// Zero disables staleness-driven reconciliation.
    pub full_update_frequency_secs: u64,
    pub insert_buffer_limit: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            transaction_frequency_ms: 2000,
            full_update_frequency_secs: 1800,
            insert_buffer_limit: 100,
        }
    }
}

/// The BACnet socket shared by every BACnet controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacnetSection {
    pub bind: String,
    pub apdu_timeout_ms: u64,
    /// Attempts per request before giving up on a timing-out device.
    pub max_attempts: u32,
}

impl Default for BacnetSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:47808".into(),
            apdu_timeout_ms: 1000,
            max_attempts: 5,
        }
    }
}

// ── Pre-send hooks ──────────────────────────────────────────────────

/// Transforms applied to every event before it is published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_classifier: Option<ViewClassifierConfig>,
}

/// Splits archived camera images into one series per view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewClassifierConfig {
    /// Controller names to classify. Empty means all.
    #[serde(default)]
    pub controllers: Vec<String>,
    pub program: PathBuf,
    #[serde(default = "default_classifier_args")]
    pub args: Vec<String>,
    pub archive_dir: PathBuf,
    /// Source id prefixes left unclassified.
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default = "default_classifier_timeout")]
    pub timeout_secs: u64,
}

// ── Controllers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllersSection {
    pub bacnet: IndexMap<String, BacnetControllerConfig>,
    pub api: IndexMap<String, ApiControllerConfig>,
    pub socket: IndexMap<String, SocketControllerConfig>,
}

impl ControllersSection {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bacnet
            .keys()
            .chain(self.api.keys())
            .chain(self.socket.keys())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.bacnet.is_empty() && self.api.is_empty() && self.socket.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetControllerConfig {
    /// Device address. Without one the controller serves its snapshot.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_bacnet_port")]
    pub port: u16,
    #[serde(default)]
    pub object_id_start: u32,
    /// Exclusive end of the discovery sweep.
    #[serde(default = "default_object_id_end")]
    pub object_id_end: u32,
    #[serde(default = "default_object_batch_size")]
    pub object_batch_size: u32,
    #[serde(default = "default_true")]
    pub auto_discovery: bool,
    #[serde(default = "default_discovery_interval")]
    pub auto_discovery_interval_secs: u64,
    /// Zero disables acquisition.
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_update_batch_size")]
    pub update_batch_size: usize,
    /// Decimal places compared for change of value.
    #[serde(default)]
    pub cov_precision: Option<u32>,
    /// Per-object precision, matched on name, description or units.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cov_precision_overrides: Vec<PrecisionRule>,
    #[serde(flatten)]
    pub template: MetadataTemplate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiControllerConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Prefer `FIELDLINK_CONTROLLERS__API__<NAME>__PASSWORD` over plaintext.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub discovery_path: String,
    /// JSON pointer to the item set inside the discovery response.
    #[serde(default)]
    pub discovery_collection: Option<String>,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default)]
    pub acquisition_path: String,
    #[serde(default)]
    pub acquisition_collection: Option<String>,
    #[serde(default = "default_update_interval")]
    pub acquisition_interval_secs: u64,
    /// JSON pointer to each item's unique key.
    pub instance_key: String,
    /// JSON pointer to the reading. Absent sends the whole item.
    #[serde(default)]
    pub value: Option<String>,
    /// JSON pointer to the sample time.
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Archive files linked from each changed item before emitting it.
    #[serde(default)]
    pub downloads: Option<ApiDownloadConfig>,
    #[serde(flatten)]
    pub template: MetadataTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDownloadConfig {
    pub archive_dir: PathBuf,
    /// `{key}`, `{date}`, `{time}`, `{ext}` and `{index}` are substituted.
    #[serde(default = "default_download_filename")]
    pub filename: String,
    #[serde(default = "default_download_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketControllerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub strip_characters: bool,
    pub values: Vec<SocketValueConfig>,
    #[serde(flatten)]
    pub template: MetadataTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketValueConfig {
    pub name: String,
    /// `string`, `float`, `integer` or `boolean`.
    pub cast_as: String,
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub matrix: Option<Vec<usize>>,
}

fn default_bacnet_port() -> u16 {
    fieldlink_core::bacnet::DEFAULT_PORT
}
fn default_object_id_end() -> u32 {
    1000
}
fn default_object_batch_size() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_discovery_interval() -> u64 {
    3600
}
fn default_update_interval() -> u64 {
    60
}
fn default_update_batch_size() -> usize {
    20
}
fn default_api_timeout() -> u64 {
    60
}
fn default_retry_interval() -> u64 {
    5
}
fn default_download_filename() -> String {
    fieldlink_core::api::download::DEFAULT_FILENAME.into()
}

fn default_download_timeout() -> u64 {
    1500
}

fn default_classifier_args() -> Vec<String> {
    vec!["{image}".into()]
}

fn default_classifier_timeout() -> u64 {
    fieldlink_core::classify::DEFAULT_CLASSIFY_TIMEOUT.as_secs()
}

fn default_delimiter() -> String {
    ";".into()
}

// ── Config file path ────────────────────────────────────────────────

/// Platform config file location, e.g. `~/.config/fieldlink/config.toml`.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "fieldlink", "fieldlink").map_or_else(
        || PathBuf::from("fieldlink.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

/// The provider stack for `path`, or the platform path when `None`.
pub fn figment(path: Option<&Path>) -> Figment {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate. An explicitly named file must exist; the platform
/// default may be absent.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        if !path.is_file() {
            return Err(ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file {} not found", path.display()),
            )));
        }
    }
    let config: Config = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Parse a TOML document on top of the defaults, without the
    /// environment layer.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(text))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML with secrets masked.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        for api in shown.controllers.api.values_mut() {
            if api.password.is_some() {
                api.password = Some("********".into());
            }
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

// ── Validation and translation ──
//
// Turns loaded settings into the option types of fieldlink-core. Every
// check here runs once at load time, so translation itself only fails
// on values validation already rejects.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fieldlink_api::{BacnetClientConfig, BasicAuth, RestClientConfig};
use fieldlink_core::{
    ApiOptions, ApiRequest, BacnetOptions, CastAs, ContextSettings, CovPolicy, DebounceRule,
    DiscoveryOptions, DownloadOptions, MetadataTemplate, PreSendHook, ReceiverSettings,
    RuntimeSettings, SocketOptions, StorageClass, ValueDescription, ValuePointers, ViewClassifier,
    ViewClassifierOptions,
};
use secrecy::SecretString;
use url::Url;

use crate::{
    ApiControllerConfig, BacnetControllerConfig, Config, ConfigError, SocketControllerConfig,
};

/// Largest exclusive end of a BACnet instance range (22-bit ids).
const INSTANCE_LIMIT: u32 = 1 << 22;

/// A REST controller's options plus the client it polls through.
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    pub options: ApiOptions,
    pub client: RestClientConfig,
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn interval(value: u64) -> Option<Duration> {
    (value > 0).then(|| secs(value))
}

// ── Validation ──────────────────────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.exchange.is_empty() {
            return Err(ConfigError::invalid("broker.exchange", "must not be empty"));
        }
        if self.storage.insert_buffer_limit == 0 {
            return Err(ConfigError::invalid("storage.insert_buffer_limit", "must be at least 1"));
        }
        if self.storage.transaction_frequency_ms == 0 {
            return Err(ConfigError::invalid(
                "storage.transaction_frequency_ms",
                "must be at least 1",
            ));
        }
        if self.bacnet.max_attempts == 0 {
            return Err(ConfigError::invalid("bacnet.max_attempts", "must be at least 1"));
        }
        self.bind_address()?;

        for entry in &self.acquisition.debounce {
            if entry.pattern.is_empty() {
                return Err(ConfigError::invalid("acquisition.debounce", "pattern must not be empty"));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for name in self.controllers.names() {
            if !seen.insert(name) {
                return Err(ConfigError::invalid(
                    format!("controllers.{name}"),
                    "controller names must be unique across protocols",
                ));
            }
        }
        for (name, c) in &self.controllers.bacnet {
            validate_bacnet(name, c)?;
        }
        for (name, c) in &self.controllers.api {
            validate_api(name, c)?;
        }
        for (name, c) in &self.controllers.socket {
            validate_socket(name, c)?;
        }
        if let Some(classifier) = &self.hooks.view_classifier {
            if classifier.program.as_os_str().is_empty() {
                return Err(ConfigError::invalid("hooks.view_classifier.program", "must not be empty"));
            }
            if classifier.timeout_secs == 0 {
                return Err(ConfigError::invalid("hooks.view_classifier.timeout_secs", "must be at least 1"));
            }
            if let Some(unknown) = classifier.controllers.iter().find(|n| !seen.contains(n.as_str())) {
                return Err(ConfigError::invalid(
                    "hooks.view_classifier.controllers",
                    format!("'{unknown}' is not a configured controller"),
                ));
            }
        }
        Ok(())
    }

    fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        self.bacnet
            .bind
            .parse()
            .map_err(|e| ConfigError::invalid("bacnet.bind", format!("{e}")))
    }
}

fn validate_bacnet(name: &str, c: &BacnetControllerConfig) -> Result<(), ConfigError> {
    let field = |key: &str| format!("controllers.bacnet.{name}.{key}");
    if c.object_id_end <= c.object_id_start {
        return Err(ConfigError::invalid(field("object_id_end"), "instance range is empty"));
    }
    if c.object_id_end > INSTANCE_LIMIT {
        return Err(ConfigError::invalid(
            field("object_id_end"),
            format!("must not exceed {INSTANCE_LIMIT}"),
        ));
    }
    if c.object_batch_size == 0 {
        return Err(ConfigError::invalid(field("object_batch_size"), "must be at least 1"));
    }
    if c.update_batch_size == 0 {
        return Err(ConfigError::invalid(field("update_batch_size"), "must be at least 1"));
    }
    if c.cov_precision_overrides.iter().any(|rule| rule.pattern.is_empty()) {
        return Err(ConfigError::invalid(field("cov_precision_overrides"), "pattern must not be empty"));
    }
    validate_template(&field("target_type"), &c.template)
}

fn validate_api(name: &str, c: &ApiControllerConfig) -> Result<(), ConfigError> {
    let field = |key: &str| format!("controllers.api.{name}.{key}");
    Url::parse(&c.url).map_err(|e| ConfigError::invalid(field("url"), e.to_string()))?;
    if c.password.is_some() && c.username.is_none() {
        return Err(ConfigError::invalid(field("username"), "required when a password is set"));
    }
    let pointers = [
        ("instance_key", Some(c.instance_key.as_str())),
        ("value", c.value.as_deref()),
        ("time", c.time.as_deref()),
        ("discovery_collection", c.discovery_collection.as_deref()),
        ("acquisition_collection", c.acquisition_collection.as_deref()),
    ];
    for (key, pointer) in pointers {
        if let Some(pointer) = pointer {
            if !pointer.starts_with('/') {
                return Err(ConfigError::invalid(field(key), "must be a JSON pointer starting with '/'"));
            }
        }
    }
    if let Some(downloads) = &c.downloads {
        if downloads.filename.is_empty() {
            return Err(ConfigError::invalid(field("downloads.filename"), "must not be empty"));
        }
        if downloads.timeout_ms == 0 {
            return Err(ConfigError::invalid(field("downloads.timeout_ms"), "must be greater than zero"));
        }
    }
    validate_template(&field("target_type"), &c.template)
}

fn validate_socket(name: &str, c: &SocketControllerConfig) -> Result<(), ConfigError> {
    let field = |key: &str| format!("controllers.socket.{name}.{key}");
    if c.address.is_empty() {
        return Err(ConfigError::invalid(field("address"), "must not be empty"));
    }
    if c.values.is_empty() {
        return Err(ConfigError::invalid(field("values"), "at least one value is required"));
    }
    for value in &c.values {
        CastAs::from_str(&value.cast_as).map_err(|_| {
            ConfigError::invalid(
                field("values.cast_as"),
                format!("unknown cast '{}' for '{}'", value.cast_as, value.name),
            )
        })?;
        if value.length == Some(0) || value.matrix.as_ref().is_some_and(|m| m.contains(&0)) {
            return Err(ConfigError::invalid(
                field("values.length"),
                format!("'{}' must span at least one field", value.name),
            ));
        }
    }
    validate_template(&field("target_type"), &c.template)
}

/// A literal target type must name a storage class; templated ones are
/// checked per event by the receiver.
fn validate_template(field: &str, template: &MetadataTemplate) -> Result<(), ConfigError> {
    match template.target_type.as_deref() {
        Some(t) if !t.contains('{') && StorageClass::parse(t).is_none() => Err(
            ConfigError::invalid(field, format!("unknown storage class '{t}'")),
        ),
        _ => Ok(()),
    }
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    pub fn context_settings(&self) -> Result<ContextSettings, ConfigError> {
        Ok(ContextSettings {
            exchange: self.broker.exchange.clone(),
            routing_key: self.broker.routing_key.clone(),
            bacnet: BacnetClientConfig {
                bind: self.bind_address()?,
                apdu_timeout: Duration::from_millis(self.bacnet.apdu_timeout_ms),
            },
            runtime: self.runtime_settings(),
            debounce: self.debounce_rules(),
        })
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            cache_dir: self.acquisition.cache_dir.clone(),
            snapshot_interval: secs(self.acquisition.file_cache_frequency_secs),
            reconnect_delay: secs(self.acquisition.reconnect_delay_secs),
        }
    }

    pub fn receiver_settings(&self) -> ReceiverSettings {
        ReceiverSettings {
            full_update_frequency: secs(self.storage.full_update_frequency_secs),
            transaction_frequency: Duration::from_millis(self.storage.transaction_frequency_ms),
            buffer_limit: self.storage.insert_buffer_limit,
        }
    }

    /// Hooks every emitted event passes through, in order.
    pub fn pre_send_hooks(&self) -> Vec<Arc<dyn PreSendHook>> {
        let mut hooks: Vec<Arc<dyn PreSendHook>> = Vec::new();
        if let Some(c) = &self.hooks.view_classifier {
            hooks.push(Arc::new(ViewClassifier::new(ViewClassifierOptions {
                controllers: c.controllers.clone(),
                program: c.program.clone(),
                args: c.args.clone(),
                archive_dir: c.archive_dir.clone(),
                disabled: c.disabled.clone(),
                timeout: secs(c.timeout_secs),
            })));
        }
        hooks
    }

    pub fn debounce_rules(&self) -> Vec<DebounceRule> {
        self.acquisition
            .debounce
            .iter()
            .map(|d| DebounceRule::new(d.pattern.clone(), secs(d.window_secs)))
            .collect()
    }

    pub fn bacnet_options(&self) -> Vec<BacnetOptions> {
        self.controllers
            .bacnet
            .iter()
            .map(|(name, c)| BacnetOptions {
                name: name.clone(),
                address: c.address.clone().filter(|a| !a.is_empty()),
                port: c.port,
                discovery: DiscoveryOptions {
                    object_id_start: c.object_id_start,
                    object_id_end: c.object_id_end,
                    object_batch_size: c.object_batch_size,
                    interval: if c.auto_discovery {
                        interval(c.auto_discovery_interval_secs)
                    } else {
                        None
                    },
                },
                update_interval: interval(c.update_interval_secs),
                update_batch_size: c.update_batch_size,
                cov: CovPolicy {
                    precision: c.cov_precision.unwrap_or(fieldlink_core::datapoint::DEFAULT_COV_PRECISION),
                    minimum_interval: secs(self.acquisition.minimum_cov_interval_secs),
                    overrides: c.cov_precision_overrides.clone(),
                },
                max_attempts: self.bacnet.max_attempts,
                template: c.template.clone(),
            })
            .collect()
    }

    pub fn api_endpoints(&self) -> Result<Vec<ApiEndpoint>, ConfigError> {
        self.controllers
            .api
            .iter()
            .map(|(name, c)| {
                let base_url = Url::parse(&c.url).map_err(|e| {
                    ConfigError::invalid(format!("controllers.api.{name}.url"), e.to_string())
                })?;
                let auth = c.username.clone().map(|username| BasicAuth {
                    username,
                    password: SecretString::from(c.password.clone().unwrap_or_default()),
                });
                let client = RestClientConfig {
                    auth,
                    timeout: secs(c.timeout_secs),
                    ..RestClientConfig::new(base_url)
                };
                let options = ApiOptions {
                    name: name.clone(),
                    discovery: ApiRequest {
                        path: c.discovery_path.clone(),
                        collection: c.discovery_collection.clone(),
                        interval: interval(c.discovery_interval_secs),
                    },
                    acquisition: ApiRequest {
                        path: c.acquisition_path.clone(),
                        collection: c.acquisition_collection.clone(),
                        interval: interval(c.acquisition_interval_secs),
                    },
                    instance_key: c.instance_key.clone(),
                    pointers: ValuePointers {
                        value: c.value.clone(),
                        time: c.time.clone(),
                    },
                    retry_interval: secs(c.retry_interval_secs),
                    template: c.template.clone(),
                    downloads: c.downloads.as_ref().map(|d| DownloadOptions {
                        archive_dir: d.archive_dir.clone(),
                        filename: d.filename.clone(),
                        timeout: Duration::from_millis(d.timeout_ms),
                    }),
                };
                Ok(ApiEndpoint { options, client })
            })
            .collect()
    }

    pub fn socket_options(&self) -> Result<Vec<SocketOptions>, ConfigError> {
        self.controllers
            .socket
            .iter()
            .map(|(name, c)| {
                let values = c
                    .values
                    .iter()
                    .map(|v| {
                        let cast_as = CastAs::from_str(&v.cast_as).map_err(|_| {
                            ConfigError::invalid(
                                format!("controllers.socket.{name}.values.cast_as"),
                                format!("unknown cast '{}'", v.cast_as),
                            )
                        })?;
                        Ok(ValueDescription {
                            name: v.name.clone(),
                            cast_as,
                            length: v.length,
                            matrix: v.matrix.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                Ok(SocketOptions {
                    name: name.clone(),
                    address: c.address.clone(),
                    port: c.port,
                    delimiter: c.delimiter.clone(),
                    strip_characters: c.strip_characters,
                    values,
                    template: c.template.clone(),
                })
            })
            .collect()
    }
}

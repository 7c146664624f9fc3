// ── API instance ──
//
// One keyed item of a polled REST service. Static data comes from
// discovery, dynamic data from acquisition; a change is any difference
// in the dynamic JSON, subject to the device-class debounce table.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::datapoint::{CovTracker, DebounceTable, MetadataTemplate, SourceDescriptor};
use crate::event::{
    BrokerRef, BrokerageRef, Meta, NormalizedEvent, PlatformRef, SensorRef, TimeseriesRef,
    ValueRef,
};

/// Key listing the archive targets of a downloaded reading.
pub const FILE_URL_KEY: &str = "fileURL";

/// Where in an item the reading and its sample time live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValuePointers {
    /// JSON pointer to the value. `None` sends the whole item.
    pub value: Option<String>,
    /// JSON pointer to the sample time. `None` uses the poll time.
    pub time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiInstance {
    key: String,
    static_data: Value,
    dynamic_data: Option<Value>,
    cov: CovTracker,
    #[serde(skip)]
    download_pending: bool,
}

impl ApiInstance {
    pub fn discovered(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            static_data: Value::Null,
            dynamic_data: None,
            cov: CovTracker::discovered(now),
            download_pending: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dynamic_data(&self) -> Option<&Value> {
        self.dynamic_data.as_ref()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.cov.last_updated
    }

    pub fn download_pending(&self) -> bool {
        self.download_pending
    }

    /// Record where the latest reading's files are archived and hold back
    /// further changes until [`end_download`](Self::end_download).
    pub fn begin_download(&mut self, targets: &[String]) {
        if let Some(Value::Object(data)) = self.dynamic_data.as_mut() {
            let targets = targets.iter().cloned().map(Value::String).collect();
            data.insert(FILE_URL_KEY.into(), Value::Array(targets));
        }
        self.download_pending = true;
    }

    pub fn end_download(&mut self) {
        self.download_pending = false;
    }

    pub fn consume_static(&mut self, item: Value) {
        self.static_data = item;
    }

    /// Take a polled item. Returns `true` when it counts as a change.
    pub fn consume_data(
        &mut self,
        item: Value,
        pointers: &ValuePointers,
        debounce: &DebounceTable,
        now: DateTime<Utc>,
    ) -> bool {
        let mut changed = !self.same_reading(&item);
        if changed {
            if let Some(reported) = pointers.time.as_deref().and_then(|p| sample_time(&item, p)) {
                changed = debounce.is_change(&self.key, reported);
            }
        }
        if changed && self.download_pending {
            debug!(instance = %self.key, "missed data because a download is still pending");
            return false;
        }

        self.cov.previous_seen = self.cov.last_seen;
        self.cov.last_seen = Some(now);
        if changed {
            self.cov.last_updated = Some(now);
            self.dynamic_data = Some(item);
        }
        changed
    }

    /// Compare ignoring the archive targets added by `begin_download`.
    fn same_reading(&self, item: &Value) -> bool {
        match (self.dynamic_data.as_ref(), item) {
            (Some(Value::Object(held)), Value::Object(fresh))
                if held.contains_key(FILE_URL_KEY) && !fresh.contains_key(FILE_URL_KEY) =>
            {
                held.len() == fresh.len() + 1
                    && fresh.iter().all(|(k, v)| held.get(k) == Some(v))
            }
            (held, fresh) => held == Some(fresh),
        }
    }

    /// Static data overlaid with the latest reading.
    pub fn descriptor(&self) -> SourceDescriptor {
        let data = match (&self.static_data, &self.dynamic_data) {
            (Value::Object(base), Some(Value::Object(latest))) => {
                let mut merged = base.clone();
                merged.extend(latest.clone());
                Value::Object(merged)
            }
            (_, Some(latest)) => latest.clone(),
            (base, None) => base.clone(),
        };
        SourceDescriptor::Api {
            key: self.key.clone(),
            data,
        }
    }

    pub fn to_event(
        &self,
        broker: &str,
        broker_meta: &Meta,
        template: &MetadataTemplate,
        pointers: &ValuePointers,
    ) -> Option<NormalizedEvent> {
        let dynamic = self.dynamic_data.as_ref()?;
        let entry = template.render(&self.descriptor())?;

        let data = match pointers.value.as_deref() {
            Some(pointer) => dynamic.pointer(pointer)?.clone(),
            None => dynamic.clone(),
        };
        let data = match data {
            Value::Array(mut values) if !values.is_empty() => values.swap_remove(0),
            other => other,
        };
        let time = pointers
            .time
            .as_deref()
            .and_then(|p| sample_time(dynamic, p))
            .or(self.cov.last_updated)?;

        let mut meta = broker_meta.clone();
        meta.extend(entry.broker_meta);

        Some(NormalizedEvent {
            brokerage: BrokerageRef {
                broker: BrokerRef {
                    id: broker.to_owned(),
                    meta,
                },
                id: self.key.clone(),
                meta: entry.brokerage_meta,
            },
            platform: PlatformRef {
                name: entry.platform_name,
                meta: entry.platform_meta,
            },
            sensor: SensorRef {
                observed_property: entry.observed_property,
                meta: entry.sensor_meta,
            },
            timeseries: TimeseriesRef {
                unit: entry.unit,
                value: ValueRef {
                    time,
                    time_accuracy: Some(self.cov.time_accuracy()),
                    data: Some(data),
                    kind: entry.target_type,
                },
            },
        })
    }
}

/// RFC 3339 text or epoch milliseconds at `pointer`.
fn sample_time(item: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    match item.pointer(pointer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

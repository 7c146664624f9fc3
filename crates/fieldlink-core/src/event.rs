// ── Normalized event ──
//
// The wire contract between acquisition and reconciliation. Field names
// are camelCase on the wire so independently deployed producers and
// consumers stay compatible.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::CoreError;

pub type Meta = serde_json::Map<String, serde_json::Value>;

// ── StorageClass ────────────────────────────────────────────────────

/// Storage-class tag carried in `timeseries.value.type`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum StorageClass {
    Boolean,
    Integer,
    Event,
    Real,
    String,
    Timestamp,
    File,
    #[strum(serialize = "JSON")]
    #[serde(rename = "JSON")]
    Json,
}

impl StorageClass {
    /// Parse a wire tag. `"unknown"` and unrecognised tags are rejected.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::from_str(tag.trim()).ok()
    }
}

// ── Event structure ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerageRef {
    #[serde(default)]
    pub broker: BrokerRef,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRef {
    #[serde(default)]
    pub observed_property: String,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRef {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_accuracy: Option<f64>,
    /// `None` when the producer omitted the reading entirely.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub value: ValueRef,
}

/// A single reading with the identity needed to reconcile it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    #[serde(default)]
    pub brokerage: BrokerageRef,
    #[serde(default)]
    pub platform: PlatformRef,
    #[serde(default)]
    pub sensor: SensorRef,
    pub timeseries: TimeseriesRef,
}

/// Distinguishes an explicit JSON `null` (kept as `Some(Null)`) from an
/// absent field (`None` via `default`).
fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl NormalizedEvent {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            broker_id: self.brokerage.broker.id.clone(),
            source_id: self.brokerage.id.clone(),
        }
    }

    /// Check the fields reconciliation depends on.
    ///
    /// Returns the parsed storage class on success.
    pub fn validate(&self) -> Result<StorageClass, CoreError> {
        if self.brokerage.broker.id.is_empty() {
            return Err(CoreError::InvalidEvent {
                reason: "received data without broker ID".into(),
            });
        }
        if self.brokerage.id.is_empty() {
            return Err(CoreError::InvalidEvent {
                reason: format!(
                    "received data from {} without brokerage ID",
                    self.brokerage.broker.id
                ),
            });
        }
        StorageClass::parse(&self.timeseries.value.kind).ok_or_else(|| CoreError::InvalidEvent {
            reason: format!(
                "received data for {} with invalid type '{}'",
                self.platform.name, self.timeseries.value.kind
            ),
        })
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(bytes::Bytes::from)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

// ── NaturalKey ──────────────────────────────────────────────────────

/// `(brokerId, sourceId)`: globally unique identity of a raw source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub broker_id: String,
    pub source_id: String,
}

impl NaturalKey {
    pub fn new(broker_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            broker_id: broker_id.into(),
            source_id: source_id.into(),
        }
    }

    /// Key in the pending-reconciliation map.
    pub fn pending_id(&self) -> String {
        format!("{}:{}", self.broker_id, self.source_id)
    }

    /// Key in the staleness cache.
    pub fn staleness_key(&self) -> String {
        format!("receiver:{} on {}", self.source_id, self.broker_id)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.broker_id, self.source_id)
    }
}

// ── Socket variable ──
//
// Last value of one named field in a delimited stream. The first value
// and every later change are emitted.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::frame::ValueDescription;
use crate::datapoint::{CovTracker, MetadataTemplate, SourceDescriptor};
use crate::event::{
    BrokerRef, BrokerageRef, Meta, NormalizedEvent, PlatformRef, SensorRef, TimeseriesRef,
    ValueRef,
};

#[derive(Debug, Clone)]
pub struct SocketVariable {
    description: ValueDescription,
    last_value: Option<Value>,
    cov: CovTracker,
}

impl SocketVariable {
    pub fn new(description: ValueDescription) -> Self {
        Self {
            description,
            last_value: None,
            cov: CovTracker::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    /// Returns `true` when `value` should be emitted.
    pub fn consume(&mut self, value: Value, now: DateTime<Utc>) -> bool {
        self.cov.previous_seen = self.cov.last_seen;
        self.cov.last_seen = Some(now);

        match &self.last_value {
            None => debug!(variable = %self.description.name, value = %value, "initial socket value"),
            Some(previous) if *previous == value => return false,
            Some(previous) => debug!(
                variable = %self.description.name,
                from = %previous,
                to = %value,
                "socket value updated"
            ),
        }
        self.last_value = Some(value);
        self.cov.last_updated = Some(now);
        true
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::Socket {
            name: self.description.name.clone(),
            cast_as: self.description.cast_as.to_string(),
        }
    }

    pub fn to_event(
        &self,
        broker: &str,
        broker_meta: &Meta,
        template: &MetadataTemplate,
    ) -> Option<NormalizedEvent> {
        let value = self.last_value.clone()?;
        let time = self.cov.last_updated?;
        let entry = template.render(&self.descriptor())?;

        let mut meta = broker_meta.clone();
        meta.extend(entry.broker_meta);

        Some(NormalizedEvent {
            brokerage: BrokerageRef {
                broker: BrokerRef {
                    id: broker.to_owned(),
                    meta,
                },
                id: self.description.name.clone(),
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
                    data: Some(value),
                    kind: entry.target_type,
                },
            },
        })
    }
}

// ── BACnet object ──
//
// One discovered object: its last known properties and COV bookkeeping.
// Property reads merge into the stored set; a suppressed change restores
// the set as it was before the read.

use chrono::{DateTime, Utc};
use fieldlink_api::{ObjectId, ObjectType, PropertyId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::response::{PropertyData, PropertyMap};
use crate::datapoint::{CovPolicy, CovTracker, MetadataTemplate, Observation, SourceDescriptor, cov_key};
use crate::event::{
    BrokerRef, BrokerageRef, Meta, NormalizedEvent, PlatformRef, SensorRef, TimeseriesRef,
    ValueRef,
};

/// Persisted form of an object in the controller snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub identifier: u32,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone)]
pub struct BacnetObject {
    id: ObjectId,
    name: Option<String>,
    properties: PropertyMap,
    cov: CovTracker,
}

impl BacnetObject {
    pub fn new(id: ObjectId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            properties: PropertyMap::new(),
            cov: CovTracker::default(),
        }
    }

    /// Object found by a discovery sweep just now.
    pub fn discovered(id: ObjectId, name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            cov: CovTracker::discovered(now),
            ..Self::new(id, name)
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn cov(&self) -> &CovTracker {
        &self.cov
    }

    fn present_value(&self) -> Option<&PropertyData> {
        self.properties
            .get(&PropertyId::PresentValue)
            .filter(|p| p.exists)
    }

    fn value_key(&self, precision: u32) -> Option<String> {
        self.present_value()
            .and_then(|p| p.value.as_ref())
            .map(|v| cov_key(v, precision))
    }

    fn text(&self, property: PropertyId) -> String {
        self.properties
            .get(&property)
            .filter(|p| p.exists)
            .and_then(PropertyData::text)
            .unwrap_or_default()
    }

    /// Merge freshly read properties and classify the change.
    pub fn consume(
        &mut self,
        update: &PropertyMap,
        policy: &CovPolicy,
        now: DateTime<Utc>,
    ) -> Observation {
        let precision = policy.precision_for(
            self.name.as_deref().unwrap_or_default(),
            &self.text(PropertyId::Description),
            &self.text(PropertyId::Units),
        );
        let previous_key = self.value_key(precision);
        let previous = self.properties.clone();

        for (id, data) in update.iter().filter(|(_, d)| d.exists) {
            self.properties.insert(*id, data.clone());
        }
        let updated_key = self.value_key(precision);

        let name = self.text(PropertyId::Name);
        if !name.is_empty() {
            self.name = Some(name);
        }

        let observation = self.cov.observe(
            previous_key.as_deref(),
            updated_key.as_deref(),
            now,
            policy.minimum_interval,
        );

        let label = self.name.as_deref().unwrap_or("?");
        match observation {
            Observation::Initial => {
                debug!(object = %label, value = ?updated_key, "initial value");
            }
            Observation::Suppressed => {
                debug!(object = %label, "omitting change notification inside minimum interval");
                self.properties = previous;
            }
            Observation::Changed => {
                debug!(object = %label, from = ?previous_key, to = ?updated_key, "value changed");
            }
            Observation::Unchanged => {}
        }
        observation
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::Bacnet {
            name: self.name.clone().unwrap_or_default(),
            description: self.text(PropertyId::Description),
            units: self.text(PropertyId::Units),
            tag: self
                .present_value()
                .and_then(|p| p.tag.clone())
                .unwrap_or_else(|| "UNKNOWN".into()),
            object_type: self.id.object_type.to_string(),
            instance: self.id.instance,
        }
    }

    /// Build the outgoing event for the current state. `None` until the
    /// object has a name, a present value and a first emitted change, or
    /// when the template's required fields are missing.
    pub fn to_event(
        &self,
        broker: &str,
        broker_meta: &Meta,
        template: &MetadataTemplate,
    ) -> Option<NormalizedEvent> {
        let source = self.name.clone()?;
        let value = self.present_value()?;
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
                id: source,
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
                    data: value.value.clone(),
                    kind: entry.target_type,
                },
            },
        })
    }

    pub fn to_snapshot(&self) -> SnapshotEntry {
        SnapshotEntry {
            identifier: self.id.instance,
            object_type: self.id.object_type,
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::datapoint::PrecisionRule;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(value: f64) -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert(
            PropertyId::PresentValue,
            PropertyData {
                identifier: PropertyId::PresentValue,
                tag: Some("REAL".into()),
                value: Some(json!(value)),
                exists: true,
            },
        );
        map
    }

    fn policy() -> CovPolicy {
        CovPolicy {
            precision: 2,
            minimum_interval: Duration::from_secs(10),
            overrides: Vec::new(),
        }
    }

    fn stored(object: &BacnetObject) -> serde_json::Value {
        object.properties()[&PropertyId::PresentValue]
            .value
            .clone()
            .unwrap()
    }

    #[test]
    fn suppressed_change_rolls_back_properties() {
        let id = ObjectId::new(ObjectType::AnalogInput, 3);
        let mut object = BacnetObject::new(id, Some("AHU1-SAT".into()));

        assert_eq!(object.consume(&reading(3.22), &policy(), at(0)), Observation::Initial);
        assert_eq!(object.consume(&reading(3.23), &policy(), at(1)), Observation::Changed);
        assert_eq!(object.consume(&reading(3.24), &policy(), at(6)), Observation::Suppressed);
        assert_eq!(stored(&object), json!(3.23));

        assert_eq!(object.consume(&reading(3.24), &policy(), at(12)), Observation::Changed);
        assert_eq!(stored(&object), json!(3.24));
        assert_eq!(object.consume(&reading(3.241), &policy(), at(13)), Observation::Unchanged);
    }

    #[test]
    fn matching_objects_use_their_own_precision() {
        let policy = CovPolicy {
            overrides: vec![PrecisionRule {
                pattern: "kWh".into(),
                precision: 0,
            }],
            ..policy()
        };
        let id = ObjectId::new(ObjectType::AnalogInput, 7);
        let mut meter = BacnetObject::new(id, Some("Main meter".into()));
        let mut props = reading(1200.2);
        props.insert(
            PropertyId::Units,
            PropertyData {
                identifier: PropertyId::Units,
                tag: Some("ENUMERATED".into()),
                value: Some(json!("kWh")),
                exists: true,
            },
        );
        assert_eq!(meter.consume(&props, &policy, at(0)), Observation::Initial);
        assert_eq!(meter.consume(&reading(1200.4), &policy, at(20)), Observation::Unchanged);
        assert_eq!(meter.consume(&reading(1201.0), &policy, at(40)), Observation::Changed);

        let mut sensor = BacnetObject::new(ObjectId::new(ObjectType::AnalogInput, 8), Some("AHU1-SAT".into()));
        sensor.consume(&reading(20.2), &policy, at(0));
        assert_eq!(sensor.consume(&reading(20.4), &policy, at(20)), Observation::Changed);
    }

    #[test]
    fn absent_properties_do_not_clobber_known_ones() {
        let id = ObjectId::new(ObjectType::AnalogInput, 3);
        let mut object = BacnetObject::new(id, None);
        object.consume(&reading(1.0), &policy(), at(0));

        let mut missing = PropertyMap::new();
        missing.insert(
            PropertyId::PresentValue,
            PropertyData {
                identifier: PropertyId::PresentValue,
                tag: None,
                value: None,
                exists: false,
            },
        );
        assert_eq!(object.consume(&missing, &policy(), at(5)), Observation::Unchanged);
        assert_eq!(stored(&object), json!(1.0));
    }

    #[test]
    fn event_carries_identity_and_accuracy() {
        let id = ObjectId::new(ObjectType::AnalogInput, 3);
        let mut object = BacnetObject::discovered(id, Some("AHU1-SAT".into()), at(0));
        let mut props = reading(20.0);
        props.insert(
            PropertyId::Description,
            PropertyData {
                identifier: PropertyId::Description,
                tag: Some("CHARACTER_STRING".into()),
                value: Some(json!("Supply Air Temperature")),
                exists: true,
            },
        );
        object.consume(&props, &policy(), at(0));
        assert!(object.to_event("BMS", &Meta::new(), &MetadataTemplate::default()).is_none());

        object.consume(&reading(21.0), &policy(), at(30));
        let event = object
            .to_event("BMS", &Meta::new(), &MetadataTemplate::default())
            .unwrap();
        assert_eq!(event.brokerage.id, "AHU1-SAT");
        assert_eq!(event.sensor.observed_property, "Supply Air Temperature");
        assert_eq!(event.timeseries.value.data, Some(json!(21.0)));
        assert_eq!(event.timeseries.value.kind, "Real");
        assert_eq!(event.timeseries.value.time, at(30));
        assert_eq!(event.timeseries.value.time_accuracy, Some(30.0));
    }
}

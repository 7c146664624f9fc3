// ── Graph assertion ──
//
// Top-down find-or-create-or-patch of Platform → Sensor → (Brokerage,
// Timeseries) for one natural key. Existing rows are only patched when a
// field actually differs.

use tracing::debug;
use uuid::Uuid;

use super::{GraphTransaction, Timeseries};
use crate::error::StoreError;
use crate::event::{Meta, NormalizedEvent, StorageClass};

/// The graph shape an event declares for its source.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredPlatform {
    pub name: String,
    pub meta: Meta,
    pub sensor: DesiredSensor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredSensor {
    pub property: String,
    pub meta: Meta,
    pub brokerage: DesiredBrokerage,
    pub timeseries: DesiredTimeseries,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredBrokerage {
    pub broker: String,
    pub source_id: String,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredTimeseries {
    pub unit: Option<String>,
    pub storage: StorageClass,
}

impl DesiredPlatform {
    /// Broker meta is the base of the brokerage meta; brokerage keys win.
    pub fn from_event(event: &NormalizedEvent, storage: StorageClass) -> Self {
        let mut brokerage_meta = event.brokerage.broker.meta.clone();
        brokerage_meta.extend(event.brokerage.meta.clone());
        Self {
            name: event.platform.name.clone(),
            meta: event.platform.meta.clone(),
            sensor: DesiredSensor {
                property: event.sensor.observed_property.clone(),
                meta: event.sensor.meta.clone(),
                brokerage: DesiredBrokerage {
                    broker: event.brokerage.broker.id.clone(),
                    source_id: event.brokerage.id.clone(),
                    meta: brokerage_meta,
                },
                timeseries: DesiredTimeseries {
                    unit: event.timeseries.unit.clone().filter(|u| !u.is_empty()),
                    storage,
                },
            },
        }
    }
}

/// What an assertion ended up pointing at, and how much it wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertOutcome {
    pub platform_id: Uuid,
    pub sensor_id: Uuid,
    pub brokerage_id: Uuid,
    pub timeseries: Timeseries,
    pub created: usize,
    pub patched: usize,
}

impl AssertOutcome {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.patched == 0
    }
}

#[derive(Default)]
struct Tally {
    created: usize,
    patched: usize,
}

/// Make the graph inside `tx` match `desired`.
///
/// A sensor already joined to the natural key is reused even when the
/// declared platform or property changed; it is re-pointed rather than
/// duplicated.
pub async fn assert_platform(
    tx: &mut dyn GraphTransaction,
    desired: &DesiredPlatform,
) -> Result<AssertOutcome, StoreError> {
    let mut tally = Tally::default();
    let want = &desired.sensor;

    let existing_sensor = tx
        .sensor_id_for_brokerage(&want.brokerage.broker, &want.brokerage.source_id)
        .await?;

    // ── Platform ─────────────────────────────────────────────────
    let platform = match tx.platform_by_name(&desired.name).await? {
        Some(mut platform) => {
            if platform.meta != desired.meta {
                platform.meta = desired.meta.clone();
                tx.patch_platform(&platform).await?;
                tally.patched += 1;
            }
            platform
        }
        None => {
            tally.created += 1;
            tx.insert_platform(&desired.name, &desired.meta).await?
        }
    };

    // ── Sensor ───────────────────────────────────────────────────
    let found = match existing_sensor {
        Some(id) => tx.sensor(id).await?,
        None => tx.sensor_by_property(platform.id, &want.property).await?,
    };
    let sensor = match found {
        Some(mut sensor) => {
            if sensor.platform_id != platform.id
                || sensor.property != want.property
                || sensor.meta != want.meta
            {
                sensor.platform_id = platform.id;
                sensor.property.clone_from(&want.property);
                sensor.meta = want.meta.clone();
                tx.patch_sensor(&sensor).await?;
                tally.patched += 1;
            }
            sensor
        }
        None => {
            tally.created += 1;
            tx.insert_sensor(platform.id, &want.property, &want.meta).await?
        }
    };

    // ── Brokerage ────────────────────────────────────────────────
    let broker = match tx.broker_by_name(&want.brokerage.broker).await? {
        Some(broker) => broker,
        None => {
            tally.created += 1;
            tx.insert_broker(&want.brokerage.broker).await?
        }
    };
    let brokerage = match tx.brokerage(broker.id, &want.brokerage.source_id).await? {
        Some(mut brokerage) => {
            if brokerage.sensor_id != sensor.id || brokerage.meta != want.brokerage.meta {
                brokerage.sensor_id = sensor.id;
                brokerage.meta = want.brokerage.meta.clone();
                tx.patch_brokerage(&brokerage).await?;
                tally.patched += 1;
            }
            brokerage
        }
        None => {
            tally.created += 1;
            tx.insert_brokerage(broker.id, &want.brokerage.source_id, sensor.id, &want.brokerage.meta)
                .await?
        }
    };

    // ── Timeseries ───────────────────────────────────────────────
    let unit_id = match &want.timeseries.unit {
        Some(name) => Some(match tx.unit_by_name(name).await? {
            Some(unit) => unit.id,
            None => {
                tally.created += 1;
                tx.insert_unit(name).await?.id
            }
        }),
        None => None,
    };
    let active = tx
        .timeseries_for_sensor(sensor.id)
        .await?
        .into_iter()
        .find(|t| t.storage == want.timeseries.storage);
    let timeseries = match active {
        Some(mut timeseries) => {
            if timeseries.unit_id != unit_id {
                timeseries.unit_id = unit_id;
                tx.patch_timeseries(&timeseries).await?;
                tally.patched += 1;
            }
            timeseries
        }
        None => {
            tally.created += 1;
            tx.insert_timeseries(sensor.id, unit_id, want.timeseries.storage)
                .await?
        }
    };

    debug!(
        platform = %desired.name,
        source = %want.brokerage.source_id,
        created = tally.created,
        patched = tally.patched,
        "asserted platform"
    );

    Ok(AssertOutcome {
        platform_id: platform.id,
        sensor_id: sensor.id,
        brokerage_id: brokerage.id,
        timeseries,
        created: tally.created,
        patched: tally.patched,
    })
}

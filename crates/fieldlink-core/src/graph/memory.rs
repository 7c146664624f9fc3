// ── In-memory entity graph ──
//
// Optimistic transactions over a shared table set. Each transaction reads
// a copy taken at `begin` and replays its writes at commit, where unique
// constraints are checked against the committed state so that racing
// writers fail with `UniqueViolation`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Broker, Brokerage, GraphStore, GraphTransaction, Platform, ResolvedSensor, Sensor, Timeseries,
    Unit,
};
use crate::error::StoreError;
use crate::event::{Meta, StorageClass};

#[derive(Debug, Clone, Default)]
struct Tables {
    platforms: HashMap<Uuid, Platform>,
    sensors: HashMap<Uuid, Sensor>,
    brokers: HashMap<Uuid, Broker>,
    brokerages: HashMap<Uuid, Brokerage>,
    units: HashMap<Uuid, Unit>,
    timeseries: HashMap<Uuid, Timeseries>,
}

impl Tables {
    fn broker_named(&self, name: &str) -> Option<&Broker> {
        self.brokers.values().find(|b| b.name == name)
    }

    fn brokerage_for(&self, broker_id: Uuid, source_id: &str) -> Option<&Brokerage> {
        self.brokerages
            .values()
            .find(|b| b.broker_id == broker_id && b.source_id == source_id)
    }

    fn sensor_id_for(&self, broker: &str, source_id: &str) -> Option<Uuid> {
        let broker = self.broker_named(broker)?;
        self.brokerage_for(broker.id, source_id).map(|b| b.sensor_id)
    }

    fn timeseries_of(&self, sensor_id: Uuid) -> Vec<Timeseries> {
        let mut series: Vec<Timeseries> = self
            .timeseries
            .values()
            .filter(|t| t.sensor_id == sensor_id)
            .cloned()
            .collect();
        series.sort_by_key(|t| t.num);
        series
    }

    /// Upsert one row, enforcing the unique constraint of its table.
    fn apply(&mut self, change: Change) -> Result<Uuid, StoreError> {
        match change {
            Change::Platform(row) => {
                if self.platforms.values().any(|p| p.id != row.id && p.name == row.name) {
                    return Err(StoreError::unique("platform_name_key"));
                }
                let id = row.id;
                self.platforms.insert(id, row);
                Ok(id)
            }
            Change::Sensor(row) => {
                if self.sensors.values().any(|s| {
                    s.id != row.id && s.platform_id == row.platform_id && s.property == row.property
                }) {
                    return Err(StoreError::unique("sensor_platform_property_key"));
                }
                let id = row.id;
                self.sensors.insert(id, row);
                Ok(id)
            }
            Change::Broker(row) => {
                if self.brokers.values().any(|b| b.id != row.id && b.name == row.name) {
                    return Err(StoreError::unique("broker_name_key"));
                }
                let id = row.id;
                self.brokers.insert(id, row);
                Ok(id)
            }
            Change::Brokerage(row) => {
                if self.brokerages.values().any(|b| {
                    b.id != row.id && b.broker_id == row.broker_id && b.source_id == row.source_id
                }) {
                    return Err(StoreError::unique("brokerage_broker_source_key"));
                }
                let id = row.id;
                self.brokerages.insert(id, row);
                Ok(id)
            }
            Change::Unit(row) => {
                if self.units.values().any(|u| u.id != row.id && u.name == row.name) {
                    return Err(StoreError::unique("unit_name_key"));
                }
                let id = row.id;
                self.units.insert(id, row);
                Ok(id)
            }
            Change::Timeseries(row) => {
                let id = row.id;
                self.timeseries.insert(id, row);
                Ok(id)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Change {
    Platform(Platform),
    Sensor(Sensor),
    Broker(Broker),
    Brokerage(Brokerage),
    Unit(Unit),
    Timeseries(Timeseries),
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub platforms: usize,
    pub sensors: usize,
    pub brokers: usize,
    pub brokerages: usize,
    pub units: usize,
    pub timeseries: usize,
}

struct Shared {
    tables: Mutex<Tables>,
    next_num: AtomicI64,
    begun: AtomicUsize,
    committed: AtomicUsize,
    injected: Mutex<VecDeque<StoreError>>,
}

#[derive(Clone)]
pub struct MemoryGraphStore {
    shared: Arc<Shared>,
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                next_num: AtomicI64::new(1),
                begun: AtomicUsize::new(0),
                committed: AtomicUsize::new(0),
                injected: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Number of transactions started so far.
    pub fn transactions_begun(&self) -> usize {
        self.shared.begun.load(Ordering::Relaxed)
    }

    pub fn transactions_committed(&self) -> usize {
        self.shared.committed.load(Ordering::Relaxed)
    }

    /// Make the next commit fail with `error` without applying anything.
    pub async fn fail_next_commit(&self, error: StoreError) {
        self.shared.injected.lock().await.push_back(error);
    }

    pub async fn counts(&self) -> GraphCounts {
        let t = self.shared.tables.lock().await;
        GraphCounts {
            platforms: t.platforms.len(),
            sensors: t.sensors.len(),
            brokers: t.brokers.len(),
            brokerages: t.brokerages.len(),
            units: t.units.len(),
            timeseries: t.timeseries.len(),
        }
    }

    pub async fn platform_named(&self, name: &str) -> Option<Platform> {
        let t = self.shared.tables.lock().await;
        t.platforms.values().find(|p| p.name == name).cloned()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StoreError> {
        self.shared.begun.fetch_add(1, Ordering::Relaxed);
        let view = self.shared.tables.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            view,
            changes: Vec::new(),
        }))
    }

    async fn sensor_for_brokerage(
        &self,
        broker: &str,
        source_id: &str,
    ) -> Result<Option<ResolvedSensor>, StoreError> {
        let t = self.shared.tables.lock().await;
        let Some(sensor) = t
            .sensor_id_for(broker, source_id)
            .and_then(|id| t.sensors.get(&id))
        else {
            return Ok(None);
        };
        Ok(Some(ResolvedSensor {
            sensor: sensor.clone(),
            timeseries: t.timeseries_of(sensor.id),
        }))
    }
}

// ── Transaction ─────────────────────────────────────────────────────

struct MemoryTransaction {
    shared: Arc<Shared>,
    view: Tables,
    changes: Vec<Change>,
}

impl MemoryTransaction {
    fn record(&mut self, change: Change) -> Result<(), StoreError> {
        self.view.apply(change.clone())?;
        self.changes.push(change);
        Ok(())
    }
}

#[async_trait]
impl GraphTransaction for MemoryTransaction {
    async fn sensor_id_for_brokerage(
        &mut self,
        broker: &str,
        source_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self.view.sensor_id_for(broker, source_id))
    }

    async fn platform_by_name(&mut self, name: &str) -> Result<Option<Platform>, StoreError> {
        Ok(self.view.platforms.values().find(|p| p.name == name).cloned())
    }

    async fn sensor(&mut self, id: Uuid) -> Result<Option<Sensor>, StoreError> {
        Ok(self.view.sensors.get(&id).cloned())
    }

    async fn sensor_by_property(
        &mut self,
        platform_id: Uuid,
        property: &str,
    ) -> Result<Option<Sensor>, StoreError> {
        Ok(self
            .view
            .sensors
            .values()
            .find(|s| s.platform_id == platform_id && s.property == property)
            .cloned())
    }

    async fn broker_by_name(&mut self, name: &str) -> Result<Option<Broker>, StoreError> {
        Ok(self.view.broker_named(name).cloned())
    }

    async fn brokerage(
        &mut self,
        broker_id: Uuid,
        source_id: &str,
    ) -> Result<Option<Brokerage>, StoreError> {
        Ok(self.view.brokerage_for(broker_id, source_id).cloned())
    }

    async fn unit_by_name(&mut self, name: &str) -> Result<Option<Unit>, StoreError> {
        Ok(self.view.units.values().find(|u| u.name == name).cloned())
    }

    async fn timeseries_for_sensor(&mut self, sensor_id: Uuid) -> Result<Vec<Timeseries>, StoreError> {
        Ok(self.view.timeseries_of(sensor_id))
    }

    async fn insert_platform(&mut self, name: &str, meta: &Meta) -> Result<Platform, StoreError> {
        let row = Platform {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            meta: meta.clone(),
        };
        self.record(Change::Platform(row.clone()))?;
        Ok(row)
    }

    async fn insert_sensor(
        &mut self,
        platform_id: Uuid,
        property: &str,
        meta: &Meta,
    ) -> Result<Sensor, StoreError> {
        let row = Sensor {
            id: Uuid::new_v4(),
            platform_id,
            property: property.to_owned(),
            meta: meta.clone(),
        };
        self.record(Change::Sensor(row.clone()))?;
        Ok(row)
    }

    async fn insert_broker(&mut self, name: &str) -> Result<Broker, StoreError> {
        let row = Broker {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            meta: Meta::new(),
        };
        self.record(Change::Broker(row.clone()))?;
        Ok(row)
    }

    async fn insert_brokerage(
        &mut self,
        broker_id: Uuid,
        source_id: &str,
        sensor_id: Uuid,
        meta: &Meta,
    ) -> Result<Brokerage, StoreError> {
        let row = Brokerage {
            id: Uuid::new_v4(),
            broker_id,
            source_id: source_id.to_owned(),
            sensor_id,
            meta: meta.clone(),
        };
        self.record(Change::Brokerage(row.clone()))?;
        Ok(row)
    }

    async fn insert_unit(&mut self, name: &str) -> Result<Unit, StoreError> {
        let row = Unit {
            id: Uuid::new_v4(),
            name: name.to_owned(),
        };
        self.record(Change::Unit(row.clone()))?;
        Ok(row)
    }

    async fn insert_timeseries(
        &mut self,
        sensor_id: Uuid,
        unit_id: Option<Uuid>,
        storage: StorageClass,
    ) -> Result<Timeseries, StoreError> {
        let row = Timeseries {
            id: Uuid::new_v4(),
            num: self.shared.next_num.fetch_add(1, Ordering::Relaxed),
            sensor_id,
            unit_id,
            storage,
        };
        self.record(Change::Timeseries(row.clone()))?;
        Ok(row)
    }

    async fn patch_platform(&mut self, platform: &Platform) -> Result<(), StoreError> {
        self.record(Change::Platform(platform.clone()))
    }

    async fn patch_sensor(&mut self, sensor: &Sensor) -> Result<(), StoreError> {
        self.record(Change::Sensor(sensor.clone()))
    }

    async fn patch_brokerage(&mut self, brokerage: &Brokerage) -> Result<(), StoreError> {
        self.record(Change::Brokerage(brokerage.clone()))
    }

    async fn patch_timeseries(&mut self, timeseries: &Timeseries) -> Result<(), StoreError> {
        self.record(Change::Timeseries(timeseries.clone()))
    }

    async fn commit(self: Box<Self>) -> Result<Vec<Uuid>, StoreError> {
        let Self { shared, changes, .. } = *self;
        if let Some(error) = shared.injected.lock().await.pop_front() {
            return Err(error);
        }

        let mut tables = shared.tables.lock().await;
        let mut staged = tables.clone();
        let mut touched = Vec::with_capacity(changes.len());
        for change in changes {
            let id = staged.apply(change)?;
            if !touched.contains(&id) {
                touched.push(id);
            }
        }
        *tables = staged;
        shared.committed.fetch_add(1, Ordering::Relaxed);
        Ok(touched)
    }
}

// ── Canonical entity graph ──
//
// Platform → Sensor → (Brokerage, Timeseries) records and the storage
// seam the receiver reconciles against. `MemoryGraphStore` is the
// in-process implementation; database backends implement the same
// traits.

pub mod assert;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{Meta, StorageClass};

pub use assert::{AssertOutcome, DesiredPlatform, assert_platform};
pub use memory::{GraphCounts, MemoryGraphStore};

// ── Records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub id: Uuid,
    pub name: String,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: Uuid,
    pub platform_id: Uuid,
    /// Observed property name; unique per platform.
    pub property: String,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    pub id: Uuid,
    pub name: String,
    pub meta: Meta,
}

/// Join between a raw source identity and a canonical sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brokerage {
    pub id: Uuid,
    pub broker_id: Uuid,
    pub source_id: String,
    pub sensor_id: Uuid,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeseries {
    pub id: Uuid,
    /// Compact key referenced by stored value rows.
    pub num: i64,
    pub sensor_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub storage: StorageClass,
}

/// A sensor resolved from a brokerage, with its timeseries.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSensor {
    pub sensor: Sensor,
    pub timeseries: Vec<Timeseries>,
}

impl ResolvedSensor {
    /// Entity ids this resolution depends on, for cache invalidation.
    pub fn entity_ids(&self) -> Vec<String> {
        std::iter::once(self.sensor.id)
            .chain(std::iter::once(self.sensor.platform_id))
            .chain(self.timeseries.iter().map(|t| t.id))
            .map(|id| id.to_string())
            .collect()
    }
}

// ── Storage seam ────────────────────────────────────────────────────

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StoreError>;

    /// Resolve `(broker name, source id)` outside any transaction.
    async fn sensor_for_brokerage(
        &self,
        broker: &str,
        source_id: &str,
    ) -> Result<Option<ResolvedSensor>, StoreError>;
}

/// One unit of work against the graph. Dropping without `commit`
/// discards every write.
#[async_trait]
pub trait GraphTransaction: Send {
    async fn sensor_id_for_brokerage(
        &mut self,
        broker: &str,
        source_id: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn platform_by_name(&mut self, name: &str) -> Result<Option<Platform>, StoreError>;
    async fn sensor(&mut self, id: Uuid) -> Result<Option<Sensor>, StoreError>;
    async fn sensor_by_property(
        &mut self,
        platform_id: Uuid,
        property: &str,
    ) -> Result<Option<Sensor>, StoreError>;
    async fn broker_by_name(&mut self, name: &str) -> Result<Option<Broker>, StoreError>;
    async fn brokerage(
        &mut self,
        broker_id: Uuid,
        source_id: &str,
    ) -> Result<Option<Brokerage>, StoreError>;
    async fn unit_by_name(&mut self, name: &str) -> Result<Option<Unit>, StoreError>;
    async fn timeseries_for_sensor(&mut self, sensor_id: Uuid) -> Result<Vec<Timeseries>, StoreError>;

    async fn insert_platform(&mut self, name: &str, meta: &Meta) -> Result<Platform, StoreError>;
    async fn insert_sensor(
        &mut self,
        platform_id: Uuid,
        property: &str,
        meta: &Meta,
    ) -> Result<Sensor, StoreError>;
    async fn insert_broker(&mut self, name: &str) -> Result<Broker, StoreError>;
    async fn insert_brokerage(
        &mut self,
        broker_id: Uuid,
        source_id: &str,
        sensor_id: Uuid,
        meta: &Meta,
    ) -> Result<Brokerage, StoreError>;
    async fn insert_unit(&mut self, name: &str) -> Result<Unit, StoreError>;
    async fn insert_timeseries(
        &mut self,
        sensor_id: Uuid,
        unit_id: Option<Uuid>,
        storage: StorageClass,
    ) -> Result<Timeseries, StoreError>;

    async fn patch_platform(&mut self, platform: &Platform) -> Result<(), StoreError>;
    async fn patch_sensor(&mut self, sensor: &Sensor) -> Result<(), StoreError>;
    async fn patch_brokerage(&mut self, brokerage: &Brokerage) -> Result<(), StoreError>;
    async fn patch_timeseries(&mut self, timeseries: &Timeseries) -> Result<(), StoreError>;

    /// Apply every write atomically. Returns the ids of touched entities.
    async fn commit(self: Box<Self>) -> Result<Vec<Uuid>, StoreError>;
}

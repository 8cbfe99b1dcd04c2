//! Document and time-series storage
//!
//! Devices persist their description on every mutation, the dispatcher reads
//! scenarios and the recorder writes metric points. Two backends implement the
//! traits: [`MemoryStore`] for tests and throwaway runs, [`RedbStore`] for a
//! single on-disk file.

mod redb_store;

pub use redb_store::RedbStore;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::DeviceDescription;
use crate::scenario::Scenario;

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document {0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Device descriptions and scenarios
pub trait DocumentStore: Send + Sync {
    fn insert_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()>;

    /// Replace an existing description, `NotFound` if it was never inserted
    fn update_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()>;

    fn get_description(&self, id: Uuid) -> StoreResult<Option<DeviceDescription>>;

    fn list_descriptions(&self) -> StoreResult<Vec<(Uuid, DeviceDescription)>>;

    /// Remove every description, returning how many there were
    fn clear_descriptions(&self) -> StoreResult<usize>;

    /// Insert or replace a scenario under its id
    fn put_scenario(&self, scenario: &Scenario) -> StoreResult<()>;

    fn get_scenario(&self, id: u32) -> StoreResult<Option<Scenario>>;

    /// All scenarios ordered by id
    fn list_scenarios(&self) -> StoreResult<Vec<Scenario>>;

    fn clear_scenarios(&self) -> StoreResult<usize>;
}

/// Tags attached to every metric point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTags {
    pub building: String,
    pub floor: String,
    pub room: String,
    pub object_name: String,
    pub field_name: String,
}

/// Numeric when the payload parses as a float, text otherwise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn parse(payload: &str) -> Self {
        match payload.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => MetricValue::Number(n),
            _ => MetricValue::Text(payload.to_string()),
        }
    }
}

/// One sample written to the time-series store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Device type
    pub measurement: String,
    pub tags: MetricTags,
    pub value: MetricValue,
    pub timestamp: DateTime<Utc>,
}

/// Time-series storage for metric points
pub trait MetricStore: Send + Sync {
    fn write_point(&self, point: &MetricPoint) -> StoreResult<()>;

    /// Points of one measurement in `[start, end]`, oldest first
    fn query_points(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MetricPoint>>;

    /// Drop points older than `cutoff`, returning how many were removed
    fn prune_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// In-process store, lost on exit
#[derive(Default)]
pub struct MemoryStore {
    descriptions: RwLock<BTreeMap<Uuid, DeviceDescription>>,
    scenarios: RwLock<BTreeMap<u32, Scenario>>,
    points: RwLock<Vec<MetricPoint>>,
    description_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of description inserts and updates performed so far
    pub fn description_writes(&self) -> usize {
        self.description_writes.load(Ordering::SeqCst)
    }
}

impl DocumentStore for MemoryStore {
    fn insert_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()> {
        self.descriptions.write().insert(id, description.clone());
        self.description_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()> {
        let mut descriptions = self.descriptions.write();
        let slot = descriptions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        *slot = description.clone();
        self.description_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_description(&self, id: Uuid) -> StoreResult<Option<DeviceDescription>> {
        Ok(self.descriptions.read().get(&id).cloned())
    }

    fn list_descriptions(&self) -> StoreResult<Vec<(Uuid, DeviceDescription)>> {
        Ok(self
            .descriptions
            .read()
            .iter()
            .map(|(id, d)| (*id, d.clone()))
            .collect())
    }

    fn clear_descriptions(&self) -> StoreResult<usize> {
        let mut descriptions = self.descriptions.write();
        let count = descriptions.len();
        descriptions.clear();
        Ok(count)
    }

    fn put_scenario(&self, scenario: &Scenario) -> StoreResult<()> {
        self.scenarios
            .write()
            .insert(scenario.scenario_id, scenario.clone());
        Ok(())
    }

    fn get_scenario(&self, id: u32) -> StoreResult<Option<Scenario>> {
        Ok(self.scenarios.read().get(&id).cloned())
    }

    fn list_scenarios(&self) -> StoreResult<Vec<Scenario>> {
        Ok(self.scenarios.read().values().cloned().collect())
    }

    fn clear_scenarios(&self) -> StoreResult<usize> {
        let mut scenarios = self.scenarios.write();
        let count = scenarios.len();
        scenarios.clear();
        Ok(count)
    }
}

impl MetricStore for MemoryStore {
    fn write_point(&self, point: &MetricPoint) -> StoreResult<()> {
        self.points.write().push(point.clone());
        Ok(())
    }

    fn query_points(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MetricPoint>> {
        let mut points: Vec<MetricPoint> = self
            .points
            .read()
            .iter()
            .filter(|p| p.measurement == measurement && p.timestamp >= start && p.timestamp <= end)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        if let Some(limit) = limit {
            points.truncate(limit);
        }
        Ok(points)
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut points = self.points.write();
        let before = points.len();
        points.retain(|p| p.timestamp >= cutoff);
        Ok(before - points.len())
    }
}

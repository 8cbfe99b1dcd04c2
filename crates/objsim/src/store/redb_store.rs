// Single file backend: one redb database, JSON encoded values.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use super::{DocumentStore, MetricPoint, MetricStore, StoreError, StoreResult};
use crate::registry::DeviceDescription;
use crate::scenario::Scenario;

// Key is the document uuid
const DESCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("descriptions");

// Key is the scenario id
const SCENARIOS: TableDefinition<u32, &[u8]> = TableDefinition::new("scenarios");

// Key is "measurement:timestamp_micros:uuid"
const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");

macro_rules! database_error {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Database(e.to_string())
                }
            }
        )*
    };
}

database_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

fn metric_key_prefix(measurement: &str, at: DateTime<Utc>) -> String {
    format!("{}:{:020}", measurement, at.timestamp_micros().max(0))
}

pub struct RedbStore {
    path: PathBuf,
    db: Database,
}

impl RedbStore {
    /// Open or create the database file, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(DESCRIPTIONS)?;
        write_txn.open_table(SCENARIOS)?;
        write_txn.open_table(METRICS)?;
        write_txn.commit()?;

        tracing::debug!(path = %path.display(), "Opened store");
        Ok(Self { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn put_description(&self, id: Uuid, description: &DeviceDescription, must_exist: bool) -> StoreResult<()> {
        let key = id.to_string();
        let bytes = serde_json::to_vec(description)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DESCRIPTIONS)?;
            if must_exist && table.get(key.as_str())?.is_none() {
                return Err(StoreError::NotFound(key));
            }
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl DocumentStore for RedbStore {
    fn insert_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()> {
        self.put_description(id, description, false)
    }

    fn update_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()> {
        self.put_description(id, description, true)
    }

    fn get_description(&self, id: Uuid) -> StoreResult<Option<DeviceDescription>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DESCRIPTIONS)?;
        let key = id.to_string();
        match table.get(key.as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn list_descriptions(&self) -> StoreResult<Vec<(Uuid, DeviceDescription)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DESCRIPTIONS)?;

        let mut descriptions = Vec::new();
        for entry in table.iter()? {
            let (key, bytes) = entry?;
            let Ok(id) = Uuid::parse_str(key.value()) else {
                tracing::warn!(key = key.value(), "Skipping description with invalid id");
                continue;
            };
            descriptions.push((id, serde_json::from_slice(bytes.value())?));
        }
        Ok(descriptions)
    }

    fn clear_descriptions(&self) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let count = {
            let mut table = write_txn.open_table(DESCRIPTIONS)?;
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                keys.push(key.value().to_string());
            }
            for key in &keys {
                table.remove(key.as_str())?;
            }
            keys.len()
        };
        write_txn.commit()?;
        Ok(count)
    }

    fn put_scenario(&self, scenario: &Scenario) -> StoreResult<()> {
        let bytes = serde_json::to_vec(scenario)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SCENARIOS)?;
            table.insert(scenario.scenario_id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_scenario(&self, id: u32) -> StoreResult<Option<Scenario>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCENARIOS)?;
        match table.get(id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn list_scenarios(&self) -> StoreResult<Vec<Scenario>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCENARIOS)?;

        let mut scenarios = Vec::new();
        for entry in table.iter()? {
            let (_, bytes) = entry?;
            scenarios.push(serde_json::from_slice(bytes.value())?);
        }
        Ok(scenarios)
    }

    fn clear_scenarios(&self) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let count = {
            let mut table = write_txn.open_table(SCENARIOS)?;
            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (id, _) = entry?;
                ids.push(id.value());
            }
            for id in &ids {
                table.remove(*id)?;
            }
            ids.len()
        };
        write_txn.commit()?;
        Ok(count)
    }
}

impl MetricStore for RedbStore {
    fn write_point(&self, point: &MetricPoint) -> StoreResult<()> {
        let key = format!(
            "{}:{}",
            metric_key_prefix(&point.measurement, point.timestamp),
            Uuid::new_v4()
        );
        let bytes = serde_json::to_vec(point)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METRICS)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn query_points(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MetricPoint>> {
        let start_key = metric_key_prefix(measurement, start);
        // ';' sorts right after ':' so every uuid suffix of `end` is included
        let end_key = format!("{};", metric_key_prefix(measurement, end));

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METRICS)?;
        let limit = limit.unwrap_or(10_000);

        let mut points = Vec::new();
        for entry in table.range(start_key.as_str()..end_key.as_str())? {
            if points.len() >= limit {
                break;
            }
            let (_, bytes) = entry?;
            let point: MetricPoint = serde_json::from_slice(bytes.value())?;
            if point.measurement == measurement {
                points.push(point);
            }
        }
        Ok(points)
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(METRICS)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, bytes) = entry?;
                let point: MetricPoint = serde_json::from_slice(bytes.value())?;
                if point.timestamp < cutoff {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }
            stale.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            tracing::debug!(removed, "Pruned metric points");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Identity;
    use crate::registry::DeviceDescription;
    use crate::scenario::builtin_scenarios;
    use crate::store::tests::point;
    use chrono::Duration;
    use tempfile::tempdir;

    fn description() -> DeviceDescription {
        let identity = Identity::new("EF", "1", "1.32", "Lamp", "Ceiling Lamp 01").unwrap();
        DeviceDescription::new(identity)
    }

    #[test]
    fn descriptions_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("objsim.redb");
        let id = Uuid::new_v4();

        {
            let store = RedbStore::open(&path).unwrap();
            store.insert_description(id, &description()).unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let loaded = store.get_description(id).unwrap().unwrap();
        assert_eq!(loaded.identity.name(), "Ceiling Lamp 01");
        assert_eq!(store.list_descriptions().unwrap().len(), 1);
        assert_eq!(store.clear_descriptions().unwrap(), 1);
        assert!(store.get_description(id).unwrap().is_none());
    }

    #[test]
    fn update_requires_existing_description() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("objsim.redb")).unwrap();
        let result = store.update_description(Uuid::new_v4(), &description());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn scenarios_roundtrip() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("objsim.redb")).unwrap();
        for scenario in builtin_scenarios() {
            store.put_scenario(&scenario).unwrap();
        }

        let listed = store.list_scenarios().unwrap();
        assert_eq!(listed, builtin_scenarios());
        assert_eq!(store.get_scenario(4).unwrap().unwrap().scenario_name, "verbose");
        assert_eq!(store.clear_scenarios().unwrap(), 4);
        assert!(store.get_scenario(4).unwrap().is_none());
    }

    #[test]
    fn metric_range_is_per_measurement() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("objsim.redb")).unwrap();
        let now = Utc::now();

        store.write_point(&point("Lamp", "status", "ON", now)).unwrap();
        store.write_point(&point("Lamp", "status", "OFF", now)).unwrap();
        store.write_point(&point("Lamp", "brightness", "0", now - Duration::days(40))).unwrap();
        store.write_point(&point("Lampshade", "status", "ON", now)).unwrap();

        let recent = store
            .query_points("Lamp", now - Duration::hours(1), now, None)
            .unwrap();
        assert_eq!(recent.len(), 2);

        assert_eq!(store.prune_before(now - Duration::days(30)).unwrap(), 1);
        let all = store
            .query_points("Lamp", now - Duration::days(365), now, None)
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}

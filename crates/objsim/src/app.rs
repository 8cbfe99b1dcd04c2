//! Wiring: stores, scenario seeding and the services of a simulation run

use std::sync::Arc;

use objsim_runtime::ServiceManager;

use crate::config::{DispatcherConfig, SimConfig, StoreBackend, StoreConfig};
use crate::device::{Device, DeviceRuntime};
use crate::dispatcher::ScenarioDispatcher;
use crate::recorder::MetricsRecorder;
use crate::scenario::{builtin_scenarios, load_file};
use crate::store::{DocumentStore, MemoryStore, MetricStore, RedbStore, StoreResult};
use crate::types::Result;

/// Both stores, usually backed by the same object
#[derive(Clone)]
pub struct Stores {
    pub documents: Arc<dyn DocumentStore>,
    pub metrics: Arc<dyn MetricStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            documents: store.clone(),
            metrics: store,
        }
    }

    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::memory()),
            StoreBackend::Redb => {
                let store = Arc::new(RedbStore::open(&config.path)?);
                Ok(Self {
                    documents: store.clone(),
                    metrics: store,
                })
            }
        }
    }
}

/// Store the built-in scenarios that are missing, then import the scenario file
///
/// Returns how many scenarios were written.
pub fn seed_scenarios(config: &DispatcherConfig, store: &dyn DocumentStore) -> Result<usize> {
    let mut written = 0;

    if config.seed_builtin {
        for scenario in builtin_scenarios() {
            if store.get_scenario(scenario.scenario_id)?.is_none() {
                store.put_scenario(&scenario)?;
                written += 1;
            }
        }
    }

    if let Some(path) = &config.scenario_file {
        for scenario in load_file(path)? {
            store.put_scenario(&scenario)?;
            written += 1;
        }
    }

    Ok(written)
}

/// Start the recorder, the dispatcher and every configured device
///
/// A device that cannot be built or persisted is logged and left out; the
/// others still start. Returns the devices that are running.
pub async fn launch(config: &SimConfig, manager: &ServiceManager, stores: &Stores) -> Result<Vec<Arc<Device>>> {
    let seeded = seed_scenarios(&config.dispatcher, stores.documents.as_ref())?;
    if seeded > 0 {
        tracing::info!(seeded, "Stored scenarios");
    }

    if config.recorder.enabled {
        manager
            .spawn(MetricsRecorder::new(
                Arc::clone(&stores.metrics),
                config.recorder.clone(),
            ))
            .await?;
    }

    manager
        .spawn(
            ScenarioDispatcher::new(Arc::clone(&stores.documents))
                .with_control_topic(config.dispatcher.control_topic.as_str()),
        )
        .await?;

    let options = config.device_options();
    let mut devices = Vec::with_capacity(config.devices.len());
    for spec in &config.devices {
        let device = match spec.build(&options) {
            Ok(device) => Arc::new(device),
            Err(e) => {
                tracing::error!(name = %spec.name, error = %e, "Skipping device");
                continue;
            }
        };

        if let Err(e) = device.attach(Arc::clone(&stores.documents)) {
            tracing::error!(device = %device.identity(), error = %e, "Skipping device, state not persisted");
            continue;
        }
        manager.spawn(DeviceRuntime::new(Arc::clone(&device))).await?;
        devices.push(device);
    }

    tracing::info!(devices = devices.len(), "Fleet started");
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceSpec, KindName};
    use crate::registry::DeviceDescription;
    use crate::scenario::Scenario;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[test]
    fn seeding_keeps_existing_scenarios() {
        let stores = Stores::memory();
        let custom = Scenario {
            scenario_id: 2,
            scenario_name: "party".into(),
            configs: Vec::new(),
        };
        stores.documents.put_scenario(&custom).unwrap();

        let config = SimConfig::default();
        let written = seed_scenarios(&config.dispatcher, stores.documents.as_ref()).unwrap();
        assert_eq!(written, 3);
        assert_eq!(stores.documents.get_scenario(2).unwrap().unwrap().scenario_name, "party");
    }

    #[test]
    fn seeding_imports_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.json");
        std::fs::write(
            &path,
            r#"[{"scenario_id": 10, "scenario_name": "night", "configs": []}]"#,
        )
        .unwrap();

        let mut config = SimConfig::default();
        config.dispatcher.seed_builtin = false;
        config.dispatcher.scenario_file = Some(path);

        let stores = Stores::memory();
        assert_eq!(seed_scenarios(&config.dispatcher, stores.documents.as_ref()).unwrap(), 1);
        assert_eq!(stores.documents.list_scenarios().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn launch_starts_every_valid_device() {
        let mut config = SimConfig::default();
        config
            .devices
            .push(DeviceSpec::new(KindName::Lamp, "EF", "1", "1/32", "Broken"));

        let manager = ServiceManager::new();
        let stores = Stores::memory();
        let devices = launch(&config, &manager, &stores).await.unwrap();

        assert_eq!(devices.len(), 3);
        assert_eq!(stores.documents.list_descriptions().unwrap().len(), 3);
        assert!(manager.get("dispatcher").is_some());
        assert_eq!(manager.len(), 5);

        manager.shutdown_all().await.unwrap();
    }

    /// Accepts a fixed number of device descriptions, then refuses
    struct FullStore {
        inner: MemoryStore,
        room: AtomicUsize,
    }

    impl DocumentStore for FullStore {
        fn insert_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()> {
            if self.room.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_err() {
                return Err(StoreError::Database("no space left".into()));
            }
            self.inner.insert_description(id, description)
        }

        fn update_description(&self, id: Uuid, description: &DeviceDescription) -> StoreResult<()> {
            self.inner.update_description(id, description)
        }

        fn get_description(&self, id: Uuid) -> StoreResult<Option<DeviceDescription>> {
            self.inner.get_description(id)
        }

        fn list_descriptions(&self) -> StoreResult<Vec<(Uuid, DeviceDescription)>> {
            self.inner.list_descriptions()
        }

        fn clear_descriptions(&self) -> StoreResult<usize> {
            self.inner.clear_descriptions()
        }

        fn put_scenario(&self, scenario: &Scenario) -> StoreResult<()> {
            self.inner.put_scenario(scenario)
        }

        fn get_scenario(&self, id: u32) -> StoreResult<Option<Scenario>> {
            self.inner.get_scenario(id)
        }

        fn list_scenarios(&self) -> StoreResult<Vec<Scenario>> {
            self.inner.list_scenarios()
        }

        fn clear_scenarios(&self) -> StoreResult<usize> {
            self.inner.clear_scenarios()
        }
    }

    #[tokio::test]
    async fn launch_skips_devices_the_store_refuses() {
        let config = SimConfig::default();
        let stores = Stores {
            documents: Arc::new(FullStore {
                inner: MemoryStore::new(),
                room: AtomicUsize::new(1),
            }),
            metrics: Arc::new(MemoryStore::new()),
        };

        let manager = ServiceManager::new();
        let devices = tokio_test::assert_ok!(launch(&config, &manager, &stores).await);

        assert_eq!(devices.len(), 1);
        assert!(manager.get("dispatcher").is_some());
        assert_eq!(manager.len(), 3);

        manager.shutdown_all().await.unwrap();
    }
}

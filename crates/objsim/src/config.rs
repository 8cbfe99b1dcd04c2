//! Layered configuration
//!
//! Built-in defaults, then a TOML file (`objsim.toml` unless told otherwise),
//! then `OBJSIM_*` environment variables. Nested keys use a double underscore
//! in the environment: `OBJSIM_STORE__BACKEND=redb`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceKind, DeviceOptions};
use crate::protocol::CONTROL_TOPIC;
use crate::recorder::RecorderConfig;
use crate::registry::ConstraintPolicy;
use crate::types::Result;

pub const DEFAULT_CONFIG_FILE: &str = "objsim.toml";
pub const ENV_PREFIX: &str = "OBJSIM_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub dispatcher: DispatcherConfig,
    pub device: DeviceDefaults,
    pub recorder: RecorderConfig,
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages buffered per subscriber before the slowest one lags
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file for the redb backend
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub control_topic: String,
    /// Store the built-in scenarios on start if they are missing
    pub seed_builtin: bool,
    /// JSON file of scenarios imported on start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefaults {
    pub constraint_policy: ConstraintPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindName {
    Lamp,
    SmokeDetector,
    SystemDataPublisher,
}

/// One simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub kind: KindName,
    pub building: String,
    pub floor: String,
    pub room: String,
    pub name: String,
    /// Smoke detectors only: go off by themselves after this many milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_after_ms: Option<u64>,
}

impl DeviceSpec {
    pub fn new(kind: KindName, building: &str, floor: &str, room: &str, name: &str) -> Self {
        Self {
            kind,
            building: building.to_string(),
            floor: floor.to_string(),
            room: room.to_string(),
            name: name.to_string(),
            alarm_after_ms: None,
        }
    }

    pub fn device_kind(&self) -> DeviceKind {
        match self.kind {
            KindName::Lamp => DeviceKind::Lamp,
            KindName::SmokeDetector => DeviceKind::SmokeDetector {
                alarm_after: self.alarm_after_ms.map(Duration::from_millis),
            },
            KindName::SystemDataPublisher => DeviceKind::SystemDataPublisher,
        }
    }

    pub fn build(&self, options: &DeviceOptions) -> Result<Device> {
        Device::new(
            self.device_kind(),
            &self.building,
            &self.floor,
            &self.room,
            &self.name,
            options,
        )
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig {
                capacity: objsim_runtime::DEFAULT_BUS_CAPACITY,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                path: PathBuf::from("./data/objsim.redb"),
            },
            dispatcher: DispatcherConfig {
                control_topic: CONTROL_TOPIC.to_string(),
                seed_builtin: true,
                scenario_file: None,
            },
            device: DeviceDefaults {
                constraint_policy: ConstraintPolicy::Enforce,
            },
            recorder: RecorderConfig::default(),
            devices: vec![
                DeviceSpec::new(KindName::Lamp, "EF", "1", "1.32", "Ceiling Lamp 01"),
                DeviceSpec::new(KindName::SmokeDetector, "EF", "4", "4.21", "Corridor smoke detector"),
                DeviceSpec::new(KindName::SystemDataPublisher, "EF", "1", "1.32", "Computer 01"),
            ],
        }
    }
}

impl SimConfig {
    /// Layer defaults, the given TOML file and the environment
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(SimConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            policy: self.device.constraint_policy,
            control_topic: self.dispatcher.control_topic.clone(),
        }
    }
}

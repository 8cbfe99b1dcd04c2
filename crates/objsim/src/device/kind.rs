// Device variants: what each kind declares and how it reacts

use std::sync::Arc;
use std::time::Duration;

use crate::address::Suffix;
use crate::protocol::{Change, Namespace};
use crate::registry::{FieldMeta, Registry};
use crate::types::{Result, Value, ValueKind};

use super::system::SystemProbe;
use super::{PublishingMode, Startup};

/// Scenario a smoke detector raises when it goes off
pub const ALARM_SCENARIO: u32 = 2;

pub const STATUS: &str = "status";
pub const BRIGHTNESS: &str = "brightness";
pub const DISK_USAGE: &str = "disk_usage";
pub const MEMORY_USAGE: &str = "memory_usage";
pub const CPU_USAGE: &str = "cpu_usage";

const ON: &str = "ON";
const OFF: &str = "OFF";
const BRIGHTNESS_ON: i64 = 200;

/// The kinds of device that can be simulated
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceKind {
    Lamp,
    SmokeDetector {
        /// Raise the alarm by itself once this long after start
        alarm_after: Option<Duration>,
    },
    SystemDataPublisher,
}

impl DeviceKind {
    /// Type level of the device's address
    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceKind::Lamp => "Lamp",
            DeviceKind::SmokeDetector { .. } => "Smoke Detector",
            DeviceKind::SystemDataPublisher => "SystemData Publisher",
        }
    }

    /// Base parameter defaults for this kind
    pub fn startup(&self) -> Startup {
        match self {
            DeviceKind::Lamp | DeviceKind::SmokeDetector { .. } => Startup {
                publishing_mode: PublishingMode::OnDemand,
                ..Startup::default()
            },
            DeviceKind::SystemDataPublisher => Startup::default(),
        }
    }

    /// Register the kind's fields and their initial values
    pub fn declare(&self, registry: &mut Registry) -> Result<()> {
        match self {
            DeviceKind::Lamp => {
                registry.add_field(
                    STATUS,
                    FieldMeta::new("Lamp status", "Possible values: ON, OFF", ValueKind::String),
                    None,
                )?;
                registry.add_field(
                    BRIGHTNESS,
                    FieldMeta::new("Lamp brightness", "Value between 0 and 255", ValueKind::Integer),
                    None,
                )?;
                registry.set_field_values(vec![
                    (STATUS.to_string(), Value::text(ON)),
                    (BRIGHTNESS.to_string(), Value::Integer(BRIGHTNESS_ON)),
                ])
            }
            DeviceKind::SmokeDetector { .. } => {
                registry.add_field(
                    STATUS,
                    FieldMeta::new("Alarm status", "Possible values: ON, OFF", ValueKind::String),
                    None,
                )?;
                registry.set_field_value(STATUS, OFF)
            }
            DeviceKind::SystemDataPublisher => {
                let probe = Arc::new(SystemProbe::new());

                let disk = Arc::clone(&probe);
                registry.add_field(
                    DISK_USAGE,
                    FieldMeta::new("Disk usage", "Used share of all mounted disks, in percent", ValueKind::Float),
                    Some(Arc::new(move || Value::Float(disk.disk_usage()))),
                )?;

                let memory = Arc::clone(&probe);
                registry.add_field(
                    MEMORY_USAGE,
                    FieldMeta::new("Memory usage", "Used share of physical memory, in percent", ValueKind::Float),
                    Some(Arc::new(move || Value::Float(memory.memory_usage()))),
                )?;

                let cpu = probe;
                registry.add_field(
                    CPU_USAGE,
                    FieldMeta::new("CPU usage", "Global processor load, in percent", ValueKind::Float),
                    Some(Arc::new(move || Value::Float(cpu.cpu_usage()))),
                )
            }
        }
    }

    /// Extra field writes implied by a field change, applied in the same batch
    pub fn cascade(&self, field: &str, value: &Value) -> Vec<(String, Value)> {
        match (self, field, value.as_str()) {
            (DeviceKind::Lamp, STATUS, Some(OFF)) => vec![(BRIGHTNESS.to_string(), Value::Integer(0))],
            (DeviceKind::Lamp, STATUS, Some(ON)) => {
                vec![(BRIGHTNESS.to_string(), Value::Integer(BRIGHTNESS_ON))]
            }
            _ => Vec::new(),
        }
    }

    /// Scenario ids to raise after fields changed
    pub fn triggers(&self, changed: &[(String, Value)]) -> Vec<u32> {
        match self {
            DeviceKind::SmokeDetector { .. } => changed
                .iter()
                .filter(|(name, value)| name == STATUS && value.as_str() == Some(ON))
                .map(|_| ALARM_SCENARIO)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Kind specific handling, run before the generic suffixes
    ///
    /// Returns a change to apply as if it had arrived on `change`.
    pub fn custom_reaction(&self, suffix: &Suffix, registry: &Registry) -> Option<Change> {
        match (self, suffix) {
            (DeviceKind::Lamp, Suffix::Other(action)) if action == "toggle" => {
                let current = registry.get_field_value(STATUS).ok()?;
                let next = if current.as_str() == Some(ON) { OFF } else { ON };
                Some(Change::new(Namespace::Field, STATUS, next))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Identity;
    use crate::registry::{ConstraintPolicy, FieldSource};

    fn registry_for(kind: &DeviceKind) -> Registry {
        let identity = Identity::new("EF", "1", "1.32", kind.type_name(), "Test").unwrap();
        let mut registry = Registry::new(identity, ConstraintPolicy::Enforce);
        kind.declare(&mut registry).unwrap();
        registry
    }

    #[test]
    fn lamp_defaults() {
        let registry = registry_for(&DeviceKind::Lamp);
        assert_eq!(registry.get_field_value(STATUS).unwrap(), Value::text("ON"));
        assert_eq!(registry.get_field_value(BRIGHTNESS).unwrap(), Value::Integer(200));
        assert_eq!(DeviceKind::Lamp.startup().publishing_mode, PublishingMode::OnDemand);
    }

    #[test]
    fn lamp_cascade() {
        let off = DeviceKind::Lamp.cascade(STATUS, &Value::text("OFF"));
        assert_eq!(off, vec![(BRIGHTNESS.to_string(), Value::Integer(0))]);
        let on = DeviceKind::Lamp.cascade(STATUS, &Value::text("ON"));
        assert_eq!(on, vec![(BRIGHTNESS.to_string(), Value::Integer(200))]);
        assert!(DeviceKind::Lamp.cascade(BRIGHTNESS, &Value::Integer(10)).is_empty());
        assert!(DeviceKind::SystemDataPublisher.cascade(STATUS, &Value::text("OFF")).is_empty());
    }

    #[test]
    fn lamp_toggle_flips_status() {
        let mut registry = registry_for(&DeviceKind::Lamp);
        let toggle = Suffix::Other("toggle".into());

        let change = DeviceKind::Lamp.custom_reaction(&toggle, &registry).unwrap();
        assert_eq!(change.value, "OFF");

        registry.set_field_value(STATUS, "OFF").unwrap();
        let change = DeviceKind::Lamp.custom_reaction(&toggle, &registry).unwrap();
        assert_eq!(change.value, "ON");

        assert!(DeviceKind::Lamp.custom_reaction(&Suffix::Change, &registry).is_none());
    }

    #[test]
    fn smoke_detector_raises_alarm_scenario() {
        let kind = DeviceKind::SmokeDetector { alarm_after: None };
        let registry = registry_for(&kind);
        assert_eq!(registry.get_field_value(STATUS).unwrap(), Value::text("OFF"));

        assert_eq!(kind.triggers(&[(STATUS.into(), Value::text("ON"))]), vec![ALARM_SCENARIO]);
        assert!(kind.triggers(&[(STATUS.into(), Value::text("OFF"))]).is_empty());
        assert!(DeviceKind::Lamp.triggers(&[(STATUS.into(), Value::text("ON"))]).is_empty());
    }

    #[test]
    fn system_data_fields_are_computed() {
        let registry = registry_for(&DeviceKind::SystemDataPublisher);
        for name in [DISK_USAGE, MEMORY_USAGE, CPU_USAGE] {
            assert_eq!(registry.list_fields()[name].source, FieldSource::Computed);
            assert!(matches!(registry.get_field_value(name).unwrap(), Value::Float(_)));
        }
        assert_eq!(
            DeviceKind::SystemDataPublisher.startup().publishing_mode,
            PublishingMode::Continuous
        );
    }
}

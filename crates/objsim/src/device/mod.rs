//! Simulated devices
//!
//! A [`Device`] owns its identity and its registry. Everything it does is a
//! reaction to a message on one of its topics, and every reaction is returned
//! as a list of [`Outgoing`] messages for the runtime to publish. The
//! [`DeviceRuntime`] service wires a device to the bus.

mod kind;
mod runtime;
mod system;

pub use kind::*;
pub use runtime::DeviceRuntime;
pub use system::SystemProbe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::{Identity, Suffix};
use crate::protocol::{Change, Namespace, Outgoing, Request, CONTROL_TOPIC};
use crate::registry::{ConfigParameter, Constraint, ConstraintPolicy, DeviceDescription, Registry};
use crate::store::DocumentStore;
use crate::types::{Error, Result, Value, ValueKind};

pub const PUBLISHING_MODE: &str = "publishing_mode";
pub const PUBLISHING_PERIOD: &str = "publishing_period";
pub const RESPONSE_LATENCY: &str = "response_latency";

/// Whether a device publishes its fields on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishingMode {
    Continuous,
    OnDemand,
}

impl PublishingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishingMode::Continuous => "continuous",
            PublishingMode::OnDemand => "on-demand",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continuous" => Some(PublishingMode::Continuous),
            "on-demand" => Some(PublishingMode::OnDemand),
            _ => None,
        }
    }
}

impl fmt::Display for PublishingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initial values of the base parameters every device has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Startup {
    pub publishing_mode: PublishingMode,
    /// Milliseconds between two continuous publications
    pub publishing_period: i64,
    /// Milliseconds to wait before answering a request
    pub response_latency: i64,
}

impl Default for Startup {
    fn default() -> Self {
        Self {
            publishing_mode: PublishingMode::Continuous,
            publishing_period: 2000,
            response_latency: 0,
        }
    }
}

/// Settings shared by every device of a fleet
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub policy: ConstraintPolicy,
    /// Where scenario triggers are published
    pub control_topic: String,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            policy: ConstraintPolicy::default(),
            control_topic: CONTROL_TOPIC.to_string(),
        }
    }
}

/// What applying a change did
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// A configuration parameter changed
    Config(String),
    /// These fields changed, cascades included, with their new values
    Fields(Vec<(String, Value)>),
}

pub struct Device {
    identity: Identity,
    kind: DeviceKind,
    control_topic: String,
    registry: Mutex<Registry>,
}

fn declare_base_parameters(registry: &mut Registry, startup: Startup) -> Result<()> {
    registry.add_parameter(
        PUBLISHING_MODE,
        ConfigParameter::new(
            "Publishing mode",
            "Whether the device publishes its fields on its own or only when asked",
            ValueKind::String,
            startup.publishing_mode.as_str(),
        )
        .with_constraint(Constraint::one_of([
            PublishingMode::Continuous.as_str(),
            PublishingMode::OnDemand.as_str(),
        ])),
    )?;
    registry.add_parameter(
        PUBLISHING_PERIOD,
        ConfigParameter::new(
            "Publishing period",
            "Milliseconds between two continuous publications",
            ValueKind::Integer,
            startup.publishing_period,
        )
        .with_constraint(Constraint::Positive),
    )?;
    registry.add_parameter(
        RESPONSE_LATENCY,
        ConfigParameter::new(
            "Response latency",
            "Milliseconds to wait before answering a request",
            ValueKind::Integer,
            startup.response_latency,
        )
        .with_constraint(Constraint::Positive),
    )
}

impl Device {
    pub fn new(
        kind: DeviceKind,
        building: &str,
        floor: &str,
        room: &str,
        name: &str,
        options: &DeviceOptions,
    ) -> Result<Self> {
        let identity = Identity::new(building, floor, room, kind.type_name(), name)
            .map_err(|e| Error::InvalidIdentity(e.to_string()))?;

        let mut registry = Registry::new(identity.clone(), options.policy);
        declare_base_parameters(&mut registry, kind.startup())?;
        kind.declare(&mut registry)?;

        Ok(Self {
            identity,
            kind,
            control_topic: options.control_topic.clone(),
            registry: Mutex::new(registry),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Persist the description and keep the store in sync
    pub fn attach(&self, store: Arc<dyn DocumentStore>) -> Result<Uuid> {
        self.registry.lock().attach(store)
    }

    pub fn description(&self) -> DeviceDescription {
        self.registry.lock().description().clone()
    }

    pub fn config_value(&self, name: &str) -> Result<Value> {
        self.registry.lock().get_config_value(name)
    }

    pub fn field_value(&self, name: &str) -> Result<Value> {
        self.registry.lock().get_field_value(name)
    }

    pub fn publishing_mode(&self) -> PublishingMode {
        self.config_value(PUBLISHING_MODE)
            .ok()
            .and_then(|v| v.as_str().and_then(PublishingMode::parse))
            .unwrap_or(PublishingMode::Continuous)
    }

    pub fn publishing_period(&self) -> Duration {
        self.millis(PUBLISHING_PERIOD)
    }

    pub fn response_latency(&self) -> Duration {
        self.millis(RESPONSE_LATENCY)
    }

    fn millis(&self, name: &str) -> Duration {
        let ms = self
            .config_value(name)
            .ok()
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Duration::from_millis(ms.max(0) as u64)
    }

    /// Apply a change, cascades included, under one lock
    pub fn apply_change(&self, change: &Change) -> Result<Applied> {
        let mut registry = self.registry.lock();
        match change.namespace {
            Namespace::Config => {
                registry.set_config_value(&change.key, Value::text(change.value.as_str()))?;
                Ok(Applied::Config(change.key.clone()))
            }
            Namespace::Field => {
                let value = Value::text(change.value.as_str());
                let mut batch = vec![(change.key.clone(), value.clone())];
                batch.extend(self.kind.cascade(&change.key, &value));

                let names: Vec<String> = batch.iter().map(|(name, _)| name.clone()).collect();
                registry.set_field_values(batch)?;

                let changed = names
                    .into_iter()
                    .filter_map(|name| {
                        let value = registry.get_field_value(&name).ok()?;
                        Some((name, value))
                    })
                    .collect();
                Ok(Applied::Fields(changed))
            }
        }
    }

    /// Reply to a request, without the latency wait
    pub fn answer(&self, request: &Request) -> Outgoing {
        let value = {
            let registry = self.registry.lock();
            match request.namespace {
                Namespace::Config => registry.get_config_value(&request.key),
                Namespace::Field => registry.get_field_value(&request.key),
            }
        };

        let payload = match value {
            Ok(value) => value.to_string(),
            Err(_) => request.namespace.not_found_answer().to_string(),
        };
        Outgoing::new(
            self.identity.topic(&Suffix::Answer(request.token.clone())),
            payload,
        )
    }

    /// Metric messages for the given field values
    pub fn metrics(&self, fields: &[(String, Value)]) -> Vec<Outgoing> {
        fields
            .iter()
            .map(|(name, value)| {
                Outgoing::new(
                    self.identity.topic(&Suffix::Metrics(name.clone())),
                    value.to_string(),
                )
            })
            .collect()
    }

    /// Metric messages for every field, read in one critical section
    pub fn snapshot(&self) -> Vec<Outgoing> {
        let values = self.registry.lock().field_values();
        self.metrics(&values)
    }

    /// Messages that follow from a set of changed fields
    pub fn field_effects(&self, changed: &[(String, Value)]) -> Vec<Outgoing> {
        let mut outgoing = self.metrics(changed);
        for scenario in self.kind.triggers(changed) {
            tracing::info!(device = %self.identity, scenario, "Raising scenario");
            outgoing.push(Outgoing::new(self.control_topic.as_str(), scenario.to_string()));
        }
        outgoing
    }

    /// Decode and apply a `change` payload, returning what to publish
    ///
    /// Malformed payloads, unknown keys and rejected values come back as
    /// errors; the caller logs them and carries on.
    pub fn handle_change(&self, topic: &str, payload: &str) -> Result<(Applied, Vec<Outgoing>)> {
        let change = Change::parse(topic, payload)?;
        self.execute(&change)
    }

    /// Apply a change and collect the messages that follow from it
    pub fn execute(&self, change: &Change) -> Result<(Applied, Vec<Outgoing>)> {
        let applied = self.apply_change(change)?;
        let outgoing = match &applied {
            Applied::Config(_) => Vec::new(),
            Applied::Fields(changed) => self.field_effects(changed),
        };
        Ok((applied, outgoing))
    }

    /// Give the kind a chance to react to any message
    pub fn react(&self, suffix: &Suffix) -> Option<Result<(Applied, Vec<Outgoing>)>> {
        let change = {
            let registry = self.registry.lock();
            self.kind.custom_reaction(suffix, &registry)?
        };
        Some(self.execute(&change))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lamp() -> Device {
        Device::new(DeviceKind::Lamp, "EF", "1", "1.32", "Ceiling Lamp 01", &DeviceOptions::default())
            .unwrap()
    }

    fn smoke_detector() -> Device {
        Device::new(
            DeviceKind::SmokeDetector { alarm_after: None },
            "EF",
            "4",
            "4.21",
            "Corridor smoke detector",
            &DeviceOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn identity_takes_type_from_kind() {
        assert_eq!(lamp().identity().object_type(), "Lamp");
        assert_eq!(smoke_detector().identity().object_type(), "Smoke Detector");
    }

    #[test]
    fn invalid_identity_is_rejected() {
        let result = Device::new(DeviceKind::Lamp, "EF", "1", "1/32", "Desk", &DeviceOptions::default());
        assert!(matches!(result, Err(Error::InvalidIdentity(_))));
    }

    #[test]
    fn base_parameters() {
        let lamp = lamp();
        assert_eq!(lamp.publishing_mode(), PublishingMode::OnDemand);
        assert_eq!(lamp.publishing_period(), Duration::from_millis(2000));
        assert_eq!(lamp.response_latency(), Duration::ZERO);
    }

    #[test]
    fn lamp_off_cascades_in_one_write() {
        let store = Arc::new(MemoryStore::new());
        let lamp = lamp();
        let id = lamp.attach(store.clone()).unwrap();
        let writes = store.description_writes();

        let (applied, outgoing) = lamp
            .handle_change("EF/1/1.32/Lamp/All/change", "field,status,OFF")
            .unwrap();

        assert_eq!(
            applied,
            Applied::Fields(vec![
                ("status".into(), Value::text("OFF")),
                ("brightness".into(), Value::Integer(0)),
            ])
        );
        assert_eq!(
            outgoing,
            vec![
                Outgoing::new("EF/1/1.32/Lamp/Ceiling Lamp 01/metrics/status", "OFF"),
                Outgoing::new("EF/1/1.32/Lamp/Ceiling Lamp 01/metrics/brightness", "0"),
            ]
        );
        assert_eq!(store.description_writes(), writes + 1);

        let stored = store.get_description(id).unwrap().unwrap();
        assert_eq!(stored.fields["brightness"].value, Some(Value::Integer(0)));
    }

    #[test]
    fn config_change_is_coerced() {
        let lamp = lamp();
        let (applied, outgoing) = lamp
            .handle_change("All/All/All/All/All/change", "config,publishing_period,500")
            .unwrap();
        assert_eq!(applied, Applied::Config("publishing_period".into()));
        assert!(outgoing.is_empty());
        assert_eq!(lamp.publishing_period(), Duration::from_millis(500));
    }

    #[test]
    fn unknown_keys_do_not_write() {
        let store = Arc::new(MemoryStore::new());
        let lamp = lamp();
        lamp.attach(store.clone()).unwrap();
        let before = lamp.description();

        assert!(matches!(
            lamp.handle_change("t", "config,colour,red"),
            Err(Error::UnknownParameter(_))
        ));
        assert!(matches!(
            lamp.handle_change("t", "field,colour,red"),
            Err(Error::UnknownField(_))
        ));
        assert!(matches!(
            lamp.handle_change("t", "field,status"),
            Err(Error::MalformedMessage { .. })
        ));

        assert_eq!(store.description_writes(), 1);
        assert_eq!(lamp.description(), before);
    }

    #[test]
    fn answers_echo_token() {
        let lamp = lamp();
        let reply = lamp.answer(&Request::new(Namespace::Field, "brightness", "tok-9"));
        assert_eq!(
            reply,
            Outgoing::new("EF/1/1.32/Lamp/Ceiling Lamp 01/answer/tok-9", "200")
        );

        let reply = lamp.answer(&Request::new(Namespace::Config, "colour", "tok-9"));
        assert_eq!(reply.payload, "no such parameter");
        let reply = lamp.answer(&Request::new(Namespace::Field, "colour", "tok-9"));
        assert_eq!(reply.payload, "no such field");
    }

    #[test]
    fn smoke_detector_publishes_trigger() {
        let detector = smoke_detector();
        let (_, outgoing) = detector
            .handle_change("EF/4/4.21/Smoke Detector/Corridor smoke detector/change", "field,status,ON")
            .unwrap();
        assert!(outgoing.contains(&Outgoing::new("Scenario", "2")));
    }

    #[test]
    fn toggle_goes_through_cascade() {
        let lamp = lamp();
        let (_, outgoing) = lamp.react(&Suffix::Other("toggle".into())).unwrap().unwrap();
        assert_eq!(outgoing.len(), 2);
        assert_eq!(lamp.field_value("brightness").unwrap(), Value::Integer(0));
        assert!(lamp.react(&Suffix::Change).is_none());
    }

    #[test]
    fn snapshot_lists_every_field() {
        let topics: Vec<String> = lamp().snapshot().into_iter().map(|o| o.topic).collect();
        assert_eq!(
            topics,
            vec![
                "EF/1/1.32/Lamp/Ceiling Lamp 01/metrics/brightness",
                "EF/1/1.32/Lamp/Ceiling Lamp 01/metrics/status",
            ]
        );
    }
}

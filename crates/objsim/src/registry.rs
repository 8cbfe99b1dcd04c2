//! Field and configuration registry
//!
//! Every device keeps two tables: configuration parameters, which steer how
//! the device behaves, and fields, which are what it measures or exposes.
//! Fields are either stored (held until someone sets them) or computed (read
//! through an accessor each time). Once attached to a [`DocumentStore`] the
//! registry writes the whole description back after every mutation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Identity;
use crate::store::DocumentStore;
use crate::types::{Error, Result, Value, ValueKind};

/// Allowed values of a configuration parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    OneOf(Vec<String>),
    /// A number greater than or equal to zero
    Positive,
}

impl Constraint {
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Constraint::OneOf(values.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, value: &Value) -> bool {
        match self {
            Constraint::OneOf(allowed) => {
                let text = value.to_string();
                allowed.iter().any(|a| *a == text)
            }
            Constraint::Positive => value.as_f64().is_some_and(|n| n >= 0.0),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::OneOf(allowed) => write!(f, "one of {}", allowed.join(", ")),
            Constraint::Positive => write!(f, "positive"),
        }
    }
}

/// What happens when a value falls outside a parameter's constraint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintPolicy {
    /// Reject the value
    #[default]
    Enforce,
    /// Store it anyway and log a warning
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigParameter {
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_values: Option<Constraint>,
    pub value: Value,
}

impl ConfigParameter {
    pub fn new(
        label: impl Into<String>,
        description: impl Into<String>,
        kind: ValueKind,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
            kind,
            possible_values: None,
            value: value.into(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.possible_values = Some(constraint);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSource {
    Computed,
    Stored,
}

/// Descriptive part of a field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub label: String,
    pub description: String,
    pub kind: ValueKind,
}

impl FieldMeta {
    pub fn new(label: impl Into<String>, description: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
            kind,
        }
    }
}

/// A field as it appears in the persisted description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    pub source: FieldSource,
    /// Current value of a stored field; computed fields have none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Reads a computed field
pub type Accessor = Arc<dyn Fn() -> Value + Send + Sync>;

/// Everything known about one device, as written to the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub identity: Identity,
    pub config: BTreeMap<String, ConfigParameter>,
    pub fields: BTreeMap<String, FieldEntry>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl DeviceDescription {
    pub fn new(identity: Identity) -> Self {
        let now = Utc::now();
        Self {
            identity,
            config: BTreeMap::new(),
            fields: BTreeMap::new(),
            created: now,
            last_modified: now,
        }
    }
}

struct Sink {
    store: Arc<dyn DocumentStore>,
    id: Uuid,
}

pub struct Registry {
    description: DeviceDescription,
    accessors: HashMap<String, Accessor>,
    policy: ConstraintPolicy,
    sink: Option<Sink>,
}

impl Registry {
    pub fn new(identity: Identity, policy: ConstraintPolicy) -> Self {
        Self {
            description: DeviceDescription::new(identity),
            accessors: HashMap::new(),
            policy,
            sink: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.description.identity
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    /// Document id once attached
    pub fn document_id(&self) -> Option<Uuid> {
        self.sink.as_ref().map(|s| s.id)
    }

    /// Persist the description and keep it in sync from now on
    pub fn attach(&mut self, store: Arc<dyn DocumentStore>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        store.insert_description(id, &self.description)?;
        self.sink = Some(Sink { store, id });
        Ok(id)
    }

    fn touch(&mut self) -> Result<()> {
        self.description.last_modified = Utc::now();
        if let Some(sink) = &self.sink {
            sink.store.update_description(sink.id, &self.description)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_parameter(&mut self, name: impl Into<String>, parameter: ConfigParameter) -> Result<()> {
        self.description.config.insert(name.into(), parameter);
        self.touch()
    }

    pub fn list_config_parameters(&self) -> &BTreeMap<String, ConfigParameter> {
        &self.description.config
    }

    pub fn get_config_value(&self, name: &str) -> Result<Value> {
        self.description
            .config
            .get(name)
            .map(|p| p.value.clone())
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// Set a parameter, coercing to its declared kind
    pub fn set_config_value(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let policy = self.policy;
        let parameter = self
            .description
            .config
            .get_mut(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;

        let value = value
            .into()
            .coerce(parameter.kind)
            .map_err(|reason| Error::InvalidValue {
                name: name.to_string(),
                reason,
            })?;

        if let Some(constraint) = &parameter.possible_values {
            if !constraint.allows(&value) {
                match policy {
                    ConstraintPolicy::Enforce => {
                        return Err(Error::ConstraintViolation {
                            name: name.to_string(),
                            value: value.to_string(),
                            allowed: constraint.to_string(),
                        });
                    }
                    ConstraintPolicy::Advisory => {
                        tracing::warn!(
                            parameter = name,
                            %value,
                            allowed = %constraint,
                            "Storing value outside allowed set"
                        );
                    }
                }
            }
        }

        parameter.value = value;
        self.touch()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fields
    // ─────────────────────────────────────────────────────────────────────

    /// Declare a field; with an accessor it is computed, otherwise stored
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        meta: FieldMeta,
        accessor: Option<Accessor>,
    ) -> Result<()> {
        let name = name.into();
        let source = if accessor.is_some() {
            FieldSource::Computed
        } else {
            FieldSource::Stored
        };

        match accessor {
            Some(accessor) => {
                self.accessors.insert(name.clone(), accessor);
            }
            None => {
                self.accessors.remove(&name);
            }
        }

        self.description.fields.insert(
            name,
            FieldEntry {
                label: meta.label,
                description: meta.description,
                kind: meta.kind,
                source,
                value: (source == FieldSource::Stored).then_some(Value::Empty),
            },
        );
        self.touch()
    }

    pub fn list_fields(&self) -> &BTreeMap<String, FieldEntry> {
        &self.description.fields
    }

    pub fn get_field_value(&self, name: &str) -> Result<Value> {
        let entry = self
            .description
            .fields
            .get(name)
            .ok_or_else(|| Error::UnknownField(name.to_string()))?;

        match entry.source {
            FieldSource::Computed => Ok(self
                .accessors
                .get(name)
                .map(|read| read())
                .unwrap_or(Value::Empty)),
            FieldSource::Stored => Ok(entry.value.clone().unwrap_or(Value::Empty)),
        }
    }

    /// Current value of every field, in name order
    pub fn field_values(&self) -> Vec<(String, Value)> {
        self.description
            .fields
            .keys()
            .filter_map(|name| {
                self.get_field_value(name)
                    .ok()
                    .map(|value| (name.clone(), value))
            })
            .collect()
    }

    pub fn set_field_value(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_field_values(vec![(name.to_string(), value.into())])
    }

    /// Set several stored fields as one mutation
    ///
    /// Every entry is checked before any is written, so either the whole
    /// batch lands (with one timestamp update and one persistence write) or
    /// nothing changes.
    pub fn set_field_values(&mut self, batch: Vec<(String, Value)>) -> Result<()> {
        let mut checked = Vec::with_capacity(batch.len());
        for (name, value) in batch {
            let entry = self
                .description
                .fields
                .get(&name)
                .ok_or_else(|| Error::UnknownField(name.clone()))?;
            if entry.source == FieldSource::Computed {
                return Err(Error::ComputedField(name));
            }
            let value = value
                .coerce(entry.kind)
                .map_err(|reason| Error::InvalidValue {
                    name: name.clone(),
                    reason,
                })?;
            checked.push((name, value));
        }

        if checked.is_empty() {
            return Ok(());
        }

        for (name, value) in checked {
            if let Some(entry) = self.description.fields.get_mut(&name) {
                entry.value = Some(value);
            }
        }
        self.touch()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("identity", &self.description.identity)
            .field("policy", &self.policy)
            .field("document_id", &self.document_id())
            .finish_non_exhaustive()
    }
}

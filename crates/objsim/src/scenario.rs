//! Scenario records
//!
//! A scenario is authored out of band and stored in the document store. The
//! dispatcher only ever reads it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::address::TargetPattern;

/// Ordered key → value patch, kept in document order
pub type Patch = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub scenario_id: u32,
    pub scenario_name: String,
    #[serde(default)]
    pub configs: Vec<ScenarioEntry>,
}

/// Target group plus the changes to send it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScenarioEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<TargetPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Patch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Patch>,
}

/// Wire text of a patch value; only scalars can be sent
///
/// Booleans go out capitalised (`True`/`False`), the spelling existing
/// devices on the bus compare against.
pub fn patch_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(true) => Some("True".to_string()),
        serde_json::Value::Bool(false) => Some("False".to_string()),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioFileError {
    #[error("Failed to read scenario file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse scenario file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Read a JSON array of scenario records
pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<Scenario>, ScenarioFileError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// The scenarios every fresh installation starts with
pub fn builtin_scenarios() -> Vec<Scenario> {
    let records = json!([
        {
            "scenario_id": 1,
            "scenario_name": "shutdown",
            "configs": [
                {
                    "targets": {"building": "All", "floor": "All", "room": "All", "type": "All", "name": "All"},
                    "config": {"publishing_mode": "on-demand", "response_latency": 0}
                },
                {
                    "targets": {"building": "All", "floor": "All", "room": "All", "type": "Lamp", "name": "All"},
                    "fields": {"status": "OFF", "brightness": 0}
                },
                {
                    "targets": {"building": "All", "floor": "All", "room": "All", "type": "SystemData Publisher", "name": "All"},
                    "fields": {"status": "OFF"}
                }
            ]
        },
        {
            "scenario_id": 2,
            "scenario_name": "christmas",
            "configs": [
                {
                    "targets": {"building": "All", "floor": "All", "room": "All", "type": "Lamp", "name": "All"},
                    "fields": {"status": "ON", "brightness": 255}
                }
            ]
        },
        {
            "scenario_id": 3,
            "scenario_name": "evacuation",
            "configs": [
                {
                    "targets": {"building": "EF", "floor": "All", "room": "All", "type": "Door", "name": "All"},
                    "fields": {"status": "Open"}
                },
                {
                    "targets": {"building": "EF", "floor": "All", "room": "All", "type": "Ringer", "name": "All"},
                    "fields": {"status": "ON"}
                }
            ]
        },
        {
            "scenario_id": 4,
            "scenario_name": "verbose",
            "configs": [
                {
                    "targets": {"building": "All", "floor": "All", "room": "All", "type": "All", "name": "All"},
                    "config": {"publishing_mode": "continuous", "publishing_period": 1000}
                }
            ]
        }
    ]);

    serde_json::from_value(records).unwrap_or_default()
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::AddressError;
use crate::scenario::ScenarioFileError;
use crate::store::StoreError;
use objsim_runtime::ServiceError;

/// Text rendered for a stored field that was never set
pub const NO_VALUE: &str = "No value";

/// Declared type of a config parameter or field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    String,
    Integer,
    Float,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::String => write!(f, "String"),
            ValueKind::Integer => write!(f, "Integer"),
            ValueKind::Float => write!(f, "Float"),
        }
    }
}

/// A config parameter or field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    /// Stored field that has never been set
    Empty,
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Empty => None,
        }
    }

    /// Convert to the declared kind, parsing text when needed
    pub fn coerce(self, kind: ValueKind) -> std::result::Result<Value, String> {
        match (kind, self) {
            (_, Value::Empty) => Ok(Value::Empty),
            (ValueKind::String, Value::Text(s)) => Ok(Value::Text(s)),
            (ValueKind::String, other) => Ok(Value::Text(other.to_string())),
            (ValueKind::Integer, v) => v
                .as_i64()
                .map(Value::Integer)
                .ok_or_else(|| format!("{v} is not an integer")),
            (ValueKind::Float, v) => v
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| format!("{v} is not a number")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Empty => write!(f, "{NO_VALUE}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed message on {topic}: {reason}")]
    MalformedMessage { topic: String, reason: String },

    #[error("Unknown configuration parameter: {0}")]
    UnknownParameter(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field {0} is computed and cannot be set")]
    ComputedField(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Value {value} not allowed for {name} ({allowed})")]
    ConstraintViolation {
        name: String,
        value: String,
        allowed: String,
    },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Scenario {0} not found")]
    ScenarioNotFound(u32),

    #[error("Bus transport disconnected")]
    TransportDisconnected,

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    ScenarioFile(#[from] ScenarioFileError),

    #[error("Service error: {0}")]
    Service(ServiceError),
}

impl Error {
    pub fn malformed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedMessage {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Disconnected => Error::TransportDisconnected,
            other => Error::Service(other),
        }
    }
}

//! Payload grammar for `change` and `request` messages
//!
//! Both carry exactly three comma separated parts: `<config|field>,<key>,<value|token>`.
//! There is no escaping, so values containing a comma cannot be sent.

use std::fmt;

use crate::types::{Error, Result};

/// Topic on which scenario triggers are published
pub const CONTROL_TOPIC: &str = "Scenario";

/// Answer to a request for an unknown config parameter
pub const NO_SUCH_PARAMETER: &str = "no such parameter";

/// Answer to a request for an unknown field
pub const NO_SUCH_FIELD: &str = "no such field";

/// Which table of the registry a message addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Config,
    Field,
}

impl Namespace {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config" => Some(Namespace::Config),
            // "measure" is what the first generation of objects sent
            "field" | "measure" => Some(Namespace::Field),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Config => "config",
            Namespace::Field => "field",
        }
    }

    /// Literal reply for a key that does not exist in this namespace
    pub fn not_found_answer(&self) -> &'static str {
        match self {
            Namespace::Config => NO_SUCH_PARAMETER,
            Namespace::Field => NO_SUCH_FIELD,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic and payload ready to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub topic: String,
    pub payload: String,
}

impl Outgoing {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

fn split_triplet<'a>(topic: &str, payload: &'a str) -> Result<(Namespace, &'a str, &'a str)> {
    let parts: Vec<&str> = payload.split(',').collect();
    let &[namespace, key, last] = parts.as_slice() else {
        return Err(Error::malformed(
            topic,
            format!("expected 3 comma separated parts, got {}", parts.len()),
        ));
    };

    let namespace = Namespace::parse(namespace.trim())
        .ok_or_else(|| Error::malformed(topic, format!("unknown namespace {namespace:?}")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::malformed(topic, "empty key"));
    }

    Ok((namespace, key, last))
}

fn check_part(name: &str, part: &str) -> Result<()> {
    if part.contains(',') {
        return Err(Error::InvalidValue {
            name: name.to_string(),
            reason: format!("{part:?} contains a comma"),
        });
    }
    Ok(())
}

/// `change` payload: set `key` in `namespace` to `value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub namespace: Namespace,
    pub key: String,
    pub value: String,
}

impl Change {
    pub fn new(namespace: Namespace, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            namespace,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Decode a payload received on `topic`
    pub fn parse(topic: &str, payload: &str) -> Result<Self> {
        let (namespace, key, value) = split_triplet(topic, payload)?;
        Ok(Self::new(namespace, key, value))
    }

    /// Encode for the wire, refusing parts that would break the grammar
    pub fn encode(&self) -> Result<String> {
        check_part("key", &self.key)?;
        check_part(&self.key, &self.value)?;
        Ok(format!("{},{},{}", self.namespace, self.key, self.value))
    }
}

/// `request` payload: answer the value of `key` on `answer/<token>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub namespace: Namespace,
    pub key: String,
    pub token: String,
}

impl Request {
    pub fn new(namespace: Namespace, key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            namespace,
            key: key.into(),
            token: token.into(),
        }
    }

    pub fn parse(topic: &str, payload: &str) -> Result<Self> {
        let (namespace, key, token) = split_triplet(topic, payload)?;
        let token = token.trim();
        if token.is_empty() || token.contains(['/', '+', '#']) {
            return Err(Error::malformed(topic, format!("unusable token {token:?}")));
        }
        Ok(Self::new(namespace, key, token))
    }

    pub fn encode(&self) -> Result<String> {
        check_part("key", &self.key)?;
        check_part("token", &self.token)?;
        Ok(format!("{},{},{}", self.namespace, self.key, self.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "EF/1/1.32/Lamp/Desk/change";

    #[test]
    fn parse_change() {
        let change = Change::parse(TOPIC, "config,publishing_mode,on-demand").unwrap();
        assert_eq!(change.namespace, Namespace::Config);
        assert_eq!(change.key, "publishing_mode");
        assert_eq!(change.value, "on-demand");
    }

    #[test]
    fn wrong_arity_is_malformed() {
        for payload in ["config,publishing_mode", "field,status,ON,extra", "", "status=ON"] {
            assert!(
                matches!(Change::parse(TOPIC, payload), Err(Error::MalformedMessage { .. })),
                "{payload:?} should be rejected"
            );
        }
    }

    #[test]
    fn unknown_namespace_is_malformed() {
        assert!(matches!(
            Change::parse(TOPIC, "metric,status,ON"),
            Err(Error::MalformedMessage { .. })
        ));
    }

    #[test]
    fn request_accepts_legacy_namespace() {
        let request = Request::parse(TOPIC, "measure,cpu_usage,client-7").unwrap();
        assert_eq!(request.namespace, Namespace::Field);
        assert_eq!(request.token, "client-7");
    }

    #[test]
    fn request_token_cannot_break_reply_topic() {
        assert!(Request::parse(TOPIC, "field,status,a/b").is_err());
        assert!(Request::parse(TOPIC, "field,status, ").is_err());
    }

    #[test]
    fn encode_refuses_commas() {
        let change = Change::new(Namespace::Field, "status", "ON,OFF");
        assert!(matches!(change.encode(), Err(Error::InvalidValue { .. })));

        let change = Change::new(Namespace::Field, "brightness", "255");
        assert_eq!(change.encode().unwrap(), "field,brightness,255");
    }

    #[test]
    fn not_found_answers() {
        assert_eq!(Namespace::Config.not_found_answer(), "no such parameter");
        assert_eq!(Namespace::Field.not_found_answer(), "no such field");
    }
}

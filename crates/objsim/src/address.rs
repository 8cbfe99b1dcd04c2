//! Topic addressing
//!
//! A device lives at `building/floor/room/type/name`. It subscribes to its own
//! address and to every group address it belongs to; a publisher reaches a
//! group by putting [`WILDCARD`] in the levels it does not care about. Both
//! directions are built here from the same constant so they cannot drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};

use objsim_runtime::SINGLE_LEVEL;

/// Group token used in addresses, on both the publishing and subscribing side
pub const WILDCARD: &str = "All";

/// Errors raised while building or parsing topics
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Empty {0} component")]
    EmptyComponent(&'static str),

    #[error("{level} component {value:?} contains a reserved character")]
    ReservedCharacter { level: &'static str, value: String },

    #[error("{0} component cannot be the group token \"All\"")]
    WildcardComponent(&'static str),

    #[error("Target {0} reaches no device: no subscription uses this wildcard shape")]
    Unroutable(String),

    #[error("Topic {0:?} does not have an address and a suffix")]
    ShortTopic(String),
}

const LEVELS: [&str; 5] = ["building", "floor", "room", "type", "name"];

fn check_component(level: &'static str, value: &str) -> Result<(), AddressError> {
    if value.is_empty() {
        return Err(AddressError::EmptyComponent(level));
    }
    if value.contains(['/', '+', '#']) {
        return Err(AddressError::ReservedCharacter {
            level,
            value: value.to_string(),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Permanent address of one device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    building: String,
    floor: String,
    room: String,
    #[serde(rename = "type")]
    object_type: String,
    name: String,
}

impl Identity {
    pub fn new(
        building: impl Into<String>,
        floor: impl Into<String>,
        room: impl Into<String>,
        object_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, AddressError> {
        let identity = Self {
            building: building.into(),
            floor: floor.into(),
            room: room.into(),
            object_type: object_type.into(),
            name: name.into(),
        };

        for (&level, value) in LEVELS.iter().zip(identity.components()) {
            check_component(level, value)?;
            if value == WILDCARD {
                return Err(AddressError::WildcardComponent(level));
            }
        }

        Ok(identity)
    }

    pub fn building(&self) -> &str {
        &self.building
    }

    pub fn floor(&self) -> &str {
        &self.floor
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> [&str; 5] {
        [
            &self.building,
            &self.floor,
            &self.room,
            &self.object_type,
            &self.name,
        ]
    }

    /// `building/floor/room/type/name`
    pub fn base_topic(&self) -> String {
        self.components().join("/")
    }

    /// Topic for one of this device's own suffixes
    pub fn topic(&self, suffix: &Suffix) -> String {
        format!("{}/{}", self.base_topic(), suffix)
    }

    /// The exact target pattern of this device
    pub fn as_target(&self) -> TargetPattern {
        TargetPattern {
            building: Segment::Literal(self.building.clone()),
            floor: Segment::Literal(self.floor.clone()),
            room: Segment::Literal(self.room.clone()),
            object_type: Segment::Literal(self.object_type.clone()),
            name: Segment::Literal(self.name.clone()),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_topic())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Target pattern
// ─────────────────────────────────────────────────────────────────────────────

/// One level of a target pattern: a literal value or the group token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Segment {
    Literal(String),
    Any,
}

impl Segment {
    pub fn is_any(&self) -> bool {
        matches!(self, Segment::Any)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Segment::Literal(s) => s,
            Segment::Any => WILDCARD,
        }
    }

    /// Whether a concrete component falls under this segment
    pub fn covers(&self, value: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Literal(s) => s == value,
        }
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        if s == WILDCARD {
            Segment::Any
        } else {
            Segment::Literal(s)
        }
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::from(s.to_string())
    }
}

impl From<Segment> for String {
    fn from(segment: Segment) -> Self {
        segment.as_str().to_string()
    }
}

/// Group of devices addressed by a scenario entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetPattern {
    pub building: Segment,
    pub floor: Segment,
    pub room: Segment,
    #[serde(rename = "type")]
    pub object_type: Segment,
    pub name: Segment,
}

impl TargetPattern {
    pub fn new(
        building: impl Into<Segment>,
        floor: impl Into<Segment>,
        room: impl Into<Segment>,
        object_type: impl Into<Segment>,
        name: impl Into<Segment>,
    ) -> Self {
        Self {
            building: building.into(),
            floor: floor.into(),
            room: room.into(),
            object_type: object_type.into(),
            name: name.into(),
        }
    }

    /// Every device, whatever its address
    pub fn everything() -> Self {
        Self::new(Segment::Any, Segment::Any, Segment::Any, Segment::Any, Segment::Any)
    }

    /// Every device of one type, site wide
    pub fn of_type(object_type: impl Into<String>) -> Self {
        Self::new(
            Segment::Any,
            Segment::Any,
            Segment::Any,
            Segment::Literal(object_type.into()),
            Segment::Any,
        )
    }

    pub fn segments(&self) -> [&Segment; 5] {
        [
            &self.building,
            &self.floor,
            &self.room,
            &self.object_type,
            &self.name,
        ]
    }

    /// Whether an identity belongs to this group, ignoring routability
    pub fn covers(&self, identity: &Identity) -> bool {
        self.segments()
            .iter()
            .zip(identity.components())
            .all(|(segment, value)| segment.covers(value))
    }

    /// Whether some device could have subscribed to this wildcard shape
    ///
    /// Location levels may only be wildcarded from the room upwards (a literal
    /// room under a wildcard floor is never subscribed to), and a literal name
    /// only appears in the exact address.
    pub fn is_routable(&self) -> bool {
        let location = [&self.building, &self.floor, &self.room];
        let literal_prefix = location.iter().take_while(|s| !s.is_any()).count();
        if location[literal_prefix..].iter().any(|s| !s.is_any()) {
            return false;
        }
        if self.name.is_any() {
            return true;
        }
        literal_prefix == 3 && !self.object_type.is_any()
    }
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.segments().iter().map(|s| s.as_str()).collect();
        write!(f, "{}", parts.join("/"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Suffixes and parsing
// ─────────────────────────────────────────────────────────────────────────────

/// What follows the five address levels of a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suffix {
    Change,
    Request,
    Answer(String),
    Metrics(String),
    Other(String),
}

impl Suffix {
    pub fn parse(rest: &str) -> Self {
        match rest.split_once('/') {
            None if rest == "change" => Suffix::Change,
            None if rest == "request" => Suffix::Request,
            Some(("answer", token)) => Suffix::Answer(token.to_string()),
            Some(("metrics", field)) => Suffix::Metrics(field.to_string()),
            _ => Suffix::Other(rest.to_string()),
        }
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suffix::Change => write!(f, "change"),
            Suffix::Request => write!(f, "request"),
            Suffix::Answer(token) => write!(f, "answer/{token}"),
            Suffix::Metrics(field) => write!(f, "metrics/{field}"),
            Suffix::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A topic split into its address levels and suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub address: [String; 5],
    pub suffix: Suffix,
}

impl ParsedTopic {
    pub fn building(&self) -> &str {
        &self.address[0]
    }

    pub fn floor(&self) -> &str {
        &self.address[1]
    }

    pub fn room(&self) -> &str {
        &self.address[2]
    }

    pub fn object_type(&self) -> &str {
        &self.address[3]
    }

    pub fn name(&self) -> &str {
        &self.address[4]
    }
}

pub fn parse_topic(topic: &str) -> Result<ParsedTopic, AddressError> {
    let mut levels = topic.splitn(6, '/');
    let mut address: [String; 5] = Default::default();
    for slot in address.iter_mut() {
        *slot = levels
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AddressError::ShortTopic(topic.to_string()))?
            .to_string();
    }
    let rest = levels
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AddressError::ShortTopic(topic.to_string()))?;

    Ok(ParsedTopic {
        address,
        suffix: Suffix::parse(rest),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Topic filters a device subscribes to, most specific first
///
/// Nine group levels: the device itself, its type in its room, its room,
/// its type on its floor, its floor, its type in its building, its
/// building, its type site wide, everything.
pub fn subscription_patterns(identity: &Identity) -> Vec<String> {
    let [building, floor, room, object_type, _] = identity.components();
    let location = [building, floor, room];

    let mut patterns = vec![format!("{}/{}", identity.base_topic(), SINGLE_LEVEL)];
    for literal_levels in (0..=location.len()).rev() {
        for type_level in [object_type, WILDCARD] {
            let mut levels: Vec<&str> = location[..literal_levels].to_vec();
            levels.resize(location.len(), WILDCARD);
            levels.push(type_level);
            levels.push(WILDCARD);
            levels.push(SINGLE_LEVEL);
            patterns.push(levels.join("/"));
        }
    }

    patterns
}

/// Address a publisher must use to reach every device covered by `pattern`
pub fn target_topic(pattern: &TargetPattern) -> Result<String, AddressError> {
    for (&level, segment) in LEVELS.iter().zip(pattern.segments()) {
        if let Segment::Literal(value) = segment {
            check_component(level, value)?;
        }
    }
    if !pattern.is_routable() {
        return Err(AddressError::Unroutable(pattern.to_string()));
    }
    Ok(pattern.to_string())
}

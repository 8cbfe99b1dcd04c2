//! Bus Messages
//!
//! Messages are the only thing services exchange: a `/`-delimited topic and a
//! UTF-8 text payload.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{ServiceError, ServiceResult};

/// Single-level wildcard in a topic filter
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard, only valid as the last segment of a filter
pub const MULTI_LEVEL: &str = "#";

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// A message published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message was published to (never contains wildcards)
    pub topic: String,

    /// Text payload
    pub payload: String,

    /// Service or client that published the message
    pub source: String,

    /// Timestamp when the message was created (Unix milliseconds)
    pub timestamp: u64,
}

impl Message {
    /// Create a new message
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            source: source.into(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Check if this message matches a topic filter
    pub fn matches(&self, filter: &str) -> bool {
        topic_matches(filter, &self.topic)
    }
}

/// Check if a topic matches a filter (MQTT semantics)
///
/// Examples:
///   topic: "EF/1/1.32/Lamp/Desk/change"
///   filter: "EF/1/1.32/Lamp/Desk/+"  -> matches (+ is exactly one level)
///   filter: "EF/#"                   -> matches (# is every remaining level)
///   filter: "EF/1/1.32/Lamp/+"       -> no match (one level short)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');

    for level in filter.split('/') {
        if level == MULTI_LEVEL {
            return true;
        }
        match topic_levels.next() {
            Some(_) if level == SINGLE_LEVEL => {}
            Some(t) if t == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

/// Check that a filter only uses wildcards where the bus understands them
pub fn validate_filter(filter: &str) -> ServiceResult<()> {
    if filter.is_empty() {
        return Err(ServiceError::InvalidFilter(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let is_last = i + 1 == levels.len();
        let bad_multi = level.contains('#') && (*level != MULTI_LEVEL || !is_last);
        let bad_single = level.contains('+') && *level != SINGLE_LEVEL;
        if bad_multi || bad_single {
            return Err(ServiceError::InvalidFilter(filter.to_string()));
        }
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────────────────────

/// Routing table shared by the manager and every publisher
///
/// Each subscriber has its own inbox and only matching messages are queued in
/// it, so a subscriber that is busy falls behind on its own traffic alone.
pub(crate) struct Bus {
    routes: DashMap<u64, Route>,
    next_route: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

struct Route {
    owner: String,
    filters: Vec<String>,
    inbox: mpsc::Sender<Message>,
}

impl Bus {
    /// `capacity` bounds each subscriber's inbox
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            routes: DashMap::new(),
            next_route: AtomicU64::new(0),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn attach(self: &Arc<Self>, owner: impl Into<String>, filters: Vec<String>) -> Subscription {
        let (inbox, rx) = mpsc::channel(self.capacity);
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        self.routes.insert(
            id,
            Route {
                owner: owner.into(),
                filters: filters.clone(),
                inbox,
            },
        );
        Subscription {
            id,
            rx,
            filters,
            bus: Arc::downgrade(self),
        }
    }

    fn detach(&self, id: u64) {
        self.routes.remove(&id);
    }

    fn route(&self, message: &Message) {
        let mut gone = Vec::new();
        for route in self.routes.iter() {
            if !route.filters.iter().any(|f| message.matches(f)) {
                continue;
            }
            match route.inbox.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = %route.owner,
                        topic = %message.topic,
                        "Subscriber inbox full, message dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => gone.push(*route.key()),
            }
        }
        for id in gone {
            self.routes.remove(&id);
        }
    }

    /// Refuse further publishing and end every subscription
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.routes.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// A handle for publishing on the bus
#[derive(Clone)]
pub struct BusPublisher {
    bus: Arc<Bus>,
}

impl BusPublisher {
    pub(crate) fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    /// Publish a message
    ///
    /// Nobody listening is not an error; a bus that has been shut down is.
    pub fn publish(&self, message: Message) -> ServiceResult<()> {
        if self.bus.is_closed() {
            return Err(ServiceError::Disconnected);
        }
        if message.topic.contains(['+', '#']) {
            return Err(ServiceError::InvalidFilter(message.topic));
        }

        tracing::trace!(topic = %message.topic, payload = %message.payload, "publish");
        self.bus.route(&message);
        Ok(())
    }

    /// Create and publish a message
    pub fn emit(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
        source: impl Into<String>,
    ) -> ServiceResult<()> {
        self.publish(Message::new(topic, payload, source))
    }

    /// Whether the bus has been shut down
    pub fn is_closed(&self) -> bool {
        self.bus.is_closed()
    }
}

impl std::fmt::Debug for BusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPublisher")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription
// ─────────────────────────────────────────────────────────────────────────────

/// An inbox receiving every message that matches its filters
///
/// Dropping it removes the route.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Message>,
    filters: Vec<String>,
    bus: Weak<Bus>,
}

impl Subscription {
    /// Filters this subscription listens to
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Wait for the next matching message; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Return a matching message if one is already queued
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.detach(self.id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

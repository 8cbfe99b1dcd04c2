//! Services on the bus
//!
//! A service is a long-lived bus client with its own task: a simulated
//! device, the scenario dispatcher, the metrics recorder. The manager feeds it
//! the messages matching its filters one at a time, so a service never
//! handles two messages concurrently.
//!
//! Hooks, in order: `on_start` once, then `on_message` and `on_tick` as
//! traffic and the timer dictate, then `on_stop` once.

mod handle;
mod manager;
mod message;

pub use handle::{Mailbox, ServiceHandle, ServiceState};
pub use manager::*;
pub use message::*;

pub(crate) use handle::Command;

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Invalid topic filter: {0}")]
    InvalidFilter(String),

    #[error("Bus disconnected")]
    Disconnected,

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Service {0} panicked")]
    Panicked(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// What the manager needs to know to run a service
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique on the manager
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Topic filters, e.g. `Scenario` or `EF/1/All/Lamp/All/+`
    pub subscriptions: Vec<String>,
    pub tick_interval: Option<Duration>,
    /// How long `on_stop` may take
    pub shutdown_timeout: Duration,
}

impl ServiceSpec {
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            subscriptions: Vec::new(),
            tick_interval: None,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replace all topic filters
    pub fn with_subscriptions(mut self, subscriptions: Vec<String>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn subscribe(mut self, filter: impl Into<String>) -> Self {
        self.subscriptions.push(filter.into());
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Whether a published message is meant for this service
    pub fn wants(&self, message: &Message) -> bool {
        self.subscriptions.iter().any(|filter| message.matches(filter))
    }
}

/// Passed to every hook
pub struct ServiceContext {
    pub service_id: String,
    publisher: BusPublisher,
    mailbox: Mailbox,
}

impl ServiceContext {
    pub(crate) fn new(service_id: String, publisher: BusPublisher, mailbox: Mailbox) -> Self {
        Self {
            service_id,
            publisher,
            mailbox,
        }
    }

    /// Publish with this service as the source
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<String>) -> ServiceResult<()> {
        self.publisher
            .publish(Message::new(topic, payload, self.service_id.as_str()))
    }

    /// Publisher for background tasks the service spawns
    pub fn publisher(&self) -> BusPublisher {
        self.publisher.clone()
    }

    /// Lets background tasks hand messages to this service's own loop
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }
}

#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn spec(&self) -> ServiceSpec;

    /// An error here marks the service failed and it never sees a message
    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Runs even when the loop ended because the bus closed
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Errors are logged; the service keeps running
    async fn on_message(&mut self, _ctx: &ServiceContext, _message: Message) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder() {
        let spec = ServiceSpec::new("dispatcher", "Scenario Dispatcher")
            .with_tick_interval(Duration::from_secs(1))
            .subscribe("Scenario")
            .subscribe("EF/1/All/Lamp/All/+");

        assert_eq!(spec.tick_interval, Some(Duration::from_secs(1)));
        assert_eq!(spec.subscriptions, vec!["Scenario", "EF/1/All/Lamp/All/+"]);
        assert_eq!(spec.shutdown_timeout, ServiceSpec::DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn spec_wants_matching_messages() {
        let spec = ServiceSpec::new("lamp", "Lamp").with_subscriptions(vec![
            "EF/1/1.32/Lamp/Desk/+".into(),
            "All/All/All/Lamp/All/+".into(),
        ]);

        assert!(spec.wants(&Message::new("EF/1/1.32/Lamp/Desk/change", "", "t")));
        assert!(spec.wants(&Message::new("All/All/All/Lamp/All/request", "", "t")));
        assert!(!spec.wants(&Message::new("EF/1/1.32/Lamp/Desk/metrics/status", "", "t")));
        assert!(!spec.wants(&Message::new("Scenario", "1", "t")));
    }
}

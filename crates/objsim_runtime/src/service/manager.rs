//! Service Manager
//!
//! Owns the bus and every service on it. Each service gets a task, a command
//! channel and an inbox on the bus that only queues messages matching its
//! subscriptions; the task calls the hooks in order.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use super::message::Bus;
use super::{
    validate_filter, BusPublisher, Command, Message, Service, ServiceContext, ServiceError,
    ServiceHandle, ServiceResult, ServiceSpec, ServiceState, Subscription,
};

/// Default number of matching messages a subscriber may have queued
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

const COMMAND_CAPACITY: usize = 64;

/// Grace period on top of a service's own `on_stop` timeout
const JOIN_GRACE: Duration = Duration::from_secs(1);

struct Registered {
    handle: ServiceHandle,
    task: JoinHandle<()>,
    shutdown_timeout: Duration,
}

pub struct ServiceManager {
    services: DashMap<String, Registered>,
    bus: Arc<Bus>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// A manager whose bus queues up to `capacity` messages per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            services: DashMap::new(),
            bus: Arc::new(Bus::new(capacity)),
        }
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher::new(Arc::clone(&self.bus))
    }

    /// Subscribe a plain bus client to a set of topic filters
    ///
    /// Only messages published after this call are received.
    pub fn subscribe<I, S>(&self, filters: I) -> ServiceResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filters: Vec<String> = filters.into_iter().map(Into::into).collect();
        for filter in &filters {
            validate_filter(filter)?;
        }
        if self.bus.is_closed() {
            return Err(ServiceError::Disconnected);
        }
        Ok(self.bus.attach("client", filters))
    }

    /// Start a service on its own task
    ///
    /// The inbox is attached before this returns, so anything published
    /// afterwards reaches the service even if `on_start` is still running. An
    /// id may be reused once its previous service has stopped or failed.
    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        if self.bus.is_closed() {
            return Err(ServiceError::Disconnected);
        }

        let spec = service.spec();
        for filter in &spec.subscriptions {
            validate_filter(filter)?;
        }

        let slot = match self.services.entry(spec.id.clone()) {
            Entry::Occupied(existing) if !existing.get().handle.is_terminal() => {
                return Err(ServiceError::AlreadyRunning(spec.id));
            }
            Entry::Occupied(existing) => {
                let (_, stale) = existing.remove_entry();
                stale.task.abort();
                match self.services.entry(spec.id.clone()) {
                    Entry::Vacant(slot) => slot,
                    Entry::Occupied(_) => return Err(ServiceError::AlreadyRunning(spec.id)),
                }
            }
            Entry::Vacant(slot) => slot,
        };

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state, state_rx) = watch::channel(ServiceState::Starting);
        let handle = ServiceHandle::new(spec.id.clone(), commands, state_rx);
        let shutdown_timeout = spec.shutdown_timeout;

        let inbox = self.bus.attach(spec.id.clone(), spec.subscriptions.clone());
        let runner = Runner {
            ctx: ServiceContext::new(spec.id.clone(), self.publisher(), handle.mailbox()),
            spec,
            state,
        };
        let task = tokio::spawn(runner.run(service, inbox, command_rx));

        slot.insert(Registered {
            handle: handle.clone(),
            task,
            shutdown_timeout,
        });
        Ok(handle)
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHandle> {
        self.services.get(service_id).map(|s| s.handle.clone())
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.get(service_id).is_some_and(|h| h.is_running())
    }

    pub fn publish(&self, message: Message) -> ServiceResult<()> {
        self.publisher().publish(message)
    }

    pub fn emit(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
        source: impl Into<String>,
    ) -> ServiceResult<()> {
        self.publish(Message::new(topic, payload, source))
    }

    /// Stop one service and wait for its task
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let (id, registered) = self
            .services
            .remove(service_id)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        let _ = registered.handle.shutdown().await;
        join(&id, registered).await
    }

    /// Stop every service, then close the bus
    ///
    /// All services are asked to stop before any is waited for, so they wind
    /// down concurrently.
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        let ids: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        tracing::info!(services = ids.len(), "Shutting down all services");

        let mut stopping = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((id, registered)) = self.services.remove(&id) {
                let _ = registered.handle.shutdown().await;
                stopping.push((id, registered));
            }
        }

        let mut outcome = Ok(());
        for (id, registered) in stopping {
            if let Err(e) = join(&id, registered).await {
                tracing::warn!(service_id = %id, error = %e, "Service did not stop cleanly");
                outcome = Err(e);
            }
        }

        self.bus.close();
        outcome
    }

    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|e| (e.key().clone(), e.value().handle.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

async fn join(id: &str, mut registered: Registered) -> ServiceResult<()> {
    let limit = registered.shutdown_timeout + JOIN_GRACE;
    match tokio::time::timeout(limit, &mut registered.task).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(service_id = id, "Service task panicked");
            Err(ServiceError::Panicked(id.to_string()))
        }
        Ok(Err(_)) => Ok(()),
        Err(_) => {
            registered.task.abort();
            tracing::warn!(service_id = id, "Service shutdown timed out");
            Err(ServiceError::ShutdownTimeout)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service task
// ─────────────────────────────────────────────────────────────────────────────

struct Runner {
    ctx: ServiceContext,
    spec: ServiceSpec,
    state: watch::Sender<ServiceState>,
}

impl Runner {
    fn set(&self, state: ServiceState) {
        self.state.send_replace(state);
    }

    async fn run<S: Service>(
        self,
        mut service: S,
        mut inbox: Subscription,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let id = self.ctx.service_id.as_str();

        if let Err(e) = service.on_start(&self.ctx).await {
            tracing::error!(service_id = id, error = %e, "Service failed to start");
            self.set(ServiceState::Failed);
            return;
        }
        self.set(ServiceState::Running);
        tracing::debug!(service_id = id, "Service started");

        self.serve(&mut service, &mut inbox, &mut commands).await;
        drop(inbox);

        self.set(ServiceState::Stopping);
        let final_state = match tokio::time::timeout(self.spec.shutdown_timeout, service.on_stop(&self.ctx)).await {
            Ok(Ok(())) => ServiceState::Stopped,
            Ok(Err(e)) => {
                tracing::error!(service_id = id, error = %e, "Service stop failed");
                ServiceState::Failed
            }
            Err(_) => {
                tracing::error!(service_id = id, "Service stop timed out");
                ServiceState::Failed
            }
        };
        self.set(final_state);
        tracing::debug!(service_id = id, state = %final_state, "Service finished");
    }

    /// Feed messages and ticks until told to stop or the bus closes
    async fn serve<S: Service>(
        &self,
        service: &mut S,
        inbox: &mut Subscription,
        commands: &mut mpsc::Receiver<Command>,
    ) {
        let id = self.ctx.service_id.as_str();
        let mut ticker = self.spec.tick_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Deliver(message)) => self.deliver(service, message).await,
                    Some(Command::Stop) | None => return,
                },

                received = inbox.recv() => match received {
                    Some(message) => self.deliver(service, message).await,
                    None => {
                        tracing::warn!(service_id = id, "Bus closed");
                        return;
                    }
                },

                _ = next_tick(&mut ticker) => {
                    if let Err(e) = service.on_tick(&self.ctx).await {
                        tracing::warn!(service_id = id, error = %e, "Error during tick");
                    }
                }
            }
        }
    }

    async fn deliver<S: Service>(&self, service: &mut S, message: Message) {
        let topic = message.topic.clone();
        if let Err(e) = service.on_message(&self.ctx, message).await {
            tracing::warn!(service_id = %self.ctx.service_id, topic, error = %e, "Error handling message");
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

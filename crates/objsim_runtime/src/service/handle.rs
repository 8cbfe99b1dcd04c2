//! Handles to running services
//!
//! A service task owns a `watch` sender for its state; every handle holds a
//! receiver, so reads never block and waiting for a state change is cheap.

use std::fmt;

use tokio::sync::{mpsc, watch};

use super::{Message, ServiceError, ServiceResult};

/// Where a service is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// `on_start` or `on_stop` returned an error, or `on_stop` timed out
    Failed,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }

    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Out-of-band instructions for a service task
#[derive(Debug)]
pub(crate) enum Command {
    /// Hand a message to `on_message` whatever the subscriptions say
    Deliver(Message),
    Stop,
}

/// Cloneable reference to a running service
#[derive(Clone)]
pub struct ServiceHandle {
    pub service_id: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    pub(crate) fn new(
        service_id: String,
        commands: mpsc::Sender<Command>,
        state: watch::Receiver<ServiceState>,
    ) -> Self {
        Self {
            service_id,
            commands,
            state,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Deliver a message to this service only, bypassing topic routing
    pub async fn deliver(&self, message: Message) -> ServiceResult<()> {
        self.send(Command::Deliver(message)).await
    }

    /// A mailbox for tasks the service itself spawns
    pub fn mailbox(&self) -> Mailbox {
        Mailbox {
            service_id: self.service_id.clone(),
            commands: self.commands.downgrade(),
        }
    }

    /// Ask the service to stop; returns once the request is queued
    pub async fn shutdown(&self) -> ServiceResult<()> {
        self.send(Command::Stop).await
    }

    /// Wait until the service has stopped or failed
    pub async fn stopped(&self) -> ServiceState {
        let mut state = self.state.clone();
        match state.wait_for(ServiceState::is_terminal).await {
            Ok(terminal) => *terminal,
            // The task is gone without reporting; treat it as failed
            Err(_) => ServiceState::Failed,
        }
    }

    async fn send(&self, command: Command) -> ServiceResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))
    }
}

/// Feeds messages back into a service's own loop
///
/// Holds the command channel weakly, so a task owning a mailbox never keeps a
/// service alive after every handle is gone.
#[derive(Clone)]
pub struct Mailbox {
    service_id: String,
    commands: mpsc::WeakSender<Command>,
}

impl Mailbox {
    /// Queue a message for `on_message`, behind whatever is already waiting
    pub async fn deliver(&self, message: Message) -> ServiceResult<()> {
        let commands = self
            .commands
            .upgrade()
            .ok_or_else(|| ServiceError::NotRunning(self.service_id.clone()))?;
        commands
            .send(Command::Deliver(message))
            .await
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}

// Device runtime - a simulated device as a bus service
//
// The service loop hands messages over one at a time, so a device handles
// its traffic strictly in arrival order and the response latency sleep holds
// back everything queued behind the request. Continuous publication runs in a
// separate task that shares the device and parks while on-demand. The timed
// smoke alarm goes through the service's mailbox, so it queues like any change.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use objsim_runtime::{
    BusPublisher, Mailbox, Message, Service, ServiceContext, ServiceResult, ServiceSpec,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{Applied, Device, DeviceKind, PublishingMode, PUBLISHING_MODE, PUBLISHING_PERIOD, STATUS};
use crate::address::{parse_topic, subscription_patterns, Suffix};
use crate::protocol::{Change, Namespace, Outgoing, Request};
use crate::types::{Error, Result};

/// Shortest pause between two continuous publications
const MIN_PUBLISHING_PERIOD: Duration = Duration::from_millis(10);

pub struct DeviceRuntime {
    device: Arc<Device>,
    wake: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceRuntime {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            wake: Arc::new(Notify::new()),
            tasks: Vec::new(),
        }
    }

    pub fn device(&self) -> Arc<Device> {
        Arc::clone(&self.device)
    }

    /// Service id under which a device runs
    pub fn service_id(device: &Device) -> String {
        format!("device:{}", device.identity())
    }

    /// Publish the effects of a change, or log why there were none
    fn settle(
        &self,
        ctx: &ServiceContext,
        topic: &str,
        result: Result<(Applied, Vec<Outgoing>)>,
    ) -> ServiceResult<()> {
        match result {
            Ok((applied, outgoing)) => {
                if let Applied::Config(key) = &applied {
                    tracing::debug!(device = %self.device.identity(), key, "Config changed");
                    if key == PUBLISHING_MODE || key == PUBLISHING_PERIOD {
                        self.wake.notify_one();
                    }
                }
                for message in outgoing {
                    ctx.publish(message.topic, message.payload)?;
                }
            }
            Err(Error::UnknownParameter(key) | Error::UnknownField(key)) => {
                tracing::debug!(device = %self.device.identity(), topic, key, "Ignoring unknown key");
            }
            Err(e) => {
                tracing::warn!(device = %self.device.identity(), topic, error = %e, "Dropping change");
            }
        }
        Ok(())
    }

    async fn answer(&self, ctx: &ServiceContext, message: &Message) -> ServiceResult<()> {
        let request = match Request::parse(&message.topic, &message.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(device = %self.device.identity(), error = %e, "Dropping request");
                return Ok(());
            }
        };

        let latency = self.device.response_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reply = self.device.answer(&request);
        ctx.publish(reply.topic, reply.payload)
    }
}

async fn publish_loop(device: Arc<Device>, publisher: BusPublisher, source: String, wake: Arc<Notify>) {
    loop {
        match device.publishing_mode() {
            PublishingMode::Continuous => {
                for message in device.snapshot() {
                    if let Err(e) = publisher.emit(message.topic, message.payload, source.as_str()) {
                        tracing::debug!(device = %device.identity(), error = %e, "Publish loop ended");
                        return;
                    }
                }

                let period = device.publishing_period().max(MIN_PUBLISHING_PERIOD);
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = wake.notified() => {}
                }
            }
            PublishingMode::OnDemand => wake.notified().await,
        }
    }
}

async fn raise_alarm(device: Arc<Device>, mailbox: Mailbox, source: String, after: Duration) {
    tokio::time::sleep(after).await;
    tracing::info!(device = %device.identity(), "Smoke detected");

    let payload = match Change::new(Namespace::Field, STATUS, "ON").encode() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(device = %device.identity(), error = %e, "Failed to raise alarm");
            return;
        }
    };
    let alarm = Message::new(device.identity().topic(&Suffix::Change), payload, source);
    if let Err(e) = mailbox.deliver(alarm).await {
        tracing::warn!(device = %device.identity(), error = %e, "Failed to raise alarm");
    }
}

#[async_trait]
impl Service for DeviceRuntime {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(Self::service_id(&self.device), self.device.identity().name())
            .with_subscriptions(subscription_patterns(self.device.identity()))
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_description(format!("Simulated {}", self.device.kind().type_name()))
    }

    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        tracing::info!(
            device = %self.device.identity(),
            mode = %self.device.publishing_mode(),
            "Device online"
        );

        self.tasks.push(tokio::spawn(publish_loop(
            Arc::clone(&self.device),
            ctx.publisher(),
            ctx.service_id.clone(),
            Arc::clone(&self.wake),
        )));

        if let DeviceKind::SmokeDetector {
            alarm_after: Some(after),
        } = self.device.kind()
        {
            self.tasks.push(tokio::spawn(raise_alarm(
                Arc::clone(&self.device),
                ctx.mailbox(),
                ctx.service_id.clone(),
                *after,
            )));
        }

        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!(device = %self.device.identity(), "Device offline");
        Ok(())
    }

    async fn on_message(&mut self, ctx: &ServiceContext, message: Message) -> ServiceResult<()> {
        let suffix = match parse_topic(&message.topic) {
            Ok(parsed) => parsed.suffix,
            Err(e) => {
                tracing::debug!(topic = %message.topic, error = %e, "Ignoring topic");
                return Ok(());
            }
        };

        if let Some(result) = self.device.react(&suffix) {
            self.settle(ctx, &message.topic, result)?;
        }

        match suffix {
            Suffix::Change => {
                let result = self.device.handle_change(&message.topic, &message.payload);
                self.settle(ctx, &message.topic, result)
            }
            Suffix::Request => self.answer(ctx, &message).await,
            _ => Ok(()),
        }
    }
}

// Metrics recorder - feeds device metric messages into the time-series store
//
// Every message on `<address>/metrics/<field>` becomes one point: the device
// type is the measurement, the rest of the address plus the field name are
// tags. Points past the retention window are pruned on each tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use objsim_runtime::{Message, Service, ServiceContext, ServiceResult, ServiceSpec};
use serde::{Deserialize, Serialize};

use crate::address::{parse_topic, Suffix};
use crate::store::{MetricPoint, MetricStore, MetricTags, MetricValue};

/// Filter matching every device's metric topics
pub const METRICS_FILTER: &str = "+/+/+/+/+/metrics/+";

/// Configuration for the recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Whether `run` starts the recorder
    pub enabled: bool,
    /// Number of days to retain points
    pub retention_days: u32,
    /// Seconds between two pruning passes
    pub prune_interval_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            prune_interval_secs: 3600,
        }
    }
}

/// Convert a metric message into a point, `None` for any other topic
pub fn metric_point(message: &Message) -> Option<MetricPoint> {
    let parsed = parse_topic(&message.topic).ok()?;
    let Suffix::Metrics(field) = &parsed.suffix else {
        return None;
    };

    Some(MetricPoint {
        measurement: parsed.object_type().to_string(),
        tags: MetricTags {
            building: parsed.building().to_string(),
            floor: parsed.floor().to_string(),
            room: parsed.room().to_string(),
            object_name: parsed.name().to_string(),
            field_name: field.clone(),
        },
        value: MetricValue::parse(&message.payload),
        timestamp: Utc::now(),
    })
}

pub struct MetricsRecorder {
    store: Arc<dyn MetricStore>,
    config: RecorderConfig,
    recorded: u64,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn MetricStore>, config: RecorderConfig) -> Self {
        Self {
            store,
            config,
            recorded: 0,
        }
    }

    /// Points written since start
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    fn prune(&self) {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        match self.store.prune_before(cutoff) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Pruned expired metric points"),
            Err(e) => tracing::warn!(error = %e, "Failed to prune metric points"),
        }
    }
}

#[async_trait]
impl Service for MetricsRecorder {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("recorder", "Metrics Recorder")
            .subscribe(METRICS_FILTER)
            .with_tick_interval(Duration::from_secs(self.config.prune_interval_secs.max(1)))
            .with_description("Stores device metrics in the time-series store")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        tracing::info!(retention_days = self.config.retention_days, "Recorder started");
        self.prune();
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        tracing::info!(recorded = self.recorded, "Recorder stopped");
        Ok(())
    }

    async fn on_message(&mut self, _ctx: &ServiceContext, message: Message) -> ServiceResult<()> {
        let Some(point) = metric_point(&message) else {
            return Ok(());
        };

        if let Err(e) = self.store.write_point(&point) {
            tracing::warn!(topic = %message.topic, error = %e, "Failed to store metric point");
            return Ok(());
        }
        self.recorded += 1;
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.prune();
        Ok(())
    }
}

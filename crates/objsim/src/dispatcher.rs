//! Scenario dispatcher
//!
//! Listens for scenario ids on the control topic, loads the scenario from the
//! document store and turns each entry into `change` messages for the target
//! group. Group topics come from [`target_topic`], the same codec devices use
//! for their subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use objsim_runtime::{BusPublisher, Message, Service, ServiceContext, ServiceResult, ServiceSpec};

use crate::address::{target_topic, Suffix};
use crate::protocol::{Change, Namespace, Outgoing, CONTROL_TOPIC};
use crate::scenario::{patch_value, Patch, Scenario};
use crate::store::DocumentStore;
use crate::types::{Error, Result};

/// Outcome of publishing a scenario
#[derive(Debug)]
pub struct DispatchReport {
    pub scenario_id: u32,
    pub planned: usize,
    pub sent: usize,
    /// Transport failure that cut the dispatch short
    pub failure: Option<Error>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.sent == self.planned
    }
}

fn plan_patch(
    scenario: &Scenario,
    base: &str,
    namespace: Namespace,
    patch: &Patch,
    plan: &mut Vec<Outgoing>,
) {
    let topic = format!("{}/{}", base, Suffix::Change);
    for (key, value) in patch {
        let Some(text) = patch_value(value) else {
            tracing::warn!(
                scenario = scenario.scenario_id,
                key = %key,
                "Skipping non scalar value"
            );
            continue;
        };

        match Change::new(namespace, key.as_str(), text).encode() {
            Ok(payload) => plan.push(Outgoing::new(topic.as_str(), payload)),
            Err(e) => tracing::warn!(
                scenario = scenario.scenario_id,
                key = %key,
                error = %e,
                "Skipping value that cannot be encoded"
            ),
        }
    }
}

/// Messages a scenario expands to, in publication order
///
/// Entries in document order; within an entry config keys first, then field
/// keys, each in document order.
pub fn plan(scenario: &Scenario) -> Vec<Outgoing> {
    let mut plan = Vec::new();

    for (index, entry) in scenario.configs.iter().enumerate() {
        let Some(targets) = &entry.targets else {
            tracing::warn!(scenario = scenario.scenario_id, entry = index, "Entry has no targets");
            continue;
        };

        let base = match target_topic(targets) {
            Ok(base) => base,
            Err(e) => {
                tracing::warn!(
                    scenario = scenario.scenario_id,
                    entry = index,
                    error = %e,
                    "Skipping entry"
                );
                continue;
            }
        };

        if let Some(config) = &entry.config {
            plan_patch(scenario, &base, Namespace::Config, config, &mut plan);
        }
        if let Some(fields) = &entry.fields {
            plan_patch(scenario, &base, Namespace::Field, fields, &mut plan);
        }
    }

    plan
}

/// Publish a scenario, stopping at the first transport failure
///
/// Messages already sent stay sent.
pub fn apply_scenario(publisher: &BusPublisher, source: &str, scenario: &Scenario) -> DispatchReport {
    let plan = plan(scenario);
    let mut report = DispatchReport {
        scenario_id: scenario.scenario_id,
        planned: plan.len(),
        sent: 0,
        failure: None,
    };

    for message in plan {
        tracing::debug!(topic = %message.topic, payload = %message.payload, "Dispatching");
        if let Err(e) = publisher.emit(message.topic, message.payload, source) {
            report.failure = Some(e.into());
            break;
        }
        report.sent += 1;
    }

    report
}

/// Parse a trigger payload into a scenario id
pub fn parse_trigger(topic: &str, payload: &str) -> Result<u32> {
    payload
        .trim()
        .parse()
        .map_err(|_| Error::malformed(topic, format!("scenario id {payload:?} is not a number")))
}

pub struct ScenarioDispatcher {
    store: Arc<dyn DocumentStore>,
    control_topic: String,
}

impl ScenarioDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            control_topic: CONTROL_TOPIC.to_string(),
        }
    }

    pub fn with_control_topic(mut self, topic: impl Into<String>) -> Self {
        self.control_topic = topic.into();
        self
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    pub fn load_scenario(&self, id: u32) -> Result<Scenario> {
        self.store
            .get_scenario(id)?
            .ok_or(Error::ScenarioNotFound(id))
    }

    /// Handle one trigger payload end to end
    pub fn trigger(&self, publisher: &BusPublisher, source: &str, payload: &str) -> Result<DispatchReport> {
        let id = parse_trigger(&self.control_topic, payload)?;
        let scenario = self.load_scenario(id)?;
        tracing::info!(scenario = id, name = %scenario.scenario_name, "Applying scenario");
        Ok(apply_scenario(publisher, source, &scenario))
    }
}

#[async_trait]
impl Service for ScenarioDispatcher {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("dispatcher", "Scenario Dispatcher")
            .subscribe(self.control_topic.as_str())
            .with_description("Turns scenario triggers into change messages")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        tracing::info!(topic = %self.control_topic, "Dispatcher listening");
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_message(&mut self, ctx: &ServiceContext, message: Message) -> ServiceResult<()> {
        match self.trigger(&ctx.publisher(), &ctx.service_id, &message.payload) {
            Ok(report) if report.is_complete() => {
                tracing::info!(scenario = report.scenario_id, sent = report.sent, "Scenario applied");
            }
            Ok(report) => {
                tracing::error!(
                    scenario = report.scenario_id,
                    sent = report.sent,
                    planned = report.planned,
                    error = ?report.failure,
                    "Scenario partially applied"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Trigger ignored"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{TargetPattern, WILDCARD};
    use crate::scenario::{builtin_scenarios, ScenarioEntry};
    use crate::store::MemoryStore;
    use objsim_runtime::ServiceManager;
    use serde_json::json;

    fn scenario(configs: Vec<ScenarioEntry>) -> Scenario {
        Scenario {
            scenario_id: 7,
            scenario_name: "test".into(),
            configs,
        }
    }

    fn patch(value: serde_json::Value) -> Option<Patch> {
        value.as_object().cloned()
    }

    #[test]
    fn plan_keeps_document_order() {
        let plan = plan(&builtin_scenarios()[0]);
        let lines: Vec<String> = plan.iter().map(|m| format!("{} {}", m.topic, m.payload)).collect();
        assert_eq!(
            lines,
            vec![
                "All/All/All/All/All/change config,publishing_mode,on-demand",
                "All/All/All/All/All/change config,response_latency,0",
                "All/All/All/Lamp/All/change field,status,OFF",
                "All/All/All/Lamp/All/change field,brightness,0",
                "All/All/All/SystemData Publisher/All/change field,status,OFF",
            ]
        );
    }

    #[test]
    fn config_before_fields_within_entry() {
        let entry = ScenarioEntry {
            targets: Some(TargetPattern::everything()),
            fields: patch(json!({"status": "ON"})),
            config: patch(json!({"publishing_period": 1000})),
        };
        let plan = plan(&scenario(vec![entry]));
        assert_eq!(plan[0].payload, "config,publishing_period,1000");
        assert_eq!(plan[1].payload, "field,status,ON");
    }

    #[test]
    fn unusable_entries_are_skipped() {
        let plan = plan(&scenario(vec![
            ScenarioEntry {
                targets: None,
                fields: patch(json!({"status": "ON"})),
                config: None,
            },
            ScenarioEntry {
                targets: Some(TargetPattern::new("EF", WILDCARD, "1.32", "Lamp", WILDCARD)),
                fields: patch(json!({"status": "ON"})),
                config: None,
            },
            ScenarioEntry {
                targets: Some(TargetPattern::of_type("Lamp")),
                fields: patch(json!({"status": "ON,OFF", "colour": {"r": 1}, "brightness": 12})),
                config: None,
            },
        ]));

        assert_eq!(plan, vec![Outgoing::new("All/All/All/Lamp/All/change", "field,brightness,12")]);
    }

    #[test]
    fn trigger_payload_must_be_numeric() {
        assert_eq!(parse_trigger("Scenario", " 3 ").unwrap(), 3);
        assert!(matches!(
            parse_trigger("Scenario", "three"),
            Err(Error::MalformedMessage { .. })
        ));
    }

    #[test]
    fn missing_scenario_sends_nothing() {
        let manager = ServiceManager::new();
        let mut all = manager.subscribe(["#"]).unwrap();
        let dispatcher = ScenarioDispatcher::new(Arc::new(MemoryStore::new()));

        let result = dispatcher.trigger(&manager.publisher(), "test", "3");
        assert!(matches!(result, Err(Error::ScenarioNotFound(3))));
        assert!(all.try_recv().is_none());
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_reports_progress() {
        let manager = ServiceManager::new();
        let publisher = manager.publisher();
        manager.shutdown_all().await.unwrap();

        let report = apply_scenario(&publisher, "test", &builtin_scenarios()[1]);
        assert_eq!(report.planned, 2);
        assert_eq!(report.sent, 0);
        assert!(matches!(report.failure, Some(Error::TransportDisconnected)));
    }

    #[tokio::test]
    async fn control_topic_triggers_dispatch() {
        let store = Arc::new(MemoryStore::new());
        for scenario in builtin_scenarios() {
            store.put_scenario(&scenario).unwrap();
        }

        let manager = ServiceManager::new();
        let mut changes = manager.subscribe(["+/+/+/+/+/change"]).unwrap();
        manager.spawn(ScenarioDispatcher::new(store)).await.unwrap();

        manager.emit(CONTROL_TOPIC, "4", "test").unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.topic, "All/All/All/All/All/change");
        assert_eq!(first.payload, "config,publishing_mode,continuous");

        manager.shutdown_all().await.unwrap();
    }
}

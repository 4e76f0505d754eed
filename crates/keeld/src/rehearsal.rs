//! Rehearsal executor: deploys against an in-memory picture of the managed
//! system instead of a real one.
//!
//! Useful to see what order a model version would deploy in and which
//! resources it would touch, without handler code.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use keel_core::config::RehearsalConfig;
use keel_core::{
    agent_of, AttributeChange, DeployResult, DeployStatus, DryRunResult, Facts, ResourceIdStr,
    ResourceIntent,
};
use keel_scheduler::{ExecutionRequest, Executor, ExecutorFuture};

pub struct RehearsalExecutor {
    delay: Duration,
    fail: HashSet<ResourceIdStr>,
    /// Last intent applied per resource.
    applied: Mutex<HashMap<ResourceIdStr, ResourceIntent>>,
}

impl RehearsalExecutor {
    pub fn new(config: &RehearsalConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.deploy_delay_ms),
            fail: config.fail.iter().cloned().collect(),
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Attributes that differ between what was applied and `intent`.
    async fn diff(
        &self,
        resource: &str,
        intent: &ResourceIntent,
    ) -> BTreeMap<String, AttributeChange> {
        let applied = self.applied.lock().await;
        let current = applied.get(resource).map(|i| &i.attributes);
        attribute_changes(current, &intent.attributes)
    }
}

fn attribute_changes(
    current: Option<&BTreeMap<String, serde_json::Value>>,
    desired: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, AttributeChange> {
    let empty = BTreeMap::new();
    let current = current.unwrap_or(&empty);
    current
        .keys()
        .chain(desired.keys())
        .filter_map(|key| {
            let before = current.get(key).cloned().unwrap_or(serde_json::Value::Null);
            let after = desired.get(key).cloned().unwrap_or(serde_json::Value::Null);
            (before != after).then(|| {
                (
                    key.clone(),
                    AttributeChange {
                        current: before,
                        desired: after,
                    },
                )
            })
        })
        .collect()
}

impl Executor for RehearsalExecutor {
    fn execute<'a>(&'a self, request: &'a ExecutionRequest) -> ExecutorFuture<'a, DeployResult> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if !request.dependencies_deployed() {
                return Ok(DeployResult::with_status(
                    DeployStatus::SkippedForDependency,
                    "not all requirements are deployed",
                ));
            }
            if self.fail.contains(&request.resource) {
                return Ok(DeployResult::failed(format!(
                    "rehearsal failure configured for {}",
                    request.resource
                )));
            }

            let changes = self.diff(&request.resource, &request.intent).await;
            self.applied
                .lock()
                .await
                .insert(request.resource.clone(), request.intent.clone());

            let mut result = DeployResult::deployed(!changes.is_empty());
            result.messages.push(format!(
                "rehearsed deploy of version {} ({})",
                request.version, request.reason
            ));
            result.changes = changes;
            debug!(resource = %request.resource, changed = result.changed, "rehearsal deploy");
            Ok(result)
        })
    }

    fn dry_run<'a>(
        &'a self,
        resource: &'a str,
        intent: &'a ResourceIntent,
    ) -> ExecutorFuture<'a, DryRunResult> {
        Box::pin(async move {
            let changes = self.diff(resource, intent).await;
            let mut messages = Vec::new();
            if self.fail.contains(resource) {
                messages.push("deploy would fail".to_string());
            }
            Ok(DryRunResult { changes, messages })
        })
    }

    fn get_facts<'a>(
        &'a self,
        resource: &'a str,
        intent: &'a ResourceIntent,
    ) -> ExecutorFuture<'a, Facts> {
        Box::pin(async move {
            let applied = self.applied.lock().await;
            let mut facts = Facts::new();
            facts.insert("agent".to_string(), agent_of(resource).to_string());
            facts.insert(
                "in_sync".to_string(),
                (applied.get(resource) == Some(intent)).to_string(),
            );
            facts.insert("attribute_hash".to_string(), intent.attribute_hash());
            Ok(facts)
        })
    }

    fn reload<'a>(
        &'a self,
        resource: &'a str,
        _intent: &'a ResourceIntent,
    ) -> ExecutorFuture<'a, ()> {
        Box::pin(async move {
            info!(%resource, "rehearsal reload");
            Ok(())
        })
    }
}

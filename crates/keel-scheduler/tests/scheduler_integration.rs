//! End-to-end scheduler tests.
//!
//! Runs the real `ResourceScheduler` with agent workers against a recording
//! executor and an in-memory state store.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::config::SchedulerConfig;
use keel_core::{DeployResult, DeployStatus, DryRunResult, Facts, ModelVersion, ResourceIntent};
use keel_scheduler::*;
use keel_state::StateStore;

// ── Test executor ──────────────────────────────────────────────────

#[derive(Default)]
struct TestExecutor {
    log: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    changing: HashSet<String>,
    delay: Duration,
}

impl TestExecutor {
    fn changing(mut self, resources: &[&str]) -> Self {
        self.changing = resources.iter().map(|r| r.to_string()).collect();
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fail(&self, resource: &str) {
        self.failing.lock().unwrap().insert(resource.to_string());
    }

    fn heal(&self, resource: &str) {
        self.failing.lock().unwrap().remove(resource);
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl Executor for TestExecutor {
    fn execute<'a>(&'a self, request: &'a ExecutionRequest) -> ExecutorFuture<'a, DeployResult> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.record(format!("deploy:{}", request.resource));
            if !request.dependencies_deployed() {
                return Ok(DeployResult::with_status(
                    DeployStatus::SkippedForDependency,
                    "a requirement is not deployed",
                ));
            }
            if self.failing.lock().unwrap().contains(&request.resource) {
                anyhow::bail!("handler error for {}", request.resource);
            }
            Ok(DeployResult::deployed(self.changing.contains(&request.resource)))
        })
    }

    fn dry_run<'a>(
        &'a self,
        resource: &'a str,
        _intent: &'a ResourceIntent,
    ) -> ExecutorFuture<'a, DryRunResult> {
        Box::pin(async move {
            self.record(format!("dryrun:{resource}"));
            Ok(DryRunResult {
                messages: vec![format!("would deploy {resource}")],
                ..Default::default()
            })
        })
    }

    fn get_facts<'a>(
        &'a self,
        resource: &'a str,
        _intent: &'a ResourceIntent,
    ) -> ExecutorFuture<'a, Facts> {
        Box::pin(async move {
            self.record(format!("facts:{resource}"));
            let mut facts = Facts::new();
            facts.insert("length".to_string(), resource.len().to_string());
            Ok(facts)
        })
    }

    fn reload<'a>(
        &'a self,
        resource: &'a str,
        _intent: &'a ResourceIntent,
    ) -> ExecutorFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("reload:{resource}"));
            Ok(())
        })
    }
}

// ── Harness ────────────────────────────────────────────────────────

fn rid(name: &str) -> String {
    format!("test::Resource[agent1,name={name}]")
}

fn rid_on(agent: &str, name: &str) -> String {
    format!("test::Resource[{agent},name={name}]")
}

fn intent(value: &str) -> ResourceIntent {
    let mut attributes = BTreeMap::new();
    attributes.insert("value".to_string(), serde_json::json!(value));
    ResourceIntent {
        attributes,
        ..Default::default()
    }
}

/// A version from `(resource id, intent)` pairs and `(dependant, requirement)` edges.
fn model(version: u64, resources: &[(&str, ResourceIntent)], edges: &[(&str, &str)]) -> ModelVersion {
    let mut model = ModelVersion {
        version,
        ..Default::default()
    };
    for (resource, intent) in resources {
        model.resources.insert(resource.to_string(), intent.clone());
    }
    for (resource, dep) in edges {
        model
            .requires
            .entry(resource.to_string())
            .or_default()
            .insert(dep.to_string());
    }
    model
}

struct Harness {
    scheduler: ResourceScheduler,
    executor: Arc<TestExecutor>,
    store: StateStore,
}

impl Harness {
    async fn start(executor: TestExecutor) -> Self {
        let executor = Arc::new(executor);
        Self::start_with(executor.clone(), Arc::new(PerAgentExecutors::shared(executor))).await
    }

    async fn start_with(executor: Arc<TestExecutor>, executors: Arc<dyn ExecutorManager>) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = ResourceScheduler::new(
            "test",
            SchedulerConfig::default(),
            executors,
            Arc::new(store.clone()),
        );
        scheduler.start().await;
        Self {
            scheduler,
            executor,
            store,
        }
    }

    async fn settle(&self) {
        assert!(
            self.scheduler
                .wait_until_idle_timeout(Duration::from_secs(10))
                .await,
            "scheduler did not go idle"
        );
    }

    async fn status(&self, resource: &str) -> Option<DeployStatus> {
        self.scheduler
            .snapshot()
            .await
            .into_iter()
            .find(|s| s.resource == resource)
            .and_then(|s| s.state.last_status)
    }

    fn position(&self, entry: &str) -> usize {
        self.executor
            .entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} never happened"))
    }
}

// ── Ordering ───────────────────────────────────────────────────────

#[tokio::test]
async fn deploys_follow_dependency_order() {
    let h = Harness::start(TestExecutor::default()).await;
    let (a, b, c) = (rid("a"), rid("b"), rid("c"));
    h.scheduler
        .new_version(model(
            1,
            &[(&a, intent("a")), (&b, intent("b")), (&c, intent("c"))],
            &[(&a, &b), (&b, &c)],
        ))
        .await
        .unwrap();
    h.settle().await;

    assert!(h.position(&format!("deploy:{c}")) < h.position(&format!("deploy:{b}")));
    assert!(h.position(&format!("deploy:{b}")) < h.position(&format!("deploy:{a}")));
    for resource in [&a, &b, &c] {
        assert_eq!(h.status(resource).await, Some(DeployStatus::Deployed));
        let record = h.store.get_resource_state(resource).unwrap().unwrap();
        assert_eq!(record.last_status(), Some(DeployStatus::Deployed));
        assert!(!record.deploying);
    }
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn cross_agent_requirements_are_respected() {
    let h = Harness::start(TestExecutor::default().with_delay(Duration::from_millis(20))).await;
    let (app, schema) = (rid_on("web", "app"), rid_on("db", "schema"));
    h.scheduler
        .new_version(model(
            1,
            &[(&app, intent("app")), (&schema, intent("schema"))],
            &[(&app, &schema)],
        ))
        .await
        .unwrap();
    h.settle().await;

    assert!(h.position(&format!("deploy:{schema}")) < h.position(&format!("deploy:{app}")));
    assert_eq!(h.scheduler.agents().await, vec!["db", "web"]);
    h.scheduler.stop("test done").await;
}

// ── Version intake ─────────────────────────────────────────────────

#[tokio::test]
async fn only_changed_resources_are_redeployed() {
    let h = Harness::start(TestExecutor::default()).await;
    let (a, b) = (rid("a"), rid("b"));
    let v1 = model(1, &[(&a, intent("a")), (&b, intent("b"))], &[]);
    h.scheduler.new_version(v1.clone()).await.unwrap();
    h.settle().await;
    assert_eq!(h.executor.entries().len(), 2);

    let mut v2 = v1.clone();
    v2.version = 2;
    h.scheduler.new_version(v2).await.unwrap();
    h.settle().await;
    assert_eq!(h.executor.entries().len(), 2);

    let v3 = model(3, &[(&a, intent("a")), (&b, intent("b2"))], &[]);
    h.scheduler.new_version(v3).await.unwrap();
    h.settle().await;
    assert_eq!(h.executor.count(&format!("deploy:{a}")), 1);
    assert_eq!(h.executor.count(&format!("deploy:{b}")), 2);
    assert_eq!(h.scheduler.current_version().await, 3);
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn intent_change_during_deploy_triggers_a_second_deploy() {
    let h = Harness::start(TestExecutor::default().with_delay(Duration::from_millis(200))).await;
    let b = rid("b");
    h.scheduler
        .new_version(model(1, &[(&b, intent("old"))], &[]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.scheduler
        .new_version(model(2, &[(&b, intent("new"))], &[]))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.executor.count(&format!("deploy:{b}")), 2);
    let snapshot = h.scheduler.snapshot().await;
    assert_eq!(
        snapshot[0].state.deployed_hash.as_deref(),
        Some(intent("new").attribute_hash().as_str())
    );
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn same_intent_during_deploy_is_not_duplicated() {
    let h = Harness::start(TestExecutor::default().with_delay(Duration::from_millis(200))).await;
    let b = rid("b");
    h.scheduler
        .new_version(model(1, &[(&b, intent("same"))], &[]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.scheduler
        .new_version(model(2, &[(&b, intent("same"))], &[]))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.executor.count(&format!("deploy:{b}")), 1);
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn user_deploy_during_same_intent_deploy_runs_again() {
    let h = Harness::start(TestExecutor::default().with_delay(Duration::from_millis(200))).await;
    let b = rid("b");
    h.scheduler
        .new_version(model(1, &[(&b, intent("same"))], &[]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.scheduler.snapshot().await[0].in_progress);

    h.scheduler.deploy("user deploy", TaskPriority::UserDeploy).await;
    let queued = h.scheduler.queued_tasks().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].1, TaskPriority::UserDeploy);
    h.settle().await;

    assert_eq!(h.executor.count(&format!("deploy:{b}")), 2);
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn removed_resources_are_forgotten() {
    let h = Harness::start(TestExecutor::default()).await;
    let (a, b) = (rid("a"), rid("b"));
    h.scheduler
        .new_version(model(1, &[(&a, intent("a")), (&b, intent("b"))], &[(&a, &b)]))
        .await
        .unwrap();
    h.settle().await;

    h.scheduler
        .new_version(model(2, &[(&a, intent("a"))], &[]))
        .await
        .unwrap();
    h.settle().await;

    let snapshot = h.scheduler.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].resource, a);
    assert!(matches!(
        h.scheduler.deploy_resource(&b, "manual", TaskPriority::UserDeploy).await,
        Err(SchedulerError::UnknownResource(_))
    ));
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn undefined_resources_block_their_dependants() {
    let h = Harness::start(TestExecutor::default()).await;
    let (a, b, c) = (rid("a"), rid("b"), rid("c"));
    let mut v1 = model(
        1,
        &[(&a, intent("a")), (&b, intent("b")), (&c, intent("c"))],
        &[(&a, &b)],
    );
    v1.undefined.insert(b.clone());
    h.scheduler.new_version(v1).await.unwrap();
    h.settle().await;

    assert_eq!(h.executor.entries(), vec![format!("deploy:{c}")]);
    let snapshot = h.scheduler.snapshot().await;
    let blocked: Vec<&str> = snapshot
        .iter()
        .filter(|s| s.state.blocked)
        .map(|s| s.resource.as_str())
        .collect();
    assert_eq!(blocked, vec![a.as_str(), b.as_str()]);

    // Once defined, both deploy.
    let v2 = model(
        2,
        &[(&a, intent("a")), (&b, intent("b")), (&c, intent("c"))],
        &[(&a, &b)],
    );
    h.scheduler.new_version(v2).await.unwrap();
    h.settle().await;
    assert!(h.position(&format!("deploy:{b}")) < h.position(&format!("deploy:{a}")));
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn invalid_versions_are_rejected() {
    let h = Harness::start(TestExecutor::default()).await;
    let (a, b) = (rid("a"), rid("b"));

    let cyclic = model(1, &[(&a, intent("a")), (&b, intent("b"))], &[(&a, &b), (&b, &a)]);
    assert!(matches!(
        h.scheduler.new_version(cyclic).await,
        Err(SchedulerError::DependencyCycle(_))
    ));

    let dangling = model(1, &[(&a, intent("a"))], &[(&a, &b)]);
    assert!(matches!(
        h.scheduler.new_version(dangling).await,
        Err(SchedulerError::UnknownResource(_))
    ));

    let bad_id = model(1, &[("no brackets here", intent("x"))], &[]);
    assert!(matches!(
        h.scheduler.new_version(bad_id).await,
        Err(SchedulerError::InvalidResourceId(_))
    ));

    assert_eq!(h.scheduler.current_version().await, 0);
    assert!(h.scheduler.snapshot().await.is_empty());
    h.scheduler.stop("test done").await;
}

// ── Outcomes and follow-ups ────────────────────────────────────────

#[tokio::test]
async fn failed_requirement_skips_dependant_until_it_recovers() {
    let executor = TestExecutor::default();
    let (a, b) = (rid("a"), rid("b"));
    executor.fail(&b);
    let h = Harness::start(executor).await;

    h.scheduler
        .new_version(model(1, &[(&a, intent("a")), (&b, intent("b"))], &[(&a, &b)]))
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.status(&b).await, Some(DeployStatus::Failed));
    assert_eq!(h.status(&a).await, Some(DeployStatus::SkippedForDependency));

    h.executor.heal(&b);
    h.scheduler
        .deploy_resource(&b, "retry", TaskPriority::UserDeploy)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.status(&b).await, Some(DeployStatus::Deployed));
    assert_eq!(h.status(&a).await, Some(DeployStatus::Deployed));
    assert_eq!(h.executor.count(&format!("deploy:{a}")), 2);
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn change_events_redeploy_and_reload_listeners() {
    let (a, b) = (rid("a"), rid("b"));
    let h = Harness::start(TestExecutor::default().changing(&[&b])).await;

    let mut sender = intent("b");
    sender.send_event = true;
    let mut listener = intent("a");
    listener.receive_events = true;
    h.scheduler
        .new_version(model(1, &[(&a, listener), (&b, sender)], &[(&a, &b)]))
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.executor.count(&format!("deploy:{a}")), 1);
    assert_eq!(h.executor.count(&format!("reload:{a}")), 1);

    h.scheduler
        .deploy_resource(&b, "manual", TaskPriority::UserDeploy)
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.executor.count(&format!("deploy:{a}")), 2);
    assert_eq!(h.executor.count(&format!("reload:{a}")), 2);
    assert!(h.position(&format!("deploy:{b}")) < h.position(&format!("deploy:{a}")));
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn changes_without_events_leave_dependants_alone() {
    let (a, b) = (rid("a"), rid("b"));
    let h = Harness::start(TestExecutor::default().changing(&[&b])).await;
    h.scheduler
        .new_version(model(1, &[(&a, intent("a")), (&b, intent("b"))], &[(&a, &b)]))
        .await
        .unwrap();
    h.settle().await;

    h.scheduler
        .deploy_resource(&b, "manual", TaskPriority::UserDeploy)
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.executor.count(&format!("deploy:{a}")), 1);
    assert_eq!(h.executor.count(&format!("reload:{a}")), 0);
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn unavailable_executor_marks_agent_resources() {
    let executor = Arc::new(TestExecutor::default());
    let shared = executor.clone();
    let executors = PerAgentExecutors::new(Box::new(move |agent: &str| {
        if agent == "offline" {
            anyhow::bail!("no handler code for agent {agent}");
        }
        Ok(shared.clone() as Arc<dyn Executor>)
    }));
    let h = Harness::start_with(executor, Arc::new(executors)).await;

    let (up, down) = (rid_on("online", "up"), rid_on("offline", "down"));
    h.scheduler
        .new_version(model(1, &[(&up, intent("up")), (&down, intent("down"))], &[]))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.status(&up).await, Some(DeployStatus::Deployed));
    assert_eq!(h.status(&down).await, Some(DeployStatus::Unavailable));
    h.scheduler.stop("test done").await;
}

// ── Triggers ───────────────────────────────────────────────────────

#[tokio::test]
async fn deploy_trigger_skips_clean_resources_and_repair_does_not() {
    let h = Harness::start(TestExecutor::default()).await;
    let (a, b) = (rid("a"), rid("b"));
    h.scheduler
        .new_version(model(1, &[(&a, intent("a")), (&b, intent("b"))], &[]))
        .await
        .unwrap();
    h.settle().await;

    h.scheduler.deploy("user deploy", TaskPriority::UserDeploy).await;
    h.settle().await;
    assert_eq!(h.executor.entries().len(), 2);

    h.scheduler.repair("user repair", TaskPriority::UserRepair).await;
    h.settle().await;
    assert_eq!(h.executor.count(&format!("deploy:{a}")), 2);
    assert_eq!(h.executor.count(&format!("deploy:{b}")), 2);
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn dry_run_reports_are_recorded() {
    let h = Harness::start(TestExecutor::default()).await;
    let (a, b) = (rid("a"), rid("b"));
    h.scheduler
        .new_version(model(1, &[(&a, intent("a")), (&b, intent("b"))], &[]))
        .await
        .unwrap();
    h.settle().await;

    let queued = h.scheduler.dry_run("dr-1", None).await.unwrap();
    assert_eq!(queued, 2);
    h.settle().await;

    let reports = h.store.list_dryrun("dr-1").unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.version == 1));
    assert!(reports[0].result.messages[0].starts_with("would deploy"));

    let only_a = HashSet::from([a.clone()]);
    assert_eq!(h.scheduler.dry_run("dr-2", Some(&only_a)).await.unwrap(), 1);
    h.settle().await;
    assert_eq!(h.store.list_dryrun("dr-2").unwrap().len(), 1);
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn facts_are_refreshed_into_the_store() {
    let h = Harness::start(TestExecutor::default()).await;
    let a = rid("a");
    h.scheduler
        .new_version(model(1, &[(&a, intent("a"))], &[]))
        .await
        .unwrap();
    h.settle().await;

    h.scheduler.refresh_facts(&a).await.unwrap();
    h.settle().await;
    let facts = h.store.get_parameters(&a).unwrap().unwrap();
    assert_eq!(facts["length"], a.len().to_string());

    assert!(matches!(
        h.scheduler.refresh_facts(&rid("missing")).await,
        Err(SchedulerError::UnknownResource(_))
    ));

    h.scheduler.refresh_all_facts("periodic").await;
    h.settle().await;
    assert_eq!(h.executor.count(&format!("facts:{a}")), 2);
    h.scheduler.stop("test done").await;
}

// ── Lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn idle_scheduler_returns_immediately() {
    let h = Harness::start(TestExecutor::default()).await;
    h.settle().await;
    assert!(h.scheduler.queued_tasks().await.is_empty());
    h.scheduler.stop("test done").await;
}

#[tokio::test]
async fn stop_joins_all_workers() {
    let h = Harness::start(TestExecutor::default()).await;
    let resources: Vec<String> = (0..4).map(|i| rid_on(&format!("agent{i}"), "r")).collect();
    let intents: Vec<(&str, ResourceIntent)> = resources
        .iter()
        .map(|r| (r.as_str(), intent(r)))
        .collect();
    h.scheduler.new_version(model(1, &intents, &[])).await.unwrap();
    h.settle().await;
    assert_eq!(h.scheduler.agents().await.len(), 4);

    tokio::time::timeout(Duration::from_secs(10), h.scheduler.stop("shutdown"))
        .await
        .expect("stop finished");
    assert!(h.scheduler.agents().await.is_empty());
}

//! Resource scheduler — the control loop around [`ScheduledWork`].
//!
//! The `ResourceScheduler`:
//! - Accepts model versions and schedules deploys for whatever changed
//! - Runs one worker task per agent that drains that agent's queue
//! - Reports deploy progress and outcome to the state sink
//! - Propagates events and re-triggers dependants after a deploy
//! - Fires periodic deploy, repair and fact-refresh triggers

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use keel_core::config::SchedulerConfig;
use keel_core::{
    DeployResult, DeployStatus, DryRunReport, DryRunResult, ModelVersion, ResourceId,
    ResourceIdStr,
};
use keel_state::StateUpdateManager;

use crate::agent_queues::{queue_get, AgentQueues};
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{ExecutionRequest, ExecutorManager};
use crate::graph::{RequiresMap, RequiresProvides};
use crate::model_state::{ModelState, ResourceDetails, ResourceState};
use crate::scheduled_work::{DeployContext, ScheduledWork};
use crate::task::{DryRunRequest, MotivatedTask, Task, TaskPriority};

/// Where a resource currently sits in the scheduling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingState {
    Unscheduled,
    Waiting,
    Queued,
}

/// Point-in-time view of one resource, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub resource: ResourceIdStr,
    pub attribute_hash: String,
    pub scheduling: SchedulingState,
    /// A deploy is executing right now.
    pub in_progress: bool,
    pub state: ResourceState,
}

/// Everything guarded by the scheduler lock.
struct SchedulerCore {
    model: ModelState,
    work: ScheduledWork,
}

impl AsMut<AgentQueues> for SchedulerCore {
    fn as_mut(&mut self) -> &mut AgentQueues {
        &mut self.work.agent_queues
    }
}

/// State shared between the public handle, agent workers and timers.
struct Shared {
    environment: String,
    core: Mutex<SchedulerCore>,
    executors: Arc<dyn ExecutorManager>,
    state: Arc<dyn StateUpdateManager>,
    idle: Notify,
}

/// The resource scheduler of one environment.
pub struct ResourceScheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    /// Names of agents that got a queue; taken by [`Self::start`].
    new_agents: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    workers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ResourceScheduler {
    /// Create a scheduler. Nothing runs until [`Self::start`].
    pub fn new(
        environment: impl Into<String>,
        config: SchedulerConfig,
        executors: Arc<dyn ExecutorManager>,
        state: Arc<dyn StateUpdateManager>,
    ) -> Self {
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let queues = AgentQueues::new().with_new_agent_notify(Box::new(move |agent: &str| {
            // The receiver only goes away on shutdown.
            let _ = agent_tx.send(agent.to_string());
        }));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                environment: environment.into(),
                core: Mutex::new(SchedulerCore {
                    model: ModelState::default(),
                    work: ScheduledWork::new(queues),
                }),
                executors,
                state,
                idle: Notify::new(),
            }),
            config,
            new_agents: Mutex::new(Some(agent_rx)),
            workers: Arc::new(Mutex::new(HashMap::new())),
            background: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn environment(&self) -> &str {
        &self.shared.environment
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Start the agent supervisor and the configured timers.
    pub async fn start(&self) {
        let Some(mut new_agents) = self.new_agents.lock().await.take() else {
            warn!(environment = %self.shared.environment, "scheduler already started");
            return;
        };

        let mut background = self.background.lock().await;

        // Supervisor: one worker per agent, spawned when its queue appears.
        let shared = self.shared.clone();
        let workers = self.workers.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    agent = new_agents.recv() => {
                        let Some(agent) = agent else { break };
                        let mut workers = workers.lock().await;
                        if workers.contains_key(&agent) {
                            continue;
                        }
                        let handle = tokio::spawn(run_agent_worker(shared.clone(), agent.clone()));
                        workers.insert(agent, handle);
                    }
                    _ = shutdown.changed() => {
                        debug!("agent supervisor shutting down");
                        break;
                    }
                }
            }
        }));

        let timers = [
            (self.config.deploy_interval(), Trigger::Deploy),
            (self.config.repair_interval(), Trigger::Repair),
            (self.config.fact_refresh_interval(), Trigger::RefreshFacts),
        ];
        for (interval, trigger) in timers {
            if let Some(interval) = interval {
                background.push(tokio::spawn(run_timer(
                    self.shared.clone(),
                    trigger,
                    interval,
                    self.shutdown_tx.subscribe(),
                )));
            }
        }

        info!(
            environment = %self.shared.environment,
            timers = background.len() - 1,
            "resource scheduler started"
        );
    }

    /// Stop timers and workers. In-flight deploys finish first; queued work
    /// is abandoned.
    pub async fn stop(&self, reason: &str) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.background.lock().await.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler background task panicked");
            }
        }

        self.shared
            .core
            .lock()
            .await
            .work
            .add_poison_pill_to_agent_queues(reason);

        let workers: Vec<(String, JoinHandle<()>)> = self.workers.lock().await.drain().collect();
        for (agent, handle) in workers {
            if let Err(e) = handle.await {
                error!(%agent, error = %e, "agent worker panicked");
            }
        }
        info!(environment = %self.shared.environment, %reason, "resource scheduler stopped");
    }

    /// Wait until nothing is waiting, queued or in progress.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.core.lock().await.work.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`Self::wait_until_idle`] with an upper bound. Returns whether
    /// the scheduler went idle in time.
    pub async fn wait_until_idle_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_until_idle())
            .await
            .is_ok()
    }

    // ── Model intake ───────────────────────────────────────────────

    /// Make `version` the desired state and schedule what changed.
    pub async fn new_version(&self, version: ModelVersion) -> SchedulerResult<()> {
        self.shared.new_version(version).await
    }

    pub async fn current_version(&self) -> u64 {
        self.shared.core.lock().await.model.version
    }

    // ── Triggers ───────────────────────────────────────────────────

    /// Deploy every resource that is not known to be up to date.
    pub async fn deploy(&self, reason: &str, priority: TaskPriority) {
        self.shared.trigger(Trigger::Deploy, reason, Some(priority)).await;
    }

    /// Deploy every resource, up to date or not.
    pub async fn repair(&self, reason: &str, priority: TaskPriority) {
        self.shared.trigger(Trigger::Repair, reason, Some(priority)).await;
    }

    /// Deploy one resource, even if a deploy of it is running.
    pub async fn deploy_resource(
        &self,
        resource: &str,
        reason: &str,
        priority: TaskPriority,
    ) -> SchedulerResult<()> {
        self.shared.deploy_resource(resource, reason, priority).await
    }

    /// Queue a dry-run for `resources` (all deployable ones if `None`).
    /// Returns the number of resources queued.
    pub async fn dry_run(
        &self,
        dry_run_id: &str,
        resources: Option<&HashSet<ResourceIdStr>>,
    ) -> SchedulerResult<usize> {
        self.shared.dry_run(dry_run_id, resources).await
    }

    /// Queue a fact refresh for one resource.
    pub async fn refresh_facts(&self, resource: &str) -> SchedulerResult<()> {
        self.shared.refresh_facts(resource).await
    }

    /// Queue a fact refresh for every deployable resource.
    pub async fn refresh_all_facts(&self, reason: &str) {
        self.shared.trigger(Trigger::RefreshFacts, reason, None).await;
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// State of every resource of the current version, sorted by id.
    pub async fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let core = self.shared.core.lock().await;
        let mut snapshot: Vec<ResourceSnapshot> = core
            .model
            .resources
            .iter()
            .map(|(resource, details)| {
                let task = Task::deploy(resource.clone());
                let scheduling = if core.work.is_waiting(resource) {
                    SchedulingState::Waiting
                } else if core.work.agent_queues.contains(&task) {
                    SchedulingState::Queued
                } else {
                    SchedulingState::Unscheduled
                };
                ResourceSnapshot {
                    resource: resource.clone(),
                    attribute_hash: details.attribute_hash.clone(),
                    scheduling,
                    in_progress: core.work.agent_queues.is_in_progress(&task),
                    state: core.model.states.get(resource).cloned().unwrap_or_default(),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.resource.cmp(&b.resource));
        snapshot
    }

    /// Live queued tasks, most urgent first, as `(task, priority, reason)`.
    pub async fn queued_tasks(&self) -> Vec<(Task, TaskPriority, String)> {
        self.shared
            .core
            .lock()
            .await
            .work
            .agent_queues
            .queued()
            .into_iter()
            .map(|item| (item.task, item.spec.priority, item.spec.reason))
            .collect()
    }

    pub async fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        agents.sort();
        agents
    }
}

/// Periodic and bulk triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Deploy,
    Repair,
    RefreshFacts,
}

impl Trigger {
    fn timer_priority(self) -> TaskPriority {
        match self {
            Trigger::Deploy => TaskPriority::IntervalDeploy,
            Trigger::Repair => TaskPriority::IntervalRepair,
            Trigger::RefreshFacts => TaskPriority::FactRefresh,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Trigger::Deploy => "deploy",
            Trigger::Repair => "repair",
            Trigger::RefreshFacts => "fact refresh",
        }
    }
}

async fn run_timer(
    shared: Arc<Shared>,
    trigger: Trigger,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(trigger = trigger.label(), interval_secs = interval.as_secs(), "timer starting");
    let reason = format!("periodic {}", trigger.label());
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                shared.trigger(trigger, &reason, None).await;
            }
            _ = shutdown.changed() => {
                debug!(trigger = trigger.label(), "timer shutting down");
                break;
            }
        }
    }
}

impl Shared {
    fn notify_if_idle(&self, core: &SchedulerCore) {
        if core.work.is_idle() {
            self.idle.notify_waiters();
        }
    }

    async fn new_version(&self, version: ModelVersion) -> SchedulerResult<()> {
        validate_version(&version)?;

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let model = &mut core.model;
        let work = &mut core.work;

        // Removed resources.
        let removed: Vec<ResourceIdStr> = model
            .resources
            .keys()
            .filter(|r| !version.resources.contains_key(*r))
            .cloned()
            .collect();
        let mut dropped_requires = RequiresMap::new();
        for resource in &removed {
            work.delete_resource(resource);
            model.graph.remove(resource);
            model.resources.remove(resource);
            model.states.remove(resource);
        }

        // Requires diff against the live graph.
        let mut added_requires = RequiresMap::new();
        for resource in version.resources.keys() {
            let (added, dropped) = model
                .graph
                .update_requires(resource, version.requires_of(resource));
            if !added.is_empty() {
                added_requires.insert(resource.clone(), added);
            }
            if !dropped.is_empty() {
                dropped_requires.insert(resource.clone(), dropped);
            }
        }

        // Undefined resources block themselves and everything above them.
        let blocked = model.graph.transitive_dependants(&version.undefined);
        for (resource, intent) in version.resources {
            let details = ResourceDetails::new(intent);
            let state = model.states.entry(resource.clone()).or_default();
            let was_blocked = state.blocked;
            state.blocked = blocked.contains(&resource);
            if state.blocked && !was_blocked {
                debug!(%resource, "resource blocked on undefined requirement");
                work.delete_resource(&resource);
            }
            model.resources.insert(resource, details);
        }
        model.version = version.version;

        let dirty = model.dirty();
        let deploying = model.deploying_latest();
        let reason = format!("new version {} released", version.version);
        work.deploy_with_context(
            &model.graph,
            &dirty,
            &reason,
            TaskPriority::NewVersionDeploy,
            DeployContext {
                deploying: Some(&deploying),
                added_requires: Some(&added_requires),
                dropped_requires: Some(&dropped_requires),
                force_deploy: false,
            },
        );

        info!(
            environment = %self.environment,
            version = version.version,
            resources = model.resources.len(),
            removed = removed.len(),
            blocked = blocked.len(),
            scheduled = dirty.len(),
            "new version accepted"
        );
        self.notify_if_idle(core);
        Ok(())
    }

    /// `priority` is `None` for timer triggers, which never force a deploy.
    async fn trigger(&self, trigger: Trigger, reason: &str, priority: Option<TaskPriority>) {
        let force_deploy = priority.is_some();
        let priority = priority.unwrap_or(trigger.timer_priority());
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        match trigger {
            Trigger::Deploy | Trigger::Repair => {
                let resources = if trigger == Trigger::Deploy {
                    core.model.dirty()
                } else {
                    core.model.deployable()
                };
                let deploying = core.model.deploying_latest();
                debug!(trigger = trigger.label(), count = resources.len(), %reason, "scheduling deploys");
                core.work.deploy_with_context(
                    &core.model.graph,
                    &resources,
                    reason,
                    priority,
                    DeployContext {
                        deploying: Some(&deploying),
                        force_deploy,
                        ..Default::default()
                    },
                );
            }
            Trigger::RefreshFacts => {
                for resource in core.model.deployable() {
                    core.work
                        .agent_queues
                        .queue_put_nowait(Task::refresh_fact(resource), priority, None, reason);
                }
            }
        }
        self.notify_if_idle(core);
    }

    async fn deploy_resource(
        &self,
        resource: &str,
        reason: &str,
        priority: TaskPriority,
    ) -> SchedulerResult<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if !core.model.resources.contains_key(resource) {
            return Err(SchedulerError::UnknownResource(resource.to_string()));
        }
        if core.model.is_blocked(resource) {
            warn!(%resource, "not deploying blocked resource");
            return Ok(());
        }
        core.work.deploy_with_context(
            &core.model.graph,
            &HashSet::from([resource.to_string()]),
            reason,
            priority,
            DeployContext {
                force_deploy: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn dry_run(
        &self,
        dry_run_id: &str,
        resources: Option<&HashSet<ResourceIdStr>>,
    ) -> SchedulerResult<usize> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let targets: HashSet<ResourceIdStr> = match resources {
            Some(resources) => {
                if let Some(unknown) = resources
                    .iter()
                    .find(|r| !core.model.resources.contains_key(*r))
                {
                    return Err(SchedulerError::UnknownResource(unknown.clone()));
                }
                resources.clone()
            }
            None => core.model.deployable(),
        };

        let reason = format!("dry-run {dry_run_id}");
        let mut queued = 0;
        for resource in targets {
            let request = DryRunRequest {
                dry_run_id: dry_run_id.to_string(),
                version: core.model.version,
                intent: core.model.resources[&resource].intent.clone(),
            };
            if core.work.agent_queues.queue_put_nowait(
                Task::dry_run(resource, request),
                TaskPriority::DryRun,
                None,
                &reason,
            ) {
                queued += 1;
            }
        }
        debug!(%dry_run_id, queued, "dry-run queued");
        Ok(queued)
    }

    async fn refresh_facts(&self, resource: &str) -> SchedulerResult<()> {
        let mut core = self.core.lock().await;
        if !core.model.resources.contains_key(resource) {
            return Err(SchedulerError::UnknownResource(resource.to_string()));
        }
        core.work.agent_queues.queue_put_nowait(
            Task::refresh_fact(resource),
            TaskPriority::FactRefresh,
            None,
            "fact refresh requested",
        );
        Ok(())
    }

    // ── Task execution ─────────────────────────────────────────────

    async fn run_deploy(&self, agent: &str, task: &Task, reason: &str) {
        let resource = task.resource();
        let request = {
            let mut core = self.core.lock().await;
            prepare_deploy(&mut core.model, resource, reason)
        };
        let Some(request) = request else {
            debug!(%resource, "resource left the model or is blocked, skipping deploy");
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            core.work.finished_deploy(&core.model.graph, resource);
            acknowledge(core, agent, task);
            self.notify_if_idle(core);
            return;
        };

        if let Err(e) = self
            .state
            .send_in_progress(resource, &request.attribute_hash)
            .await
        {
            error!(%resource, error = %e, "failed to record deploy start");
        }

        debug!(%agent, %resource, %reason, "deploying");
        let result = self.execute(agent, &request).await;
        info!(
            %agent,
            %resource,
            status = result.status.label(),
            changed = result.changed,
            "deploy finished"
        );

        if let Err(e) = self
            .state
            .send_deploy_done(resource, &request.attribute_hash, &result)
            .await
        {
            error!(%resource, error = %e, "failed to record deploy result");
        }

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        complete_deploy(core, task, &request, &result);
        acknowledge(core, agent, task);
        self.notify_if_idle(core);
    }

    async fn execute(&self, agent: &str, request: &ExecutionRequest) -> DeployResult {
        let executor = match self.executors.get_executor(agent).await {
            Ok(executor) => executor,
            Err(e) => {
                warn!(%agent, error = %e, "no executor available");
                return DeployResult::with_status(
                    DeployStatus::Unavailable,
                    format!("unable to load executor for agent {agent}: {e:#}"),
                );
            }
        };

        let mut result = match executor.execute(request).await {
            Ok(result) => result,
            Err(e) => DeployResult::failed(format!("deploy failed: {e:#}")),
        };

        let reload = request.intent.receive_events
            && request.dependencies.values().any(|dep| dep.changed);
        if result.status.is_success() && reload {
            debug!(resource = %request.resource, "reloading after dependency change");
            if let Err(e) = executor.reload(&request.resource, &request.intent).await {
                result.status = DeployStatus::Failed;
                result.messages.push(format!("reload failed: {e:#}"));
            }
        }
        result
    }

    async fn run_dry_run(&self, agent: &str, resource: &str, request: &DryRunRequest) {
        let result = match self.executors.get_executor(agent).await {
            Ok(executor) => match executor.dry_run(resource, &request.intent).await {
                Ok(result) => result,
                Err(e) => DryRunResult {
                    messages: vec![format!("dry-run failed: {e:#}")],
                    ..Default::default()
                },
            },
            Err(e) => DryRunResult {
                messages: vec![format!("unable to load executor for agent {agent}: {e:#}")],
                ..Default::default()
            },
        };

        let report = DryRunReport {
            dry_run_id: request.dry_run_id.clone(),
            resource: resource.to_string(),
            version: request.version,
            result,
        };
        if let Err(e) = self.state.dryrun_update(&report).await {
            error!(%resource, dry_run_id = %request.dry_run_id, error = %e, "failed to record dry-run");
        }
    }

    async fn run_refresh_facts(&self, agent: &str, resource: &str) {
        let intent = {
            let core = self.core.lock().await;
            core.model.resources.get(resource).map(|d| d.intent.clone())
        };
        let Some(intent) = intent else {
            debug!(%resource, "resource left the model, skipping fact refresh");
            return;
        };

        let facts = match self.executors.get_executor(agent).await {
            Ok(executor) => executor.get_facts(resource, &intent).await,
            Err(e) => Err(e),
        };
        match facts {
            Ok(facts) => {
                if let Err(e) = self.state.set_parameters(resource, &facts).await {
                    error!(%resource, error = %e, "failed to record facts");
                }
            }
            Err(e) => warn!(%resource, error = %e, "fact refresh failed"),
        }
    }
}

/// Drain the queue of one agent until a poison pill arrives.
async fn run_agent_worker(shared: Arc<Shared>, agent: String) {
    info!(%agent, "agent worker started");
    loop {
        let MotivatedTask { task, reason } = queue_get(&shared.core, &agent).await;
        match &task {
            Task::PoisonPill { .. } => {
                info!(%agent, %reason, "agent worker stopping");
                break;
            }
            Task::Deploy { .. } => {
                // Acknowledges the task itself, together with releasing dependants.
                shared.run_deploy(&agent, &task, &reason).await;
                continue;
            }
            Task::DryRun { resource, request } => {
                shared.run_dry_run(&agent, resource, request).await;
            }
            Task::RefreshFact { resource } => {
                shared.run_refresh_facts(&agent, resource).await;
            }
        }

        let mut core = shared.core.lock().await;
        acknowledge(&mut core, &agent, &task);
        shared.notify_if_idle(&core);
    }
}

fn acknowledge(core: &mut SchedulerCore, agent: &str, task: &Task) {
    if let Err(e) = core.work.agent_queues.task_done(agent, task) {
        error!(%agent, %task, error = %e, "task bookkeeping out of sync");
        debug_assert!(false, "task_done failed for {task}: {e}");
    }
}

/// Record the start of a deploy and build its request.
///
/// Returns `None` when the resource left the model or is blocked.
fn prepare_deploy(model: &mut ModelState, resource: &str, reason: &str) -> Option<ExecutionRequest> {
    let details = model.resources.get(resource)?.clone();
    if model.is_blocked(resource) {
        return None;
    }

    let dependencies = model.dependency_states(resource);
    let generation = model.next_generation();
    let state = model.states.entry(resource.to_string()).or_default();
    state.deploying = Some(details.attribute_hash.clone());
    state.last_deploy_start = generation;

    Some(ExecutionRequest {
        resource: resource.to_string(),
        version: model.version,
        intent: details.intent,
        attribute_hash: details.attribute_hash,
        dependencies,
        reason: reason.to_string(),
    })
}

/// Fold a deploy outcome into the model and schedule its follow-ups.
fn complete_deploy(
    core: &mut SchedulerCore,
    task: &Task,
    request: &ExecutionRequest,
    result: &DeployResult,
) {
    let resource = request.resource.as_str();
    let model = &mut core.model;
    let work = &mut core.work;

    let generation = model.next_generation();
    if let Some(state) = model.states.get_mut(resource) {
        state.deploying = None;
        state.last_status = Some(result.status);
        if result.status.is_success() {
            state.deployed_hash = Some(request.attribute_hash.clone());
        }
        if result.changed {
            state.last_change = generation;
        }
    }

    if model.resources.contains_key(resource) {
        let priority = work
            .agent_queues
            .in_progress_priority(task)
            .unwrap_or(TaskPriority::NewVersionDeploy);

        let mut listeners = HashSet::new();
        if result.changed && request.intent.send_event {
            listeners = model.event_listeners(resource);
            if !listeners.is_empty() {
                work.deploy_with_context(
                    &model.graph,
                    &listeners,
                    &format!("dependency {resource} changed"),
                    priority,
                    DeployContext::default(),
                );
            }
        }

        if result.status.is_success() {
            let recovering: HashSet<ResourceIdStr> = model
                .skipped_for_dependency(resource)
                .difference(&listeners)
                .cloned()
                .collect();
            if !recovering.is_empty() {
                work.deploy_with_context(
                    &model.graph,
                    &recovering,
                    &format!("dependency {resource} recovered"),
                    priority,
                    DeployContext::default(),
                );
            }
        }
    }

    work.finished_deploy(&model.graph, resource);
}

fn validate_version(version: &ModelVersion) -> SchedulerResult<()> {
    for resource in version.resources.keys() {
        ResourceId::parse(resource)?;
    }
    for (resource, deps) in &version.requires {
        if !version.resources.contains_key(resource) {
            return Err(SchedulerError::UnknownResource(resource.clone()));
        }
        if let Some(dep) = deps.iter().find(|d| !version.resources.contains_key(*d)) {
            return Err(SchedulerError::UnknownResource(format!(
                "{dep} (required by {resource})"
            )));
        }
    }
    if let Some(undefined) = version
        .undefined
        .iter()
        .find(|r| !version.resources.contains_key(*r))
    {
        return Err(SchedulerError::UnknownResource(undefined.clone()));
    }

    let graph = RequiresProvides::from_requires(&version.requires);
    if let Some(cycle) = graph.find_cycle() {
        return Err(SchedulerError::DependencyCycle(cycle.join(" -> ")));
    }
    Ok(())
}

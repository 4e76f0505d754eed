//! Executor seam — the collaborator that talks to the managed system.
//!
//! The scheduler decides *when* a resource is deployed; an [`Executor`]
//! does the deploying. There is one executor per agent, handed out by an
//! [`ExecutorManager`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use keel_core::{DeployResult, DeployStatus, DryRunResult, Facts, ResourceIdStr, ResourceIntent};

/// Boxed future returned by executor operations.
pub type ExecutorFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// What a dependant knows about one of its requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyState {
    /// Latest finished deploy status; `None` if it never finished one.
    pub status: Option<DeployStatus>,
    /// Reported a change (with events enabled) since the dependant's
    /// previous deploy started.
    pub changed: bool,
}

impl DependencyState {
    pub fn is_deployed(&self) -> bool {
        self.status == Some(DeployStatus::Deployed)
    }
}

/// Everything an executor needs to deploy one resource.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub resource: ResourceIdStr,
    pub version: u64,
    pub intent: ResourceIntent,
    pub attribute_hash: String,
    pub dependencies: HashMap<ResourceIdStr, DependencyState>,
    pub reason: String,
}

impl ExecutionRequest {
    /// All requirements are currently deployed.
    pub fn dependencies_deployed(&self) -> bool {
        self.dependencies.values().all(DependencyState::is_deployed)
    }
}

/// Deploys resources of a single agent.
///
/// An `Err` from [`Executor::execute`] is recorded as a failed deploy.
pub trait Executor: Send + Sync {
    fn execute<'a>(&'a self, request: &'a ExecutionRequest) -> ExecutorFuture<'a, DeployResult>;

    fn dry_run<'a>(
        &'a self,
        resource: &'a str,
        intent: &'a ResourceIntent,
    ) -> ExecutorFuture<'a, DryRunResult>;

    fn get_facts<'a>(&'a self, resource: &'a str, intent: &'a ResourceIntent)
        -> ExecutorFuture<'a, Facts>;

    /// Called after a successful deploy when a requirement reported a change
    /// and the resource receives events.
    fn reload<'a>(&'a self, resource: &'a str, intent: &'a ResourceIntent) -> ExecutorFuture<'a, ()> {
        let _ = (resource, intent);
        Box::pin(async { Ok(()) })
    }
}

/// Hands out the executor of an agent. An `Err` marks the agent's
/// resources unavailable.
pub trait ExecutorManager: Send + Sync {
    fn get_executor<'a>(&'a self, agent: &'a str) -> ExecutorFuture<'a, Arc<dyn Executor>>;
}

/// Factory that builds the executor of an agent.
pub type ExecutorFactory = Box<dyn Fn(&str) -> anyhow::Result<Arc<dyn Executor>> + Send + Sync>;

/// [`ExecutorManager`] that builds executors lazily and keeps one per agent.
pub struct PerAgentExecutors {
    factory: ExecutorFactory,
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl PerAgentExecutors {
    pub fn new(factory: ExecutorFactory) -> Self {
        Self {
            factory,
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Use the same executor for every agent.
    pub fn shared(executor: Arc<dyn Executor>) -> Self {
        Self::new(Box::new(move |_: &str| Ok(executor.clone())))
    }

    pub async fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.executors.read().await.keys().cloned().collect();
        agents.sort();
        agents
    }
}

impl ExecutorManager for PerAgentExecutors {
    fn get_executor<'a>(&'a self, agent: &'a str) -> ExecutorFuture<'a, Arc<dyn Executor>> {
        Box::pin(async move {
            if let Some(executor) = self.executors.read().await.get(agent) {
                return Ok(executor.clone());
            }

            let mut executors = self.executors.write().await;
            if let Some(executor) = executors.get(agent) {
                return Ok(executor.clone());
            }
            let executor = (self.factory)(agent)?;
            debug!(%agent, "executor created");
            executors.insert(agent.to_string(), executor.clone());
            Ok(executor)
        })
    }
}

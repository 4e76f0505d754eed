//! keel-scheduler — dependency-aware deploy scheduling.
//!
//! Keeps a desired model of resources converged on the managed systems.
//! The scheduler:
//!
//! - Diffs each new model version against what it knows was deployed
//! - Holds deploys back until the resources they require are deployed
//! - Runs one worker per agent, most urgent task first
//! - Re-prioritizes or cancels queued work as intent changes
//!
//! # Architecture
//!
//! ```text
//! ResourceScheduler
//!   ├── ModelState (intents, requires/provides graph, per-resource state)
//!   ├── ScheduledWork
//!   │     ├── waiting: BlockedDeploy per resource (blocked_on requirements)
//!   │     └── AgentQueues (per-agent heap + in-progress set)
//!   ├── agent workers (one tokio task per agent, queue_get → Executor)
//!   ├── ExecutorManager (one Executor per agent)
//!   └── StateUpdateManager (deploy progress, results, facts, dry-runs)
//! ```
//!
//! `ScheduledWork` and `AgentQueues` are synchronous; the scheduler owns
//! them behind a single lock and only the wait for new work is async.

pub mod agent_queues;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model_state;
pub mod scheduled_work;
pub mod scheduler;
pub mod task;

pub use agent_queues::{queue_get, AgentQueues, NewAgentNotify};
pub use error::{SchedulerError, SchedulerResult};
pub use executor::{
    DependencyState, ExecutionRequest, Executor, ExecutorFactory, ExecutorFuture,
    ExecutorManager, PerAgentExecutors,
};
pub use graph::{RequiresMap, RequiresProvides};
pub use model_state::{ResourceDetails, ResourceState};
pub use scheduled_work::{DeployContext, ScheduledWork};
pub use scheduler::{ResourceScheduler, ResourceSnapshot, SchedulingState};
pub use task::{
    BlockedDeploy, DryRunRequest, MotivatedTask, Task, TaskKind, TaskPriority, TaskQueueItem,
    TaskSpec,
};

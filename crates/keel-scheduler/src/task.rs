//! Task model — the units of work queued per agent.
//!
//! A [`Task`] identifies *what* to do for a resource. Its identity is the
//! pair (kind, resource id): two deploys of the same resource are the same
//! task no matter when they were requested. Scheduling metadata lives next
//! to the task in a [`TaskSpec`].

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use keel_core::{agent_of, ResourceIdStr, ResourceIntent};

/// Resource id used for the shutdown sentinel.
pub const POISON_PILL_RESOURCE: &str = "system::Terminate[all,stop=True]";

/// Urgency of a task. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum TaskPriority {
    /// Shutdown sentinel.
    Terminated = -1,
    UserDeploy = 0,
    NewVersionDeploy = 1,
    UserRepair = 2,
    DryRun = 3,
    IntervalDeploy = 4,
    FactRefresh = 5,
    IntervalRepair = 6,
}

impl TaskPriority {
    pub fn is_more_urgent_than(self, other: TaskPriority) -> bool {
        self < other
    }
}

/// Discriminant of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    Deploy,
    DryRun,
    RefreshFact,
    PoisonPill,
}

/// A dry-run is pinned to the version and intent it was requested for.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunRequest {
    pub dry_run_id: String,
    pub version: u64,
    pub intent: ResourceIntent,
}

/// A unit of work for one resource.
#[derive(Debug, Clone)]
pub enum Task {
    Deploy {
        resource: ResourceIdStr,
    },
    DryRun {
        resource: ResourceIdStr,
        request: Arc<DryRunRequest>,
    },
    RefreshFact {
        resource: ResourceIdStr,
    },
    PoisonPill {
        resource: ResourceIdStr,
    },
}

impl Task {
    pub fn deploy(resource: impl Into<ResourceIdStr>) -> Self {
        Task::Deploy {
            resource: resource.into(),
        }
    }

    pub fn refresh_fact(resource: impl Into<ResourceIdStr>) -> Self {
        Task::RefreshFact {
            resource: resource.into(),
        }
    }

    pub fn dry_run(resource: impl Into<ResourceIdStr>, request: DryRunRequest) -> Self {
        Task::DryRun {
            resource: resource.into(),
            request: Arc::new(request),
        }
    }

    pub fn poison_pill() -> Self {
        Task::PoisonPill {
            resource: POISON_PILL_RESOURCE.to_string(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Deploy { .. } => TaskKind::Deploy,
            Task::DryRun { .. } => TaskKind::DryRun,
            Task::RefreshFact { .. } => TaskKind::RefreshFact,
            Task::PoisonPill { .. } => TaskKind::PoisonPill,
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            Task::Deploy { resource }
            | Task::DryRun { resource, .. }
            | Task::RefreshFact { resource }
            | Task::PoisonPill { resource } => resource,
        }
    }

    /// The agent whose queue this task belongs to.
    pub fn agent(&self) -> &str {
        agent_of(self.resource())
    }

    /// Whether the task should be dropped when its resource leaves the model.
    ///
    /// Dry-runs pin a specific version, so they outlive the resource.
    pub fn delete_with_resource(&self) -> bool {
        match self {
            Task::Deploy { .. } | Task::RefreshFact { .. } => true,
            Task::DryRun { .. } | Task::PoisonPill { .. } => false,
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.resource() == other.resource()
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.resource().hash(state);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind() {
            TaskKind::Deploy => "deploy",
            TaskKind::DryRun => "dry-run",
            TaskKind::RefreshFact => "refresh-fact",
            TaskKind::PoisonPill => "poison-pill",
        };
        write!(f, "{kind} {}", self.resource())
    }
}

/// Scheduling metadata of a queued or waiting task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub priority: TaskPriority,
    /// Monotonic request counter. Breaks ties within a priority (FIFO).
    pub requested_at: u64,
    /// Human-readable motivation, carried through to the executor.
    pub reason: String,
}

/// A task as handed to an agent worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotivatedTask {
    pub task: Task,
    pub reason: String,
}

/// An entry in an agent's priority queue.
///
/// Entries are never removed from the heap directly. An entry is a
/// tombstone once the queue's index no longer holds exactly its `spec`
/// for its task; consumers discard tombstones when they pop them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueueItem {
    pub task: Task,
    pub spec: TaskSpec,
}

impl Ord for TaskQueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for BinaryHeap (max-heap): most urgent, then oldest request first.
        other
            .spec
            .priority
            .cmp(&self.spec.priority)
            .then_with(|| other.spec.requested_at.cmp(&self.spec.requested_at))
            // Break ties on identity so the order agrees with Eq.
            .then_with(|| other.task.kind().cmp(&self.task.kind()))
            .then_with(|| other.task.resource().cmp(self.task.resource()))
            .then_with(|| other.spec.reason.cmp(&self.spec.reason))
    }
}

impl PartialOrd for TaskQueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A deploy that is wanted but waits for some of its requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedDeploy {
    pub resource: ResourceIdStr,
    /// Requirements that are themselves still scheduled.
    pub blocked_on: HashSet<ResourceIdStr>,
    pub spec: TaskSpec,
}

impl BlockedDeploy {
    pub fn task(&self) -> Task {
        Task::deploy(self.resource.clone())
    }
}

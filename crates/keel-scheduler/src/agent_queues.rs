//! Per-agent priority queues with lazy deletion.
//!
//! Every agent gets its own heap of [`TaskQueueItem`]s. Removal and
//! re-prioritization never touch the heap: the side index
//! `tasks_by_resource` is the source of truth, and a heap entry whose spec
//! no longer matches the index is a tombstone that consumers skip.
//!
//! At most one live entry exists per task across all queues. Tasks handed
//! out to a worker move into `in_progress` until the worker calls
//! [`AgentQueues::task_done`].

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use keel_core::ResourceIdStr;

use crate::error::{SchedulerError, SchedulerResult};
use crate::task::{MotivatedTask, Task, TaskKind, TaskPriority, TaskQueueItem, TaskSpec};

/// Callback invoked with the agent name whenever a new agent queue is created.
pub type NewAgentNotify = Box<dyn Fn(&str) + Send + Sync>;

struct AgentQueue {
    heap: BinaryHeap<TaskQueueItem>,
    /// Wakes the consumer of this queue. Holds at most one permit.
    notify: Arc<Notify>,
}

impl AgentQueue {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// The ready queues of all agents.
pub struct AgentQueues {
    queues: HashMap<String, AgentQueue>,
    /// Live queued tasks, by resource. Source of truth for liveness.
    tasks_by_resource: HashMap<ResourceIdStr, HashMap<Task, TaskSpec>>,
    /// Tasks handed to a worker and not yet acknowledged.
    in_progress: HashMap<Task, TaskPriority>,
    next_requested_at: u64,
    new_agent_notify: Option<NewAgentNotify>,
}

impl Default for AgentQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentQueues {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            tasks_by_resource: HashMap::new(),
            in_progress: HashMap::new(),
            next_requested_at: 1,
            new_agent_notify: None,
        }
    }

    /// Register a callback for newly created agent queues.
    pub fn with_new_agent_notify(mut self, notify: NewAgentNotify) -> Self {
        self.new_agent_notify = Some(notify);
        self
    }

    /// Hand out the next request counter value. Strictly increasing.
    pub fn reserve_requested_at(&mut self) -> u64 {
        let value = self.next_requested_at;
        self.next_requested_at += 1;
        value
    }

    fn queue_mut(&mut self, agent: &str) -> &mut AgentQueue {
        if !self.queues.contains_key(agent) {
            debug!(%agent, "creating agent queue");
            if let Some(notify) = &self.new_agent_notify {
                notify(agent);
            }
        }
        self.queues
            .entry(agent.to_string())
            .or_insert_with(AgentQueue::new)
    }

    /// The wakeup handle of an agent's queue, creating the queue if needed.
    pub fn notifier(&mut self, agent: &str) -> Arc<Notify> {
        self.queue_mut(agent).notify.clone()
    }

    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.queues.keys().cloned().collect();
        agents.sort();
        agents
    }

    // ── Producers ──────────────────────────────────────────────────

    /// Queue `task`, or raise the priority of its queued entry.
    ///
    /// Returns `true` if a new heap entry was pushed. An already queued
    /// task is only re-queued when `priority` is strictly more urgent;
    /// otherwise the call is a no-op. A fresh `requested_at` is drawn
    /// unless one is given.
    pub fn queue_put_nowait(
        &mut self,
        task: Task,
        priority: TaskPriority,
        requested_at: Option<u64>,
        reason: &str,
    ) -> bool {
        if let Some(existing) = self
            .tasks_by_resource
            .get(task.resource())
            .and_then(|tasks| tasks.get(&task))
        {
            if !priority.is_more_urgent_than(existing.priority) {
                return false;
            }
            debug!(%task, ?priority, previous = ?existing.priority, "raising queued task priority");
        }

        let spec = TaskSpec {
            priority,
            requested_at: requested_at.unwrap_or_else(|| self.reserve_requested_at()),
            reason: reason.to_string(),
        };
        self.tasks_by_resource
            .entry(task.resource().to_string())
            .or_default()
            .insert(task.clone(), spec.clone());

        let queue = self.queue_mut(&task.agent().to_string());
        queue.heap.push(TaskQueueItem { task, spec });
        queue.notify.notify_one();
        true
    }

    /// Put a shutdown sentinel at the front of every agent queue.
    pub fn send_shutdown(&mut self, reason: &str) {
        for (agent, queue) in self.queues.iter_mut() {
            debug!(%agent, %reason, "sending poison pill");
            queue.heap.push(TaskQueueItem {
                task: Task::poison_pill(),
                spec: TaskSpec {
                    priority: TaskPriority::Terminated,
                    requested_at: 0,
                    reason: reason.to_string(),
                },
            });
            queue.notify.notify_one();
        }
    }

    // ── Consumers ──────────────────────────────────────────────────

    /// Pop the most urgent live task of `agent`, if any.
    ///
    /// Tombstones are dropped on the way. Returned tasks (other than the
    /// shutdown sentinel) are in progress until [`Self::task_done`].
    pub fn queue_get_nowait(&mut self, agent: &str) -> Option<MotivatedTask> {
        let queue = self.queues.get_mut(agent)?;
        while let Some(item) = queue.heap.pop() {
            let TaskQueueItem { task, spec } = item;
            if task.kind() == TaskKind::PoisonPill {
                return Some(MotivatedTask {
                    task,
                    reason: spec.reason,
                });
            }

            let live = match self.tasks_by_resource.get_mut(task.resource()) {
                Some(tasks) if tasks.get(&task) == Some(&spec) => {
                    tasks.remove(&task);
                    if tasks.is_empty() {
                        self.tasks_by_resource.remove(task.resource());
                    }
                    true
                }
                _ => false,
            };
            if !live {
                continue;
            }

            self.in_progress.insert(task.clone(), spec.priority);
            return Some(MotivatedTask {
                task,
                reason: spec.reason,
            });
        }
        None
    }

    /// Acknowledge a task previously returned by [`Self::queue_get_nowait`].
    pub fn task_done(&mut self, agent: &str, task: &Task) -> SchedulerResult<()> {
        if task.kind() == TaskKind::PoisonPill {
            return Ok(());
        }
        if self.in_progress.remove(task).is_none() {
            warn!(%agent, %task, "acknowledged a task that was not in progress");
            return Err(SchedulerError::TaskNotInProgress(task.to_string()));
        }
        Ok(())
    }

    // ── Removal ────────────────────────────────────────────────────

    /// Drop the queued entry of `task`, returning its spec if it was queued.
    pub fn discard(&mut self, task: &Task) -> Option<TaskSpec> {
        let tasks = self.tasks_by_resource.get_mut(task.resource())?;
        let spec = tasks.remove(task)?;
        if tasks.is_empty() {
            self.tasks_by_resource.remove(task.resource());
        }
        Some(spec)
    }

    /// Like [`Self::discard`], but the task must be queued.
    pub fn remove(&mut self, task: &Task) -> SchedulerResult<TaskSpec> {
        self.discard(task)
            .ok_or_else(|| SchedulerError::TaskNotQueued(task.to_string()))
    }

    // ── In-progress bookkeeping ────────────────────────────────────

    /// Raise the recorded priority of in-progress deploys of `resources`.
    pub fn bump_in_progress_priorities<'a>(
        &mut self,
        resources: impl IntoIterator<Item = &'a ResourceIdStr>,
        priority: TaskPriority,
    ) {
        for resource in resources {
            let task = Task::deploy(resource.clone());
            if let Some(current) = self.in_progress.get_mut(&task) {
                if priority.is_more_urgent_than(*current) {
                    *current = priority;
                }
            }
        }
    }

    pub fn in_progress_priority(&self, task: &Task) -> Option<TaskPriority> {
        self.in_progress.get(task).copied()
    }

    pub fn is_in_progress(&self, task: &Task) -> bool {
        self.in_progress.contains_key(task)
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Whether `task` has a live queued entry.
    pub fn contains(&self, task: &Task) -> bool {
        self.tasks_by_resource
            .get(task.resource())
            .is_some_and(|tasks| tasks.contains_key(task))
    }

    pub fn get_tasks_for_resource(&self, resource: &str) -> Vec<Task> {
        self.tasks_by_resource
            .get(resource)
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All live queued tasks, most urgent first.
    pub fn queued(&self) -> Vec<TaskQueueItem> {
        let mut items: Vec<TaskQueueItem> = self
            .tasks_by_resource
            .values()
            .flat_map(|tasks| {
                tasks.iter().map(|(task, spec)| TaskQueueItem {
                    task: task.clone(),
                    spec: spec.clone(),
                })
            })
            .collect();
        items.sort_by(|a, b| b.cmp(a));
        items
    }

    /// Nothing queued and nothing in progress.
    pub fn is_idle(&self) -> bool {
        self.tasks_by_resource.is_empty() && self.in_progress.is_empty()
    }

    /// Drop all queued and in-progress work.
    ///
    /// Agent queues and their wakeup handles are kept so that waiting
    /// consumers stay attached. The request counter keeps counting.
    pub fn reset(&mut self) {
        for queue in self.queues.values_mut() {
            queue.heap.clear();
        }
        self.tasks_by_resource.clear();
        self.in_progress.clear();
    }
}

/// Wait for the next task of `agent`.
///
/// The lock is only held while popping; between attempts the caller parks
/// on the agent's [`Notify`]. Each agent must have a single consumer.
pub async fn queue_get<W>(work: &Mutex<W>, agent: &str) -> MotivatedTask
where
    W: AsMut<AgentQueues>,
{
    let notify = {
        let mut guard = work.lock().await;
        guard.as_mut().notifier(agent)
    };
    loop {
        let next = {
            let mut guard = work.lock().await;
            guard.as_mut().queue_get_nowait(agent)
        };
        if let Some(task) = next {
            return task;
        }
        notify.notified().await;
    }
}

impl AsMut<AgentQueues> for AgentQueues {
    fn as_mut(&mut self) -> &mut AgentQueues {
        self
    }
}

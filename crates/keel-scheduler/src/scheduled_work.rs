//! Scheduled work — the waiting room in front of the agent queues.
//!
//! A deploy is *scheduled* when it is waiting, queued or in progress. A
//! waiting deploy ([`BlockedDeploy`]) lists the requirements that are
//! themselves scheduled; it moves to its agent's ready queue the moment
//! that list becomes empty.
//!
//! ```text
//!   deploy_with_context ──► waiting ──(blocked_on empty)──► agent queue
//!                              ▲                                 │
//!                              │                          queue_get (worker)
//!                              │                                 ▼
//!                   finished_deploy ◄──────────────────────── in progress
//! ```
//!
//! All operations here are synchronous. The owner serializes them behind
//! its lock and passes the live dependency graph in on every call.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use keel_core::ResourceIdStr;

use crate::agent_queues::AgentQueues;
use crate::graph::{RequiresMap, RequiresProvides};
use crate::task::{BlockedDeploy, Task, TaskPriority, TaskSpec};

/// Optional context for [`ScheduledWork::deploy_with_context`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DeployContext<'a> {
    /// Resources being deployed right now for their latest intent. They
    /// count as scheduled and only get a second deploy when forced.
    pub deploying: Option<&'a HashSet<ResourceIdStr>>,
    /// Requirements added since the previous call.
    pub added_requires: Option<&'a RequiresMap>,
    /// Requirements dropped since the previous call.
    pub dropped_requires: Option<&'a RequiresMap>,
    /// Schedule even if an equivalent deploy is in progress.
    pub force_deploy: bool,
}

/// Memoized "is this resource scheduled" answers for one call.
struct ScheduleCache {
    scheduled: HashSet<ResourceIdStr>,
    not_scheduled: HashSet<ResourceIdStr>,
}

impl ScheduleCache {
    fn new(deploying: &HashSet<ResourceIdStr>) -> Self {
        Self {
            scheduled: deploying.clone(),
            not_scheduled: HashSet::new(),
        }
    }

    fn is_scheduled(
        &mut self,
        waiting: &HashMap<ResourceIdStr, BlockedDeploy>,
        queues: &AgentQueues,
        resource: &str,
    ) -> bool {
        if waiting.contains_key(resource) || self.scheduled.contains(resource) {
            return true;
        }
        if self.not_scheduled.contains(resource) {
            return false;
        }
        let task = Task::deploy(resource);
        let scheduled = queues.contains(&task) || queues.is_in_progress(&task);
        if scheduled {
            self.scheduled.insert(resource.to_string());
        } else {
            self.not_scheduled.insert(resource.to_string());
        }
        scheduled
    }

    fn mark_scheduled(&mut self, resource: &str) {
        self.not_scheduled.remove(resource);
        self.scheduled.insert(resource.to_string());
    }
}

/// Waiting deploys plus the per-agent ready queues.
pub struct ScheduledWork {
    pub agent_queues: AgentQueues,
    waiting: HashMap<ResourceIdStr, BlockedDeploy>,
}

impl AsMut<AgentQueues> for ScheduledWork {
    fn as_mut(&mut self) -> &mut AgentQueues {
        &mut self.agent_queues
    }
}

impl ScheduledWork {
    pub fn new(agent_queues: AgentQueues) -> Self {
        Self {
            agent_queues,
            waiting: HashMap::new(),
        }
    }

    pub fn waiting(&self) -> &HashMap<ResourceIdStr, BlockedDeploy> {
        &self.waiting
    }

    pub fn is_waiting(&self, resource: &str) -> bool {
        self.waiting.contains_key(resource)
    }

    pub fn blocked_on(&self, resource: &str) -> Option<&HashSet<ResourceIdStr>> {
        self.waiting.get(resource).map(|b| &b.blocked_on)
    }

    /// Nothing waiting, queued or in progress.
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.agent_queues.is_idle()
    }

    /// Schedule a deploy of every resource in `resources`.
    ///
    /// Already scheduled deploys are kept and only raised in priority. New
    /// deploys wait on whichever of their requirements are scheduled, and
    /// scheduled dependants of a newly scheduled resource start waiting on
    /// it (pulled back from the ready queue if need be).
    pub fn deploy_with_context(
        &mut self,
        graph: &RequiresProvides,
        resources: &HashSet<ResourceIdStr>,
        reason: &str,
        priority: TaskPriority,
        context: DeployContext<'_>,
    ) {
        let no_deploying = HashSet::new();
        let deploying = context.deploying.unwrap_or(&no_deploying);

        self.agent_queues
            .bump_in_progress_priorities(resources.intersection(deploying), priority);

        let mut maybe_runnable: HashSet<ResourceIdStr> = HashSet::new();

        // A dependency that no longer exists can never block.
        if let Some(dropped) = context.dropped_requires {
            for (resource, deps) in dropped {
                if let Some(blocked) = self.waiting.get_mut(resource) {
                    blocked.blocked_on.retain(|dep| !deps.contains(dep));
                    maybe_runnable.insert(resource.clone());
                }
            }
        }

        let mut cache = ScheduleCache::new(deploying);

        if let Some(added) = context.added_requires {
            for (resource, deps) in added {
                if !cache.is_scheduled(&self.waiting, &self.agent_queues, resource) {
                    continue;
                }
                let blockers: HashSet<ResourceIdStr> = deps
                    .iter()
                    .filter(|dep| cache.is_scheduled(&self.waiting, &self.agent_queues, dep))
                    .cloned()
                    .collect();
                self.extend_blocked_on(resource, blockers, priority);
            }
        }

        for resource in resources {
            if let Some(blocked) = self.waiting.get_mut(resource) {
                if priority.is_more_urgent_than(blocked.spec.priority) {
                    blocked.spec = TaskSpec {
                        priority,
                        requested_at: self.agent_queues.reserve_requested_at(),
                        reason: reason.to_string(),
                    };
                }
                continue;
            }

            let task = Task::deploy(resource.clone());
            if self.agent_queues.contains(&task) {
                self.agent_queues
                    .queue_put_nowait(task, priority, None, reason);
                continue;
            }
            if deploying.contains(resource) && !context.force_deploy {
                continue;
            }

            let blocked_on: HashSet<ResourceIdStr> = graph
                .requires_of(resource)
                .filter(|dep| cache.is_scheduled(&self.waiting, &self.agent_queues, dep))
                .cloned()
                .collect();
            let spec = TaskSpec {
                priority,
                requested_at: self.agent_queues.reserve_requested_at(),
                reason: reason.to_string(),
            };
            self.waiting.insert(
                resource.clone(),
                BlockedDeploy {
                    resource: resource.clone(),
                    blocked_on,
                    spec,
                },
            );
            cache.mark_scheduled(resource);
            maybe_runnable.insert(resource.clone());

            let dependants: Vec<ResourceIdStr> = graph
                .provides_of(resource)
                .filter(|dependant| {
                    cache.is_scheduled(&self.waiting, &self.agent_queues, dependant)
                })
                .cloned()
                .collect();
            for dependant in dependants {
                self.extend_blocked_on(&dependant, HashSet::from([resource.clone()]), priority);
            }
        }

        for resource in maybe_runnable {
            if self
                .waiting
                .get(&resource)
                .is_some_and(|blocked| blocked.blocked_on.is_empty())
            {
                self.queue_waiting(&resource);
            }
        }
    }

    /// Make a scheduled resource additionally wait on `blockers`.
    fn extend_blocked_on(
        &mut self,
        resource: &str,
        blockers: HashSet<ResourceIdStr>,
        priority: TaskPriority,
    ) {
        if blockers.is_empty() {
            return;
        }
        if let Some(blocked) = self.waiting.get_mut(resource) {
            blocked.blocked_on.extend(blockers);
            return;
        }

        let task = Task::deploy(resource);
        let spec = match self.agent_queues.discard(&task) {
            Some(spec) => {
                debug!(%resource, "moving ready deploy back to waiting");
                spec
            }
            None => {
                // Only in progress: that deploy predates the new requirement.
                TaskSpec {
                    priority: self
                        .agent_queues
                        .in_progress_priority(&task)
                        .unwrap_or(priority),
                    requested_at: self.agent_queues.reserve_requested_at(),
                    reason: "new requirement scheduled while deploying".to_string(),
                }
            }
        };
        self.waiting.insert(
            resource.to_string(),
            BlockedDeploy {
                resource: resource.to_string(),
                blocked_on: blockers,
                spec,
            },
        );
    }

    /// Move a waiting deploy to its agent queue, keeping its request order.
    fn queue_waiting(&mut self, resource: &str) {
        let Some(blocked) = self.waiting.remove(resource) else {
            return;
        };
        let BlockedDeploy { resource, spec, .. } = blocked;
        self.agent_queues.queue_put_nowait(
            Task::deploy(resource),
            spec.priority,
            Some(spec.requested_at),
            &spec.reason,
        );
    }

    /// Report that a deploy of `resource` finished.
    ///
    /// Dependants are only released when no newer deploy of `resource` is
    /// scheduled; otherwise they keep waiting for that one.
    pub fn finished_deploy(&mut self, graph: &RequiresProvides, resource: &str) {
        if self.waiting.contains_key(resource)
            || self.agent_queues.contains(&Task::deploy(resource))
        {
            debug!(%resource, "stale deploy finished, dependants stay blocked");
            return;
        }

        let mut ready = Vec::new();
        for dependant in graph.provides_of(resource) {
            if let Some(blocked) = self.waiting.get_mut(dependant) {
                blocked.blocked_on.remove(resource);
                if blocked.blocked_on.is_empty() {
                    ready.push(dependant.clone());
                }
            }
        }
        for dependant in ready {
            self.queue_waiting(&dependant);
        }
    }

    /// Forget all scheduled work of a resource that left the model.
    ///
    /// Dry-runs survive; waiting dependants stop waiting on it.
    pub fn delete_resource(&mut self, resource: &str) {
        self.waiting.remove(resource);
        for task in self.agent_queues.get_tasks_for_resource(resource) {
            if task.delete_with_resource() {
                self.agent_queues.discard(&task);
            }
        }

        let ready: Vec<ResourceIdStr> = self
            .waiting
            .values_mut()
            .filter_map(|blocked| {
                let released = blocked.blocked_on.remove(resource) && blocked.blocked_on.is_empty();
                released.then(|| blocked.resource.clone())
            })
            .collect();
        for dependant in ready {
            self.queue_waiting(&dependant);
        }
    }

    pub fn add_poison_pill_to_agent_queues(&mut self, reason: &str) {
        self.agent_queues.send_shutdown(reason);
    }

    /// Drop all waiting, queued and in-progress bookkeeping.
    pub fn reset(&mut self) {
        self.waiting.clear();
        self.agent_queues.reset();
    }
}

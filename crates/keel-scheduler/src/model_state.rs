//! In-memory view of the current model and what has been deployed of it.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use keel_core::{DeployStatus, ResourceIdStr, ResourceIntent};

use crate::executor::DependencyState;
use crate::graph::RequiresProvides;

/// Desired state of a resource in the current version.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDetails {
    pub intent: ResourceIntent,
    pub attribute_hash: String,
}

impl ResourceDetails {
    pub fn new(intent: ResourceIntent) -> Self {
        let attribute_hash = intent.attribute_hash();
        Self {
            intent,
            attribute_hash,
        }
    }
}

/// Deploy bookkeeping of one resource.
///
/// Generations come from [`ModelState::next_generation`] and only order
/// events relative to each other; 0 means "never".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceState {
    /// Hash of the last intent that deployed successfully.
    pub deployed_hash: Option<String>,
    pub last_status: Option<DeployStatus>,
    /// Hash being deployed right now, if any.
    pub deploying: Option<String>,
    /// The resource or one of its requirements is undefined.
    pub blocked: bool,
    /// Generation at which a deploy last reported a change.
    pub last_change: u64,
    /// Generation at which the last deploy started.
    pub last_deploy_start: u64,
}

impl ResourceState {
    /// The managed system may not match `attribute_hash`.
    pub fn is_dirty(&self, attribute_hash: &str) -> bool {
        self.last_status != Some(DeployStatus::Deployed)
            || self.deployed_hash.as_deref() != Some(attribute_hash)
    }
}

#[derive(Debug, Default)]
pub struct ModelState {
    pub version: u64,
    pub resources: HashMap<ResourceIdStr, ResourceDetails>,
    pub states: HashMap<ResourceIdStr, ResourceState>,
    pub graph: RequiresProvides,
    generation: u64,
}

impl ModelState {
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn is_blocked(&self, resource: &str) -> bool {
        self.states.get(resource).is_some_and(|s| s.blocked)
    }

    /// Unblocked resources of the current version.
    pub fn deployable(&self) -> HashSet<ResourceIdStr> {
        self.resources
            .keys()
            .filter(|r| !self.is_blocked(r))
            .cloned()
            .collect()
    }

    /// Unblocked resources whose latest intent is not known to be deployed.
    pub fn dirty(&self) -> HashSet<ResourceIdStr> {
        self.resources
            .iter()
            .filter(|(resource, details)| {
                self.states
                    .get(*resource)
                    .is_none_or(|s| !s.blocked && s.is_dirty(&details.attribute_hash))
            })
            .map(|(resource, _)| resource.clone())
            .collect()
    }

    /// Resources whose in-flight deploy is for their current intent.
    pub fn deploying_latest(&self) -> HashSet<ResourceIdStr> {
        self.resources
            .iter()
            .filter(|(resource, details)| {
                self.states
                    .get(*resource)
                    .and_then(|s| s.deploying.as_deref())
                    == Some(details.attribute_hash.as_str())
            })
            .map(|(resource, _)| resource.clone())
            .collect()
    }

    /// What `resource` should know about its requirements, relative to its
    /// previous deploy start.
    pub fn dependency_states(&self, resource: &str) -> HashMap<ResourceIdStr, DependencyState> {
        let since = self
            .states
            .get(resource)
            .map(|s| s.last_deploy_start)
            .unwrap_or_default();
        self.graph
            .requires_of(resource)
            .map(|dep| {
                let state = self.states.get(dep);
                let sends_events = self
                    .resources
                    .get(dep)
                    .is_some_and(|d| d.intent.send_event);
                let dependency = DependencyState {
                    status: state.and_then(|s| s.last_status),
                    changed: sends_events && state.is_some_and(|s| s.last_change > since),
                };
                (dep.clone(), dependency)
            })
            .collect()
    }

    /// Dependants that listen for events of `resource`.
    pub fn event_listeners(&self, resource: &str) -> HashSet<ResourceIdStr> {
        self.graph
            .provides_of(resource)
            .filter(|dependant| {
                !self.is_blocked(dependant)
                    && self
                        .resources
                        .get(*dependant)
                        .is_some_and(|d| d.intent.receive_events)
            })
            .cloned()
            .collect()
    }

    /// Dependants whose last deploy was skipped because of a requirement.
    pub fn skipped_for_dependency(&self, resource: &str) -> HashSet<ResourceIdStr> {
        self.graph
            .provides_of(resource)
            .filter(|dependant| {
                self.resources.contains_key(*dependant)
                    && self.states.get(*dependant).is_some_and(|s| {
                        !s.blocked && s.last_status == Some(DeployStatus::SkippedForDependency)
                    })
            })
            .cloned()
            .collect()
    }
}

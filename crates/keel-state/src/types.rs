//! Persisted record types for the Keel state store.

use serde::{Deserialize, Serialize};

use keel_core::{DeployResult, DeployStatus, ResourceIdStr};

/// Last known deploy state of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceStateRecord {
    pub resource: ResourceIdStr,
    /// A deploy is in flight.
    pub deploying: bool,
    /// Attribute hash of the most recently started deploy.
    pub attribute_hash: String,
    /// Outcome of the most recent finished deploy.
    pub last_result: Option<DeployResult>,
    /// Unix timestamp of the last successful deploy.
    pub last_success: Option<u64>,
    /// Unix timestamp of the last change to this record.
    pub updated_at: u64,
}

impl ResourceStateRecord {
    pub fn new(resource: &str, attribute_hash: &str, now: u64) -> Self {
        Self {
            resource: resource.to_string(),
            deploying: false,
            attribute_hash: attribute_hash.to_string(),
            last_result: None,
            last_success: None,
            updated_at: now,
        }
    }

    pub fn last_status(&self) -> Option<DeployStatus> {
        self.last_result.as_ref().map(|r| r.status)
    }
}

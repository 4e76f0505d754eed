//! Shared types used across Keel crates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::resource_id::ResourceIdStr;

/// Facts (parameters) discovered for a resource.
pub type Facts = BTreeMap<String, String>;

// ── Intent ────────────────────────────────────────────────────────

/// Desired state of a single resource in one model version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceIntent {
    /// Handler-specific desired attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Notify dependants when a deploy of this resource changes something.
    #[serde(default)]
    pub send_event: bool,
    /// Redeploy (and reload) when a requirement reports a change.
    #[serde(default)]
    pub receive_events: bool,
}

impl ResourceIntent {
    /// Hex-encoded SHA-256 over the intent, with attributes in sorted order.
    ///
    /// Two intents with the same hash describe the same desired state.
    pub fn attribute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.attributes {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([self.send_event as u8, self.receive_events as u8]);
        hex::encode(hasher.finalize())
    }
}

// ── Model version ─────────────────────────────────────────────────

/// A compiled model version, as handed to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: u64,
    #[serde(default)]
    pub resources: HashMap<ResourceIdStr, ResourceIntent>,
    /// `resource → resources it requires`.
    #[serde(default)]
    pub requires: HashMap<ResourceIdStr, HashSet<ResourceIdStr>>,
    /// Resources whose desired state could not be determined.
    #[serde(default)]
    pub undefined: HashSet<ResourceIdStr>,
}

impl ModelVersion {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let version: ModelVersion = serde_json::from_str(&content)?;
        Ok(version)
    }

    /// Requirements of a resource in this version.
    pub fn requires_of(&self, resource: &str) -> HashSet<ResourceIdStr> {
        self.requires.get(resource).cloned().unwrap_or_default()
    }
}

// ── Deploy outcome ────────────────────────────────────────────────

/// Terminal status of a single deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Deployed,
    Failed,
    Skipped,
    SkippedForDependency,
    Unavailable,
}

impl DeployStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, DeployStatus::Deployed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeployStatus::Deployed => "deployed",
            DeployStatus::Failed => "failed",
            DeployStatus::Skipped => "skipped",
            DeployStatus::SkippedForDependency => "skipped_for_dependency",
            DeployStatus::Unavailable => "unavailable",
        }
    }
}

/// A single attribute difference between current and desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub current: serde_json::Value,
    pub desired: serde_json::Value,
}

/// Outcome of a deploy, as reported by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub status: DeployStatus,
    /// Whether the deploy changed anything on the managed system.
    pub changed: bool,
    #[serde(default)]
    pub changes: BTreeMap<String, AttributeChange>,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl DeployResult {
    pub fn deployed(changed: bool) -> Self {
        Self {
            status: DeployStatus::Deployed,
            changed,
            changes: BTreeMap::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_status(status: DeployStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            changed: false,
            changes: BTreeMap::new(),
            messages: vec![message.into()],
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(DeployStatus::Failed, message)
    }
}

/// Outcome of a dry-run of one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DryRunResult {
    #[serde(default)]
    pub changes: BTreeMap<String, AttributeChange>,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// A dry-run result tied to the request and version it was made for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub dry_run_id: String,
    pub resource: ResourceIdStr,
    pub version: u64,
    pub result: DryRunResult,
}

impl DryRunReport {
    /// Build the composite key for storage.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.dry_run_id, self.resource)
    }
}

//! StateStore — redb-backed state persistence for Keel.
//!
//! Provides typed access to resource deploy state, facts, and dry-run
//! reports. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use keel_core::{DeployResult, DryRunReport, Facts};

use crate::error::{StateError, StateResult};
use crate::manager::{StateFuture, StateUpdateManager};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RESOURCE_STATES).map_err(map_err!(Table))?;
        txn.open_table(PARAMETERS).map_err(map_err!(Table))?;
        txn.open_table(DRYRUNS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_prefix<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    // ── Resource state ─────────────────────────────────────────────

    /// Get the deploy state of a resource.
    pub fn get_resource_state(&self, resource: &str) -> StateResult<Option<ResourceStateRecord>> {
        self.get(RESOURCE_STATES, resource)
    }

    /// List deploy state of all resources.
    pub fn list_resource_states(&self) -> StateResult<Vec<ResourceStateRecord>> {
        self.list_prefix(RESOURCE_STATES, "")
    }

    /// Mark a deploy of `resource` at `attribute_hash` as started.
    pub fn mark_deploying(&self, resource: &str, attribute_hash: &str) -> StateResult<()> {
        let now = epoch_secs();
        let mut record = self
            .get_resource_state(resource)?
            .unwrap_or_else(|| ResourceStateRecord::new(resource, attribute_hash, now));
        record.deploying = true;
        record.attribute_hash = attribute_hash.to_string();
        record.updated_at = now;
        self.put(RESOURCE_STATES, resource, &record)?;
        debug!(%resource, "resource marked deploying");
        Ok(())
    }

    /// Record the outcome of a finished deploy.
    pub fn record_deploy(
        &self,
        resource: &str,
        attribute_hash: &str,
        result: &DeployResult,
    ) -> StateResult<()> {
        let now = epoch_secs();
        let mut record = self
            .get_resource_state(resource)?
            .unwrap_or_else(|| ResourceStateRecord::new(resource, attribute_hash, now));
        record.deploying = false;
        record.attribute_hash = attribute_hash.to_string();
        if result.status.is_success() {
            record.last_success = Some(now);
        }
        record.last_result = Some(result.clone());
        record.updated_at = now;
        self.put(RESOURCE_STATES, resource, &record)?;
        debug!(%resource, status = result.status.label(), "deploy result stored");
        Ok(())
    }

    // ── Parameters ─────────────────────────────────────────────────

    /// Replace the facts of a resource.
    pub fn put_parameters(&self, resource: &str, facts: &Facts) -> StateResult<()> {
        self.put(PARAMETERS, resource, facts)?;
        debug!(%resource, count = facts.len(), "facts stored");
        Ok(())
    }

    /// Get the facts of a resource.
    pub fn get_parameters(&self, resource: &str) -> StateResult<Option<Facts>> {
        self.get(PARAMETERS, resource)
    }

    // ── Dry-runs ───────────────────────────────────────────────────

    /// Store a dry-run report.
    pub fn put_dryrun(&self, report: &DryRunReport) -> StateResult<()> {
        self.put(DRYRUNS, &report.table_key(), report)
    }

    /// List all per-resource reports of one dry-run.
    pub fn list_dryrun(&self, dry_run_id: &str) -> StateResult<Vec<DryRunReport>> {
        self.list_prefix(DRYRUNS, &format!("{dry_run_id}/"))
    }
}

impl StateUpdateManager for StateStore {
    fn send_in_progress<'a>(
        &'a self,
        resource: &'a str,
        attribute_hash: &'a str,
    ) -> StateFuture<'a> {
        Box::pin(async move { self.mark_deploying(resource, attribute_hash) })
    }

    fn send_deploy_done<'a>(
        &'a self,
        resource: &'a str,
        attribute_hash: &'a str,
        result: &'a DeployResult,
    ) -> StateFuture<'a> {
        Box::pin(async move { self.record_deploy(resource, attribute_hash, result) })
    }

    fn set_parameters<'a>(&'a self, resource: &'a str, facts: &'a Facts) -> StateFuture<'a> {
        Box::pin(async move { self.put_parameters(resource, facts) })
    }

    fn dryrun_update<'a>(&'a self, report: &'a DryRunReport) -> StateFuture<'a> {
        Box::pin(async move { self.put_dryrun(report) })
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

//! The write-side interface the scheduler reports through.
//!
//! The scheduler treats this as an append-only sink: it never reads back
//! what it wrote. Methods return boxed futures so the trait stays
//! object-safe and can be held as `Arc<dyn StateUpdateManager>`.

use std::future::Future;
use std::pin::Pin;

use keel_core::{DeployResult, DryRunReport, Facts};

use crate::error::StateResult;

/// Boxed future alias for state sink operations.
pub type StateFuture<'a> = Pin<Box<dyn Future<Output = StateResult<()>> + Send + 'a>>;

/// Durable sink for deploy intent and outcome.
pub trait StateUpdateManager: Send + Sync {
    /// A deploy of `resource` at `attribute_hash` has started.
    fn send_in_progress<'a>(&'a self, resource: &'a str, attribute_hash: &'a str)
        -> StateFuture<'a>;

    /// A deploy of `resource` at `attribute_hash` has finished.
    fn send_deploy_done<'a>(
        &'a self,
        resource: &'a str,
        attribute_hash: &'a str,
        result: &'a DeployResult,
    ) -> StateFuture<'a>;

    /// Facts were fetched for `resource`.
    fn set_parameters<'a>(&'a self, resource: &'a str, facts: &'a Facts) -> StateFuture<'a>;

    /// A dry-run of one resource completed.
    fn dryrun_update<'a>(&'a self, report: &'a DryRunReport) -> StateFuture<'a>;
}

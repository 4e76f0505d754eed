//! keel-state — embedded state store for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), records what the deploy scheduler
//! reports: per-resource deploy outcomes, discovered facts, and dry-run
//! reports. The scheduler only ever writes through the
//! [`StateUpdateManager`] trait; reads are for operators and tests.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Dry-run reports use the composite key `{dry_run_id}/{resource}` so a
//! prefix scan returns one dry-run.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod manager;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use manager::{StateFuture, StateUpdateManager};
pub use store::StateStore;
pub use types::*;

//! redb table definitions for the Keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Table with string keys and JSON values.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Deploy state keyed by resource id.
pub const RESOURCE_STATES: JsonTable = TableDefinition::new("resource_states");

/// Facts keyed by resource id.
pub const PARAMETERS: JsonTable = TableDefinition::new("parameters");

/// Dry-run reports keyed by `{dry_run_id}/{resource}`.
pub const DRYRUNS: JsonTable = TableDefinition::new("dryruns");

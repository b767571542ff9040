//! redb table definitions for the labgrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Pair keys follow the pattern `{owner}:{challenge_id}`.

use redb::TableDefinition;

/// Challenge catalogue keyed by `{challenge_id}`.
pub const CHALLENGES: TableDefinition<&str, &[u8]> = TableDefinition::new("challenges");

/// Instances keyed by `{instance_id}`, including terminal rows.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Uniqueness index: `{owner}:{challenge_id}` → id of the one non-terminal instance.
pub const ACTIVE_INSTANCES: TableDefinition<&str, &str> = TableDefinition::new("active_instances");

/// Cooldowns keyed by `{owner}:{challenge_id}`.
pub const COOLDOWNS: TableDefinition<&str, &[u8]> = TableDefinition::new("cooldowns");

/// Node info keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// VM templates keyed by `{template_id}`.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");

/// Upload sessions keyed by `{upload_id}`.
pub const UPLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("uploads");

//! labgrid-state — embedded state store for labgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for challenges, instances, cooldowns, nodes, VM
//! templates and upload sessions.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The `active_instances` table is a uniqueness index over non-terminal
//! instances keyed by `{owner}:{challenge_id}`; it is maintained in the
//! same write transaction as the instance row, so the check-and-insert
//! performed at admission is atomic.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{NodeRemoval, StateStore, Update};
pub use types::*;

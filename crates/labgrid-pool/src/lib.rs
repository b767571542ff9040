//! labgrid resource pool — tracks the nodes that host VM instances.
//!
//! Nodes are registered by an administrator and then self-report usage
//! through heartbeats. Capacity figures are advisory: placement reads the
//! last reported usage and does not reserve anything, so two concurrent
//! placements may land on a node that only had room for one.
//!
//! # Components
//!
//! - **`pool`** — `ResourcePool` (registration, heartbeat, liveness, placement)
//! - **`scorer`** — node fit checks and least-loaded ranking

pub mod error;
pub mod pool;
pub mod scorer;

pub use error::{PoolError, PoolResult};
pub use pool::{HeartbeatReport, NodeRegistration, ResourcePool};
pub use scorer::{NodeScore, ScoreBreakdown, fits, rank_nodes, score_node};

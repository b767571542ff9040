//! Resource pool error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {node_id} still hosts {active} active instance(s)")]
    NodeBusy { node_id: String, active: u32 },

    #[error("invalid node registration: {0}")]
    InvalidNode(String),

    #[error("state store error: {0}")]
    State(#[from] labgrid_state::StateError),
}

pub type PoolResult<T> = Result<T, PoolError>;

//! Engine error types.

use labgrid_ingest::IngestError;
use labgrid_state::StateError;
use thiserror::Error;

/// Reasons a create request is refused before anything is provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("active instance limit of {limit} reached")]
    ResourceLimitExceeded { limit: u32 },

    #[error("instance {instance_id} is already running for this challenge")]
    AlreadyRunning { instance_id: String },

    #[error("challenge is on cooldown for another {remaining_secs}s")]
    CooldownActive { remaining_secs: u64 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("extension limit of {max} reached")]
    LimitExceeded { max: u32 },

    #[error("{0}")]
    BackendUnavailable(String),

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl EngineError {
    /// Map a failed instance insert, turning a uniqueness conflict into
    /// `AlreadyRunning`.
    pub(crate) fn from_insert(err: StateError) -> Self {
        match err {
            StateError::ActiveInstanceExists { instance_id, .. } => {
                AdmissionError::AlreadyRunning { instance_id }.into()
            }
            other => other.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

//! Backend error types.

use std::time::Duration;

use lab_core::ExecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend cannot serve this request at all (disabled, no template,
    /// no capacity). Never retried.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Network or engine connectivity failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The execution engine rejected the request.
    #[error("engine error: {0}")]
    Engine(String),

    /// Provisioning failed after a resource was created; `handle` must be
    /// removed before the failure is surfaced.
    #[error("partially provisioned {handle}: {source}")]
    Partial {
        handle: String,
        #[source]
        source: Box<BackendError>,
    },
}

impl BackendError {
    /// Whether a provision attempt that failed this way may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout { .. } | BackendError::Transport(_) => true,
            BackendError::Partial { source, .. } => source.is_transient(),
            BackendError::Unavailable(_) | BackendError::Engine(_) => false,
        }
    }

    /// Handle of a resource left behind by a failed provision.
    pub fn partial_handle(&self) -> Option<&str> {
        match self {
            BackendError::Partial { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Whether this error, or the error behind a partial provision, is `Unavailable`.
    pub fn is_unavailable(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            BackendError::Partial { source, .. } => source.is_unavailable(),
            _ => false,
        }
    }

    /// Wrap `self` as a partial failure that left `handle` behind.
    pub fn leaving(self, handle: impl Into<String>) -> Self {
        BackendError::Partial {
            handle: handle.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn from_exec(op: &'static str, err: ExecError) -> Self {
        match err {
            ExecError::Spawn { program, source } => {
                BackendError::Unavailable(format!("cannot run {program}: {source}"))
            }
            ExecError::TimedOut { after, .. } => BackendError::Timeout { op, after },
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

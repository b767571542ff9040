//! Ingest error types.

use labgrid_state::UploadStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid upload request: {0}")]
    InvalidRequest(String),

    #[error("{format} images are limited to {max} bytes, got {size}")]
    TooLarge { format: String, size: u64, max: u64 },

    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("upload session expired: {0}")]
    SessionExpired(String),

    #[error("upload session {id} is {status:?}")]
    InvalidStatus { id: String, status: UploadStatus },

    #[error("chunk index {index} out of range (total chunks {total})")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("chunk {index} must be {expected} bytes, got {actual}")]
    ChunkSizeMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("upload incomplete: {missing} chunk(s) missing")]
    IncompleteUpload { missing: u32 },

    #[error("checksum mismatch: declared {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    State(#[from] labgrid_state::StateError),
}

pub type IngestResult<T> = Result<T, IngestError>;

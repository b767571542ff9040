//! labgrid image ingest — turns uploaded VM disk images into bootable templates.
//!
//! Uploads arrive in fixed-size chunks that may come out of order and be
//! resumed after a disconnect. Completion verifies the SHA-256 of the
//! reassembled file and hands it to a detached conversion task, which
//! normalises the disk to qcow2 and registers a template.
//!
//! # Components
//!
//! - **`pipeline`** — `ImageIngestPipeline` (sessions, chunks, completion)
//! - **`convert`** — `DiskConverter` trait and the `qemu-img` implementation
//! - **`registry`** — `TemplateRegistry`

pub mod convert;
pub mod error;
pub mod pipeline;
pub mod registry;

pub use convert::{ConvertFuture, DiskConverter, QemuImgConverter};
pub use error::{IngestError, IngestResult};
pub use pipeline::{Completion, ImageIngestPipeline, InitUpload, MissingChunks};
pub use registry::TemplateRegistry;

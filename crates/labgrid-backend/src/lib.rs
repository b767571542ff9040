//! labgrid backends — the execution technologies behind an instance.
//!
//! Every backend implements the same three-call contract (provision, stop,
//! remove) so the instance manager never branches on the backend kind.
//!
//! # Components
//!
//! - **`backend`** — `Backend` trait, request/result types, `BackendSet`
//! - **`container`** — `ContainerBackend`, driving the docker CLI
//! - **`vm`** — `VmBackend`, template resolution and node placement
//! - **`agent`** — `AgentVmDriver`, the node agent's HTTP API

pub mod agent;
pub mod backend;
pub mod container;
pub mod error;
pub mod vm;

pub use agent::AgentVmDriver;
pub use backend::{Backend, BackendFuture, BackendSet, ProvisionRequest, Provisioned};
pub use container::{ContainerBackend, ContainerSettings};
pub use error::{BackendError, BackendResult};
pub use vm::{BootRequest, BootedVm, VmBackend, VmDriver};

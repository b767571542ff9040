//! The uniform backend contract.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use labgrid_state::{BackendKind, Challenge, InstanceId, NodeId, OwnerId, PortBinding};

use crate::error::BackendResult;

/// Boxed future returned by backend calls.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Everything a backend needs to bring up one instance.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub instance_id: InstanceId,
    pub owner: OwnerId,
    pub challenge: Challenge,
}

/// A successfully provisioned resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    /// Opaque handle passed back to `stop` and `remove`.
    pub handle: String,
    /// Address the owner connects to.
    pub address: String,
    pub ports: Vec<PortBinding>,
    /// Hosting node, for node-placed backends.
    pub node_id: Option<NodeId>,
}

/// An execution technology that can run instances.
///
/// `stop` and `remove` must succeed when the resource is already gone, so
/// that a teardown racing another teardown is a no-op.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn provision<'a>(&'a self, req: &'a ProvisionRequest) -> BackendFuture<'a, Provisioned>;

    fn stop<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()>;

    fn remove<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()>;

    /// Handle under which a provision for `req` that was cut off by a
    /// deadline may have left a resource, if the backend can name it.
    fn orphan_handle(&self, _req: &ProvisionRequest) -> Option<String> {
        None
    }
}

/// Backends keyed by the kind they serve.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend, replacing any previous one of the same kind.
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.keys().copied().collect()
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

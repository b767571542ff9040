//! ResourcePool — node registration, heartbeats and placement.
//!
//! Persists nodes to the `StateStore` and keeps a read-mostly in-memory
//! copy for placement decisions. Every write goes to the store first and
//! then refreshes the cached entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use lab_core::SharedClock;
use lab_core::config::NodesConfig;
use labgrid_state::{
    Node, NodeCapacity, NodeId, NodeRemoval, NodeStatus, NodeUsage, StateError, StateStore,
    TemplateRequirements,
};

use crate::error::{PoolError, PoolResult};
use crate::scorer::rank_nodes;

/// Administrative node registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: NodeId,
    pub address: String,
    #[serde(default)]
    pub agent_port: Option<u16>,
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub primary: bool,
}

/// Usage report sent by a node agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub node_id: NodeId,
    pub used_vcpu: u32,
    pub used_memory_mb: u64,
    pub active_vms: u32,
}

/// Tracks VM hosts, their capacity and liveness.
pub struct ResourcePool {
    store: StateStore,
    config: NodesConfig,
    clock: SharedClock,
    default_agent_port: u16,
    cache: RwLock<HashMap<NodeId, Node>>,
}

impl ResourcePool {
    /// Create a pool and load the persisted nodes into the cache.
    pub fn new(store: StateStore, config: NodesConfig, clock: SharedClock) -> PoolResult<Self> {
        let cache = store
            .list_nodes()?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect::<HashMap<_, _>>();
        debug!(nodes = cache.len(), "resource pool loaded");
        Ok(Self {
            store,
            config,
            clock,
            default_agent_port: 7070,
            cache: RwLock::new(cache),
        })
    }

    /// Set the agent port used when a registration omits one.
    pub fn with_default_agent_port(mut self, port: u16) -> Self {
        self.default_agent_port = port;
        self
    }

    /// Register a node, or update the declared fields of an existing one.
    ///
    /// The node comes up `online`. Re-registration keeps the last reported
    /// usage and the original registration time.
    pub async fn register_node(&self, reg: NodeRegistration) -> PoolResult<Node> {
        if reg.id.trim().is_empty() {
            return Err(PoolError::InvalidNode("node id must not be empty".into()));
        }
        if reg.address.trim().is_empty() {
            return Err(PoolError::InvalidNode("node address must not be empty".into()));
        }
        if reg.capacity.vcpu == 0 || reg.capacity.memory_mb == 0 {
            return Err(PoolError::InvalidNode(
                "node capacity must declare vcpu and memory".into(),
            ));
        }

        let now = self.clock.now_secs();
        let existing = self.store.get_node(&reg.id)?;
        let node = Node {
            id: reg.id.clone(),
            address: reg.address,
            agent_port: reg.agent_port.unwrap_or(self.default_agent_port),
            capacity: reg.capacity,
            used: existing.as_ref().map(|n| n.used).unwrap_or_default(),
            last_heartbeat: now,
            status: NodeStatus::Online,
            primary: reg.primary,
            registered_at: existing.as_ref().map_or(now, |n| n.registered_at),
        };

        self.store.put_node(&node)?;
        self.cache.write().await.insert(node.id.clone(), node.clone());
        info!(
            node_id = %node.id,
            address = %node.address,
            vcpu = node.capacity.vcpu,
            memory_mb = node.capacity.memory_mb,
            max_instances = node.capacity.max_instances,
            reregistered = existing.is_some(),
            "node registered"
        );
        Ok(node)
    }

    /// Process a heartbeat: refresh liveness and usage figures.
    ///
    /// An offline node that reports in is brought back online.
    pub async fn heartbeat(&self, report: &HeartbeatReport) -> PoolResult<Node> {
        let now = self.clock.now_secs();
        let outcome = self.store.update_node(&report.node_id, |n| {
            n.used = NodeUsage {
                vcpu: report.used_vcpu,
                memory_mb: report.used_memory_mb,
                active_vms: report.active_vms,
            };
            n.last_heartbeat = now;
            n.status = NodeStatus::Online;
            true
        });

        let node = match outcome {
            Ok(update) => update.into_inner(),
            Err(StateError::NotFound(_)) => {
                warn!(node_id = %report.node_id, "heartbeat from unknown node");
                return Err(PoolError::NodeNotFound(report.node_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        self.cache.write().await.insert(node.id.clone(), node.clone());
        debug!(
            node_id = %node.id,
            used_vcpu = node.used.vcpu,
            used_memory_mb = node.used.memory_mb,
            active_vms = node.used.active_vms,
            "heartbeat received"
        );
        Ok(node)
    }

    /// Operator or monitor override of a node's liveness.
    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> PoolResult<Node> {
        let node = match self.store.update_node(node_id, |n| {
            if n.status == status {
                return false;
            }
            n.status = status;
            true
        }) {
            Ok(update) => update.into_inner(),
            Err(StateError::NotFound(_)) => return Err(PoolError::NodeNotFound(node_id.to_string())),
            Err(e) => return Err(e.into()),
        };

        self.cache.write().await.insert(node.id.clone(), node.clone());
        info!(%node_id, ?status, "node status set");
        Ok(node)
    }

    /// Nodes whose last heartbeat is older than the staleness threshold.
    ///
    /// Purely informational; nodes are never marked offline automatically.
    pub async fn stale_nodes(&self) -> Vec<Node> {
        let now = self.clock.now_secs();
        let threshold = self.config.stale_after_secs;
        let mut stale: Vec<Node> = self
            .cache
            .read()
            .await
            .values()
            .filter(|n| now.saturating_sub(n.last_heartbeat) > threshold)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.id.cmp(&b.id));
        stale
    }

    /// Remove a node that hosts no non-terminal instances.
    ///
    /// The cache stays write-locked until the store has decided, so no
    /// placement can pick the node while it is being removed.
    pub async fn remove_node(&self, node_id: &str) -> PoolResult<()> {
        let mut cache = self.cache.write().await;
        match self.store.delete_idle_node(node_id)? {
            NodeRemoval::Removed => {}
            NodeRemoval::Busy(active) => {
                return Err(PoolError::NodeBusy {
                    node_id: node_id.to_string(),
                    active,
                });
            }
            NodeRemoval::Missing => return Err(PoolError::NodeNotFound(node_id.to_string())),
        }
        cache.remove(node_id);
        info!(%node_id, "node removed");
        Ok(())
    }

    /// All known nodes, ordered by id.
    pub async fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.cache.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn get_node(&self, node_id: &str) -> Option<Node> {
        self.cache.read().await.get(node_id).cloned()
    }

    /// Reload the cache from the store.
    pub async fn refresh(&self) -> PoolResult<()> {
        let nodes = self.store.list_nodes()?;
        let mut cache = self.cache.write().await;
        cache.clear();
        cache.extend(nodes.into_iter().map(|n| (n.id.clone(), n)));
        Ok(())
    }

    /// Pick the least-loaded online node with room for `req`.
    ///
    /// Nothing is reserved; usage changes only when the node next reports.
    pub async fn select_node(&self, req: &TemplateRequirements) -> Option<Node> {
        let cache = self.cache.read().await;
        let nodes: Vec<Node> = cache.values().cloned().collect();
        drop(cache);

        let ranked = rank_nodes(&nodes, req);
        let best = ranked.first()?;
        debug!(
            node_id = %best.node_id,
            load = best.load,
            candidates = ranked.len(),
            "node selected"
        );
        nodes.into_iter().find(|n| n.id == best.node_id)
    }
}

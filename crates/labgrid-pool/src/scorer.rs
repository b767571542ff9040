//! Node scoring for VM placement.
//!
//! A node is a candidate when it is online and its free vCPU, free memory,
//! remaining instance slots and disk capacity cover the template's
//! requirements. Candidates are ranked by load, the highest of their vCPU,
//! memory and slot utilisation, so new VMs spread towards idle nodes.

use labgrid_state::{Node, NodeStatus, TemplateRequirements};

/// Scored placement result for a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node_id: String,
    /// Composite load in `0.0..=1.0` (lower = better).
    pub load: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual utilisation ratios for debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub vcpu: f64,
    pub memory: f64,
    pub slots: f64,
}

fn ratio(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        1.0
    } else {
        (used as f64 / capacity as f64).min(1.0)
    }
}

/// Whether `node` can host one more VM with the given requirements.
pub fn fits(node: &Node, req: &TemplateRequirements) -> bool {
    if node.status != NodeStatus::Online {
        return false;
    }
    let free_vcpu = node.capacity.vcpu.saturating_sub(node.used.vcpu);
    let free_memory = node.capacity.memory_mb.saturating_sub(node.used.memory_mb);

    free_vcpu >= req.vcpu
        && free_memory >= req.memory_mb
        && node.used.active_vms < node.capacity.max_instances
        && req.disk_gb <= node.capacity.disk_gb
}

/// Score a single node, or `None` if it cannot take the workload.
pub fn score_node(node: &Node, req: &TemplateRequirements) -> Option<NodeScore> {
    if !fits(node, req) {
        return None;
    }

    let vcpu = ratio(u64::from(node.used.vcpu), u64::from(node.capacity.vcpu));
    let memory = ratio(node.used.memory_mb, node.capacity.memory_mb);
    let slots = ratio(
        u64::from(node.used.active_vms),
        u64::from(node.capacity.max_instances),
    );

    Some(NodeScore {
        node_id: node.id.clone(),
        load: vcpu.max(memory).max(slots),
        breakdown: ScoreBreakdown {
            vcpu,
            memory,
            slots,
        },
    })
}

/// Score all nodes and return the candidates, least loaded first.
///
/// Equal loads are ordered by node id so placement is deterministic.
pub fn rank_nodes(nodes: &[Node], req: &TemplateRequirements) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = nodes.iter().filter_map(|n| score_node(n, req)).collect();

    scores.sort_by(|a, b| {
        a.load
            .partial_cmp(&b.load)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use labgrid_state::{NodeCapacity, NodeUsage};

    fn make_node(id: &str, used_vcpu: u32, used_mem: u64, active: u32) -> Node {
        Node {
            id: id.to_string(),
            address: "10.0.0.1".to_string(),
            agent_port: 7070,
            capacity: NodeCapacity {
                vcpu: 16,
                memory_mb: 32768,
                disk_gb: 500,
                max_instances: 4,
            },
            used: NodeUsage {
                vcpu: used_vcpu,
                memory_mb: used_mem,
                active_vms: active,
            },
            last_heartbeat: 1000,
            status: NodeStatus::Online,
            primary: false,
            registered_at: 1000,
        }
    }

    fn req(vcpu: u32, memory_mb: u64) -> TemplateRequirements {
        TemplateRequirements {
            vcpu,
            memory_mb,
            disk_gb: 20,
        }
    }

    #[test]
    fn rejects_offline_node() {
        let mut node = make_node("n1", 0, 0, 0);
        node.status = NodeStatus::Offline;
        assert!(score_node(&node, &req(2, 2048)).is_none());
    }

    #[test]
    fn rejects_insufficient_vcpu() {
        let node = make_node("n1", 15, 0, 0);
        assert!(score_node(&node, &req(2, 2048)).is_none());
    }

    #[test]
    fn rejects_insufficient_memory() {
        let node = make_node("n1", 0, 31744, 0);
        assert!(score_node(&node, &req(2, 2048)).is_none());
    }

    #[test]
    fn rejects_full_slots() {
        let node = make_node("n1", 0, 0, 4);
        assert!(score_node(&node, &req(1, 512)).is_none());
    }

    #[test]
    fn rejects_oversized_disk() {
        let node = make_node("n1", 0, 0, 0);
        let mut r = req(1, 512);
        r.disk_gb = 501;
        assert!(score_node(&node, &r).is_none());
    }

    #[test]
    fn exact_fit_is_accepted() {
        let node = make_node("n1", 14, 30720, 3);
        assert!(score_node(&node, &req(2, 2048)).is_some());
    }

    #[test]
    fn load_is_highest_utilisation() {
        let node = make_node("n1", 4, 8192, 3);
        let score = score_node(&node, &req(1, 512)).unwrap();
        assert_eq!(score.breakdown.vcpu, 0.25);
        assert_eq!(score.breakdown.memory, 0.25);
        assert_eq!(score.breakdown.slots, 0.75);
        assert_eq!(score.load, 0.75);
    }

    #[test]
    fn rank_prefers_least_loaded() {
        let nodes = vec![
            make_node("n1", 8, 16384, 2),
            make_node("n2", 2, 4096, 0),
            make_node("n3", 15, 0, 0), // Can't fit 2 vCPU.
        ];

        let ranked = rank_nodes(&nodes, &req(2, 2048));
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].node_id, "n2");
        assert_eq!(ranked[1].node_id, "n1");
    }

    #[test]
    fn ties_break_by_node_id() {
        let nodes = vec![make_node("n2", 0, 0, 0), make_node("n1", 0, 0, 0)];
        let ranked = rank_nodes(&nodes, &req(1, 512));
        assert_eq!(ranked[0].node_id, "n1");
    }
}

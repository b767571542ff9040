//! Domain types for the labgrid state store.
//!
//! These types represent the persisted state of challenges, instances,
//! cooldowns, nodes, VM templates and upload sessions. All types are
//! serializable to/from JSON for storage in redb tables, and every lifetime
//! field is an absolute Unix timestamp in seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Authenticated caller identity, as supplied by the upstream auth layer.
pub type OwnerId = String;

/// Challenge slug.
pub type ChallengeId = String;

/// Unique identifier for an execution node.
pub type NodeId = String;

/// Unique identifier for a VM template.
pub type TemplateId = String;

/// Unique identifier for an upload session.
pub type UploadId = String;

/// Composite key shared by the active-instance index and the cooldown table.
pub fn pair_key(owner: &str, challenge_id: &str) -> String {
    format!("{owner}:{challenge_id}")
}

// ── Challenge ─────────────────────────────────────────────────────

/// Execution technology backing an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Container,
    Vm,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::Vm => write!(f, "vm"),
        }
    }
}

/// Resource specification of a challenge, as registered by an administrator.
///
/// The optional lifetime fields override the platform defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Challenge {
    pub id: ChallengeId,
    pub name: String,
    pub kind: BackendKind,
    /// Container image (container challenges).
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    /// CPU limit in cores (container challenges).
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Ports the challenge listens on inside the container.
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    /// Linked VM template (VM challenges).
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_extensions: Option<u32>,
    #[serde(default)]
    pub extension_secs: Option<u64>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

fn default_cpus() -> f64 {
    1.0
}

fn default_memory_mb() -> u64 {
    512
}

impl Challenge {
    /// `image:tag`, defaulting the tag to `latest`.
    pub fn image_ref(&self) -> Option<String> {
        let image = self.image.as_deref()?;
        Some(format!("{image}:{}", self.tag.as_deref().unwrap_or("latest")))
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of an instance.
///
/// `Stopped`, `Failed` and `Expired` are terminal: once reached, the row is
/// never modified again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Failed,
    Expired,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped | InstanceStatus::Failed | InstanceStatus::Expired
        )
    }

    /// Statuses a user or the reconciler may still tear down.
    pub const NON_TERMINAL: [InstanceStatus; 3] = [
        InstanceStatus::Creating,
        InstanceStatus::Running,
        InstanceStatus::Stopping,
    ];
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A port exposed by an instance: `internal` inside the workload,
/// `external` on the reachable address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub internal: u16,
    pub external: u16,
}

/// One ephemeral compute resource bound to a single owner's attempt at a challenge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub owner: OwnerId,
    pub challenge_id: ChallengeId,
    pub kind: BackendKind,
    /// Backend resource handle (container id, `{node}/{vm}`), set once provisioned.
    pub handle: Option<String>,
    /// Hosting node for VM instances.
    pub node_id: Option<NodeId>,
    pub status: InstanceStatus,
    pub address: Option<String>,
    pub ports: Vec<PortBinding>,
    pub created_at: u64,
    pub expires_at: u64,
    pub extensions_used: u32,
    pub extensions_max: u32,
    pub error: Option<String>,
    /// Unix timestamp of the last status or lifetime change.
    pub updated_at: u64,
}

impl Instance {
    /// Key into the active-instance index.
    pub fn pair_key(&self) -> String {
        pair_key(&self.owner, &self.challenge_id)
    }

    /// Seconds left before expiry (0 once past).
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

// ── Cooldown ──────────────────────────────────────────────────────

/// Minimum wait between stopping and re-starting the same challenge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cooldown {
    pub owner: OwnerId,
    pub challenge_id: ChallengeId,
    pub cooldown_until: u64,
}

impl Cooldown {
    pub fn table_key(&self) -> String {
        pair_key(&self.owner, &self.challenge_id)
    }

    /// Seconds until the cooldown lifts (0 when inactive).
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.cooldown_until.saturating_sub(now)
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.cooldown_until > now
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Liveness of a node as set by heartbeats and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Declared capacity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub max_instances: u32,
}

/// Usage figures as last self-reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeUsage {
    pub vcpu: u32,
    pub memory_mb: u64,
    pub active_vms: u32,
}

/// A host capable of running VM instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    /// Port of the node agent's HTTP API.
    pub agent_port: u16,
    pub capacity: NodeCapacity,
    pub used: NodeUsage,
    /// Unix timestamp of last heartbeat.
    pub last_heartbeat: u64,
    pub status: NodeStatus,
    /// The primary node co-hosts the control plane and template storage.
    pub primary: bool,
    pub registered_at: u64,
}

// ── Template ──────────────────────────────────────────────────────

/// Resources a VM template needs on its host node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRequirements {
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

/// A converted VM disk image ready to boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmTemplate {
    pub id: TemplateId,
    pub name: String,
    /// Normalized disk image path.
    pub disk_path: String,
    /// Runtime disk format (always `qcow2` for ingested images).
    pub disk_format: String,
    pub size_bytes: u64,
    pub requirements: TemplateRequirements,
    pub active: bool,
    /// Upload session that produced this template.
    pub source_upload: Option<UploadId>,
    pub created_at: u64,
}

// ── Upload session ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

/// Template metadata supplied at upload time, registered on conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateDraft {
    pub name: String,
    pub requirements: TemplateRequirements,
}

/// A resumable chunked upload of a VM disk image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSession {
    pub id: UploadId,
    pub owner: OwnerId,
    pub filename: String,
    /// Lowercase source extension (`ova`, `vmdk`, `qcow2`, ...).
    pub format: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received: BTreeSet<u32>,
    /// Declared SHA-256 of the whole file, lowercase hex.
    pub checksum: String,
    pub status: UploadStatus,
    pub template: TemplateDraft,
    /// Registered template once conversion completes.
    pub template_id: Option<TemplateId>,
    pub error: Option<String>,
    pub created_at: u64,
    /// Abandon-expiry.
    pub expires_at: u64,
}

impl UploadSession {
    /// Number of chunks needed to carry `total_size` bytes, or `None` when
    /// `chunk_size` is zero or the count does not fit a chunk index.
    pub fn chunk_count(total_size: u64, chunk_size: u64) -> Option<u32> {
        if chunk_size == 0 {
            return None;
        }
        u32::try_from(total_size.div_ceil(chunk_size)).ok()
    }

    /// Exact byte length expected for chunk `index`.
    pub fn expected_chunk_len(&self, index: u32) -> Option<u64> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = u64::from(index) * self.chunk_size;
        Some(self.chunk_size.min(self.total_size - offset))
    }

    /// Indices in `[0, total_chunks)` not yet received, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total_chunks
            && self.received.iter().all(|i| *i < self.total_chunks)
    }
}

//! labd.toml configuration parser.
//!
//! Every field carries a default so an empty file yields a working
//! single-host platform. The parsed value is immutable; components receive
//! the sub-section they need by clone at construction time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub server: ServerConfig,
    pub instances: InstancesConfig,
    pub backend: BackendConfig,
    pub nodes: NodesConfig,
    pub ingest: IngestConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("/var/lib/labgrid"),
        }
    }
}

/// Upper bound on any single lifetime span: timeout, one extension, or
/// cooldown.
pub const MAX_LIFETIME_SECS: u64 = 30 * 24 * 3600;

/// Instance lifetime defaults. Challenges may override each of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancesConfig {
    pub default_timeout_secs: u64,
    pub default_max_extensions: u32,
    pub default_extension_secs: u64,
    pub default_cooldown_secs: u64,
    /// Maximum number of non-terminal instances a single owner may hold.
    pub per_owner_limit: u32,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 3600,
            default_max_extensions: 2,
            default_extension_secs: 1800,
            default_cooldown_secs: 300,
            per_owner_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Platform-wide switch for the VM backend.
    pub vm_enabled: bool,
    /// Upper bound on a single provision/stop/remove call.
    pub call_timeout_secs: u64,
    /// Total provision attempts for transient failures (1 = no retry).
    pub provision_attempts: u32,
    pub retry_backoff_ms: u64,
    pub docker_binary: String,
    /// Host name or IP handed to users for container instances.
    pub public_host: String,
    /// Optional docker network to attach challenge containers to.
    pub network: Option<String>,
    /// Default node-agent port when a node registers without one.
    pub agent_port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            vm_enabled: true,
            call_timeout_secs: 60,
            provision_attempts: 3,
            retry_backoff_ms: 500,
            docker_binary: "docker".to_string(),
            public_host: "127.0.0.1".to_string(),
            network: None,
            agent_port: 7070,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Heartbeat age after which a node is reported as stale.
    pub stale_after_secs: u64,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub upload_dir: PathBuf,
    pub template_dir: PathBuf,
    /// Abandon-expiry for upload sessions, counted from initiation.
    pub session_ttl_secs: u64,
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Most chunks a single upload may be split into.
    pub max_chunks: u32,
    pub qemu_img_binary: String,
    pub tar_binary: String,
    pub conversion_timeout_secs: u64,
    pub default_vcpu: u32,
    pub default_memory_mb: u64,
    pub default_disk_gb: u64,
    /// Size ceiling per source extension (lowercase, without the dot).
    pub max_size_bytes: BTreeMap<String, u64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        const GIB: u64 = 1024 * 1024 * 1024;
        let max_size_bytes = [
            ("ova", 50 * GIB),
            ("vmdk", 50 * GIB),
            ("vdi", 50 * GIB),
            ("vhd", 50 * GIB),
            ("vhdx", 50 * GIB),
            ("qcow2", 50 * GIB),
            ("img", 20 * GIB),
            ("raw", 20 * GIB),
        ]
        .into_iter()
        .map(|(ext, max)| (ext.to_string(), max))
        .collect();

        Self {
            upload_dir: PathBuf::from("/var/lib/labgrid/uploads"),
            template_dir: PathBuf::from("/var/lib/labgrid/templates"),
            session_ttl_secs: 24 * 3600,
            default_chunk_size: 10 * 1024 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            max_chunks: 100_000,
            qemu_img_binary: "qemu-img".to_string(),
            tar_binary: "tar".to_string(),
            conversion_timeout_secs: 3600,
            default_vcpu: 2,
            default_memory_mb: 2048,
            default_disk_gb: 20,
            max_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl PlatformConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PlatformConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would make the platform unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instances.per_owner_limit == 0 {
            anyhow::bail!("instances.per_owner_limit must be at least 1");
        }
        if self.instances.default_timeout_secs == 0 {
            anyhow::bail!("instances.default_timeout_secs must be positive");
        }
        if self.instances.default_cooldown_secs == 0 {
            anyhow::bail!("instances.default_cooldown_secs must be positive");
        }
        for (field, value) in [
            ("default_timeout_secs", self.instances.default_timeout_secs),
            ("default_extension_secs", self.instances.default_extension_secs),
            ("default_cooldown_secs", self.instances.default_cooldown_secs),
        ] {
            if value > MAX_LIFETIME_SECS {
                anyhow::bail!("instances.{field} must not exceed {MAX_LIFETIME_SECS}");
            }
        }
        if self.backend.provision_attempts == 0 {
            anyhow::bail!("backend.provision_attempts must be at least 1");
        }
        if self.backend.call_timeout_secs == 0 {
            anyhow::bail!("backend.call_timeout_secs must be positive");
        }
        if self.ingest.default_chunk_size == 0
            || self.ingest.default_chunk_size > self.ingest.max_chunk_size
        {
            anyhow::bail!("ingest.default_chunk_size must be in 1..=max_chunk_size");
        }
        if self.ingest.max_chunks == 0 {
            anyhow::bail!("ingest.max_chunks must be at least 1");
        }
        if self.reconciler.interval_secs == 0 {
            anyhow::bail!("reconciler.interval_secs must be positive");
        }
        Ok(())
    }

    /// Point the data-dir-relative defaults at `data_dir`.
    pub fn with_data_dir(mut self, data_dir: &Path) -> Self {
        self.server.data_dir = data_dir.to_path_buf();
        self.ingest.upload_dir = data_dir.join("uploads");
        self.ingest.template_dir = data_dir.join("templates");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: PlatformConfig = toml::from_str("").unwrap();
        assert_eq!(config.instances.default_timeout_secs, 3600);
        assert_eq!(config.instances.per_owner_limit, 3);
        assert!(config.backend.vm_enabled);
        assert_eq!(config.reconciler.interval_secs, 30);
        assert_eq!(config.ingest.max_size_bytes.get("img"), Some(&(20 * 1024 * 1024 * 1024)));
        config.validate().unwrap();
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let toml_str = r#"
[instances]
per_owner_limit = 1

[backend]
vm_enabled = false
network = "ctf"
"#;
        let config: PlatformConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.instances.per_owner_limit, 1);
        assert_eq!(config.instances.default_cooldown_secs, 300);
        assert!(!config.backend.vm_enabled);
        assert_eq!(config.backend.network.as_deref(), Some("ctf"));
        assert_eq!(config.backend.docker_binary, "docker");
    }

    #[test]
    fn validate_rejects_zero_owner_limit() {
        let mut config = PlatformConfig::default();
        config.instances.per_owner_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_default_chunk() {
        let mut config = PlatformConfig::default();
        config.ingest.default_chunk_size = config.ingest.max_chunk_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_chunks() {
        let mut config = PlatformConfig::default();
        config.ingest.max_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_cooldown() {
        let mut config = PlatformConfig::default();
        config.instances.default_cooldown_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_bounds_lifetime_spans() {
        let mut config = PlatformConfig::default();
        config.instances.default_extension_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = PlatformConfig::default();
        config.instances.default_timeout_secs = MAX_LIFETIME_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = PlatformConfig::default();
        config.instances.default_cooldown_secs = MAX_LIFETIME_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn from_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labd.toml");
        std::fs::write(&path, "[reconciler]\ninterval_secs = 5\n").unwrap();

        let config = PlatformConfig::from_file(&path).unwrap();
        assert_eq!(config.reconciler.interval_secs, 5);
        assert!(config.to_toml_string().unwrap().contains("interval_secs = 5"));
    }

    #[test]
    fn with_data_dir_rebases_ingest_paths() {
        let config = PlatformConfig::default().with_data_dir(Path::new("/tmp/lab"));
        assert_eq!(config.ingest.upload_dir, PathBuf::from("/tmp/lab/uploads"));
        assert_eq!(config.ingest.template_dir, PathBuf::from("/tmp/lab/templates"));
    }
}

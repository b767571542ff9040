//! VM backend — boots template disks on pool nodes.
//!
//! Provisioning resolves the challenge's template, picks a node from the
//! resource pool and asks that node's driver to boot the disk. Nodes name
//! each VM after its instance id, so the handle `{node_id}/{instance_id}`
//! is known before the boot call returns. A boot that fails or times out
//! can therefore always be cleaned up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use labgrid_pool::ResourcePool;
use labgrid_state::{BackendKind, InstanceId, Node, PortBinding, StateStore};

use crate::backend::{Backend, BackendFuture, ProvisionRequest, Provisioned};
use crate::error::{BackendError, BackendResult};

/// Boot parameters sent to a node. The node names the VM `instance_id`
/// and treats a repeated boot of the same id as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootRequest {
    pub instance_id: InstanceId,
    pub disk_path: String,
    pub vcpu: u32,
    pub memory_mb: u64,
}

/// A VM the node reports as booted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootedVm {
    pub address: String,
}

/// Hypervisor access on a node.
pub trait VmDriver: Send + Sync {
    fn boot<'a>(&'a self, node: &'a Node, req: &'a BootRequest) -> BackendFuture<'a, BootedVm>;

    fn stop<'a>(&'a self, node: &'a Node, vm_id: &'a str) -> BackendFuture<'a, ()>;

    fn remove<'a>(&'a self, node: &'a Node, vm_id: &'a str) -> BackendFuture<'a, ()>;
}

pub struct VmBackend {
    store: StateStore,
    pool: Arc<ResourcePool>,
    driver: Arc<dyn VmDriver>,
    enabled: bool,
    /// Node chosen for each boot still in flight.
    placements: Mutex<HashMap<InstanceId, String>>,
}

impl VmBackend {
    pub fn new(
        store: StateStore,
        pool: Arc<ResourcePool>,
        driver: Arc<dyn VmDriver>,
        enabled: bool,
    ) -> Self {
        Self {
            store,
            pool,
            driver,
            enabled,
            placements: Mutex::new(HashMap::new()),
        }
    }

    fn placements(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, String>> {
        self.placements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a handle to its node. `None` when the node is no longer known.
    async fn locate<'h>(&self, handle: &'h str) -> BackendResult<Option<(Node, &'h str)>> {
        let (node_id, vm_id) = split_handle(handle)?;
        match self.pool.get_node(node_id).await {
            Some(node) => Ok(Some((node, vm_id))),
            None => {
                warn!(%handle, %node_id, "vm handle refers to unknown node");
                Ok(None)
            }
        }
    }
}

impl Backend for VmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vm
    }

    fn provision<'a>(&'a self, req: &'a ProvisionRequest) -> BackendFuture<'a, Provisioned> {
        Box::pin(async move {
            if !self.enabled {
                return Err(BackendError::Unavailable("vm support is disabled".into()));
            }
            let challenge = &req.challenge;
            let template_id = challenge.template_id.as_deref().ok_or_else(|| {
                BackendError::Unavailable(format!("challenge {} has no vm template", challenge.id))
            })?;
            let template = self
                .store
                .get_template(template_id)
                .map_err(|e| BackendError::Engine(e.to_string()))?
                .ok_or_else(|| {
                    BackendError::Unavailable(format!("template {template_id} not found"))
                })?;
            if !template.active {
                return Err(BackendError::Unavailable(format!(
                    "template {template_id} is inactive"
                )));
            }

            let node = self
                .pool
                .select_node(&template.requirements)
                .await
                .ok_or_else(|| {
                    BackendError::Unavailable(format!(
                        "no online node has capacity for template {template_id}"
                    ))
                })?;

            let boot = BootRequest {
                instance_id: req.instance_id.clone(),
                disk_path: template.disk_path.clone(),
                vcpu: template.requirements.vcpu,
                memory_mb: template.requirements.memory_mb,
            };
            let handle = vm_handle(&node.id, &req.instance_id);
            self.placements().insert(req.instance_id.clone(), node.id.clone());
            let booted = self.driver.boot(&node, &boot).await;
            self.placements().remove(&req.instance_id);
            // The node may have created the VM before the call failed.
            let vm = booted.map_err(|e| e.leaving(handle.clone()))?;

            // VMs are reachable directly, so ports map onto themselves.
            let ports = challenge
                .exposed_ports
                .iter()
                .map(|&p| PortBinding {
                    internal: p,
                    external: p,
                })
                .collect();

            info!(
                instance_id = %req.instance_id,
                node_id = %node.id,
                %template_id,
                "vm provisioned"
            );
            Ok(Provisioned {
                handle,
                address: vm.address,
                ports,
                node_id: Some(node.id),
            })
        })
    }

    fn stop<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            match self.locate(handle).await? {
                Some((node, vm_id)) => self.driver.stop(&node, vm_id).await,
                None => Ok(()),
            }
        })
    }

    fn remove<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            match self.locate(handle).await? {
                Some((node, vm_id)) => self.driver.remove(&node, vm_id).await,
                None => Ok(()),
            }
        })
    }

    fn orphan_handle(&self, req: &ProvisionRequest) -> Option<String> {
        self.placements()
            .remove(&req.instance_id)
            .map(|node_id| vm_handle(&node_id, &req.instance_id))
    }
}

fn vm_handle(node_id: &str, instance_id: &str) -> String {
    format!("{node_id}/{instance_id}")
}

fn split_handle(handle: &str) -> BackendResult<(&str, &str)> {
    match handle.split_once('/') {
        Some((node, vm)) if !node.is_empty() && !vm.is_empty() => Ok((node, vm)),
        _ => Err(BackendError::Engine(format!("malformed vm handle {handle:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lab_core::ManualClock;
    use lab_core::config::NodesConfig;
    use labgrid_pool::{HeartbeatReport, NodeRegistration};
    use labgrid_state::{Challenge, NodeCapacity, TemplateRequirements, VmTemplate};

    #[derive(Default)]
    struct RecordingDriver {
        booted: Mutex<Vec<(String, BootRequest)>>,
        torn_down: Mutex<Vec<String>>,
        boot_error: Mutex<Option<BackendError>>,
        hang: bool,
    }

    impl VmDriver for RecordingDriver {
        fn boot<'a>(&'a self, node: &'a Node, req: &'a BootRequest) -> BackendFuture<'a, BootedVm> {
            Box::pin(async move {
                self.booted.lock().unwrap().push((node.id.clone(), req.clone()));
                if self.hang {
                    std::future::pending::<()>().await;
                }
                if let Some(err) = self.boot_error.lock().unwrap().take() {
                    return Err(err);
                }
                Ok(BootedVm {
                    address: "10.10.0.7".to_string(),
                })
            })
        }

        fn stop<'a>(&'a self, node: &'a Node, vm_id: &'a str) -> BackendFuture<'a, ()> {
            Box::pin(async move {
                self.torn_down.lock().unwrap().push(format!("stop {}/{vm_id}", node.id));
                Ok(())
            })
        }

        fn remove<'a>(&'a self, node: &'a Node, vm_id: &'a str) -> BackendFuture<'a, ()> {
            Box::pin(async move {
                self.torn_down.lock().unwrap().push(format!("remove {}/{vm_id}", node.id));
                Ok(())
            })
        }
    }

    fn template(active: bool) -> VmTemplate {
        VmTemplate {
            id: "tpl-1".to_string(),
            name: "win-dc".to_string(),
            disk_path: "/srv/templates/tpl-1.qcow2".to_string(),
            disk_format: "qcow2".to_string(),
            size_bytes: 1 << 30,
            requirements: TemplateRequirements {
                vcpu: 2,
                memory_mb: 4096,
                disk_gb: 40,
            },
            active,
            source_upload: None,
            created_at: 1000,
        }
    }

    fn request(template_id: Option<&str>) -> ProvisionRequest {
        ProvisionRequest {
            instance_id: "i-1".to_string(),
            owner: "alice".to_string(),
            challenge: Challenge {
                id: "ad-lab".to_string(),
                name: "AD Lab".to_string(),
                kind: BackendKind::Vm,
                image: None,
                tag: None,
                cpus: 1.0,
                memory_mb: 512,
                exposed_ports: vec![3389],
                template_id: template_id.map(str::to_string),
                timeout_secs: None,
                max_extensions: None,
                extension_secs: None,
                cooldown_secs: None,
            },
        }
    }

    async fn setup(enabled: bool) -> (VmBackend, Arc<RecordingDriver>, StateStore, Arc<ResourcePool>) {
        setup_with(enabled, RecordingDriver::default()).await
    }

    async fn setup_with(
        enabled: bool,
        driver: RecordingDriver,
    ) -> (VmBackend, Arc<RecordingDriver>, StateStore, Arc<ResourcePool>) {
        let store = StateStore::open_in_memory().unwrap();
        let pool = Arc::new(
            ResourcePool::new(store.clone(), NodesConfig::default(), ManualClock::shared(1000)).unwrap(),
        );
        for id in ["node-a", "node-b"] {
            pool.register_node(NodeRegistration {
                id: id.to_string(),
                address: "10.0.0.1".to_string(),
                agent_port: None,
                capacity: NodeCapacity {
                    vcpu: 16,
                    memory_mb: 65536,
                    disk_gb: 500,
                    max_instances: 4,
                },
                primary: false,
            })
            .await
            .unwrap();
        }
        let driver = Arc::new(driver);
        let backend = VmBackend::new(store.clone(), pool.clone(), driver.clone(), enabled);
        (backend, driver, store, pool)
    }

    #[tokio::test]
    async fn provision_boots_on_least_loaded_node() {
        let (backend, driver, store, pool) = setup(true).await;
        store.put_template(&template(true)).unwrap();
        pool.heartbeat(&HeartbeatReport {
            node_id: "node-a".to_string(),
            used_vcpu: 8,
            used_memory_mb: 8192,
            active_vms: 2,
        })
        .await
        .unwrap();

        let out = backend.provision(&request(Some("tpl-1"))).await.unwrap();
        assert_eq!(out.handle, "node-b/i-1");
        assert_eq!(out.address, "10.10.0.7");
        assert_eq!(out.node_id.as_deref(), Some("node-b"));
        assert_eq!(out.ports, vec![PortBinding { internal: 3389, external: 3389 }]);

        let booted = driver.booted.lock().unwrap();
        assert_eq!(booted[0].0, "node-b");
        assert_eq!(booted[0].1.disk_path, "/srv/templates/tpl-1.qcow2");
        assert_eq!(booted[0].1.memory_mb, 4096);
        drop(booted);
        assert_eq!(backend.orphan_handle(&request(Some("tpl-1"))), None);
    }

    #[tokio::test]
    async fn failed_boot_names_the_vm_to_clean_up() {
        let driver = RecordingDriver {
            boot_error: Mutex::new(Some(BackendError::Transport("connection reset".into()))),
            ..Default::default()
        };
        let (backend, driver, store, _) = setup_with(true, driver).await;
        store.put_template(&template(true)).unwrap();

        let err = backend.provision(&request(Some("tpl-1"))).await.unwrap_err();
        assert!(err.is_transient());
        let node_id = driver.booted.lock().unwrap()[0].0.clone();
        assert_eq!(err.partial_handle(), Some(format!("{node_id}/i-1").as_str()));
        assert_eq!(backend.orphan_handle(&request(Some("tpl-1"))), None);
    }

    #[tokio::test]
    async fn cancelled_boot_leaves_an_orphan_handle() {
        let driver = RecordingDriver {
            hang: true,
            ..Default::default()
        };
        let (backend, driver, store, _) = setup_with(true, driver).await;
        store.put_template(&template(true)).unwrap();
        let req = request(Some("tpl-1"));

        let cut = tokio::time::timeout(Duration::from_millis(20), backend.provision(&req)).await;
        assert!(cut.is_err());
        let node_id = driver.booted.lock().unwrap()[0].0.clone();
        assert_eq!(backend.orphan_handle(&req), Some(format!("{node_id}/i-1")));
        assert_eq!(backend.orphan_handle(&req), None);
    }

    #[tokio::test]
    async fn disabled_backend_fails_fast() {
        let (backend, driver, store, _) = setup(false).await;
        store.put_template(&template(true)).unwrap();

        let err = backend.provision(&request(Some("tpl-1"))).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(driver.booted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_or_inactive_template_is_unavailable() {
        let (backend, _, store, _) = setup(true).await;
        assert!(backend.provision(&request(None)).await.unwrap_err().is_unavailable());
        assert!(backend.provision(&request(Some("tpl-1"))).await.unwrap_err().is_unavailable());

        store.put_template(&template(false)).unwrap();
        assert!(backend.provision(&request(Some("tpl-1"))).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn no_capacity_is_unavailable() {
        let (backend, _, store, _) = setup(true).await;
        let mut big = template(true);
        big.requirements.vcpu = 64;
        store.put_template(&big).unwrap();

        let err = backend.provision(&request(Some("tpl-1"))).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn teardown_routes_to_the_handle_node() {
        let (backend, driver, _, _) = setup(true).await;
        backend.stop("node-a/vm-3").await.unwrap();
        backend.remove("node-a/vm-3").await.unwrap();

        assert_eq!(
            *driver.torn_down.lock().unwrap(),
            vec!["stop node-a/vm-3".to_string(), "remove node-a/vm-3".to_string()]
        );
    }

    #[tokio::test]
    async fn teardown_on_unknown_node_is_noop() {
        let (backend, driver, _, _) = setup(true).await;
        backend.remove("gone/vm-3").await.unwrap();
        assert!(driver.torn_down.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_handle_is_rejected() {
        let (backend, _, _, _) = setup(true).await;
        assert!(backend.stop("no-slash").await.is_err());
        assert!(backend.stop("/vm").await.is_err());
    }
}

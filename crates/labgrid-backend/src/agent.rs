//! Node agent client.
//!
//! Each VM node runs an agent exposing a small JSON API:
//!
//! - `POST /v1/vms` boots a disk as VM `{instance_id}` and returns
//!   `{address}`; booting an id that already exists returns that VM
//! - `POST /v1/vms/{instance_id}/stop` powers a VM off
//! - `DELETE /v1/vms/{instance_id}` destroys it
//!
//! A 404 on stop or delete means the VM is already gone and counts as
//! success. One HTTP/1 connection is opened per call.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use labgrid_state::Node;

use crate::backend::BackendFuture;
use crate::error::{BackendError, BackendResult};
use crate::vm::{BootRequest, BootedVm, VmDriver};

#[derive(Debug, Clone)]
pub struct AgentVmDriver {
    timeout: Duration,
}

impl AgentVmDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call(
        &self,
        op: &'static str,
        node: &Node,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> BackendResult<(StatusCode, Bytes)> {
        let authority = format!("{}:{}", node.address, node.agent_port);
        match tokio::time::timeout(self.timeout, send(&authority, method, path, body)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }
}

async fn send(
    authority: &str,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> BackendResult<(StatusCode, Bytes)> {
    let stream = tokio::net::TcpStream::connect(authority)
        .await
        .map_err(|e| BackendError::Transport(format!("connect {authority}: {e}")))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| BackendError::Transport(format!("handshake {authority}: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", authority)
        .header("user-agent", "labgrid/0.1");
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let req = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| BackendError::Engine(format!("build request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| BackendError::Transport(format!("request to {authority}: {e}")))?;
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| BackendError::Transport(format!("read body from {authority}: {e}")))?
        .to_bytes();
    debug!(%authority, %path, %status, "agent call finished");
    Ok((status, bytes))
}

/// Classify a non-success agent response.
fn status_error(status: StatusCode, body: &[u8]) -> BackendError {
    let detail = format!("agent returned {status}: {}", String::from_utf8_lossy(body).trim());
    if status.is_server_error() {
        BackendError::Transport(detail)
    } else {
        BackendError::Engine(detail)
    }
}

impl VmDriver for AgentVmDriver {
    fn boot<'a>(&'a self, node: &'a Node, req: &'a BootRequest) -> BackendFuture<'a, BootedVm> {
        Box::pin(async move {
            let body = serde_json::to_vec(req)
                .map_err(|e| BackendError::Engine(format!("encode boot request: {e}")))?;
            let (status, bytes) = self
                .call("provision", node, Method::POST, "/v1/vms", Some(body))
                .await?;
            if !status.is_success() {
                return Err(status_error(status, &bytes));
            }
            serde_json::from_slice(&bytes)
                .map_err(|e| BackendError::Engine(format!("decode boot response: {e}")))
        })
    }

    fn stop<'a>(&'a self, node: &'a Node, vm_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = format!("/v1/vms/{vm_id}/stop");
            let (status, bytes) = self.call("stop", node, Method::POST, &path, None).await?;
            if status.is_success() || status == StatusCode::NOT_FOUND {
                return Ok(());
            }
            Err(status_error(status, &bytes))
        })
    }

    fn remove<'a>(&'a self, node: &'a Node, vm_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = format!("/v1/vms/{vm_id}");
            let (status, bytes) = self.call("remove", node, Method::DELETE, &path, None).await?;
            if status.is_success() || status == StatusCode::NOT_FOUND {
                return Ok(());
            }
            Err(status_error(status, &bytes))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::Path;
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use labgrid_state::{NodeCapacity, NodeStatus, NodeUsage};

    async fn boot(Json(req): Json<BootRequest>) -> (StatusCode, Json<BootedVm>) {
        (
            StatusCode::CREATED,
            Json(BootedVm {
                address: format!("10.10.0.{}", req.vcpu),
            }),
        )
    }

    async fn stop(Path(id): Path<String>) -> StatusCode {
        if id == "gone" {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::NO_CONTENT
        }
    }

    async fn destroy(Path(id): Path<String>) -> (StatusCode, &'static str) {
        if id == "locked" {
            (StatusCode::CONFLICT, "vm is locked")
        } else {
            (StatusCode::NO_CONTENT, "")
        }
    }

    /// Start a fake agent on an ephemeral port and return a node pointing at it.
    async fn fake_agent() -> Node {
        let app = Router::new()
            .route("/v1/vms", post(boot))
            .route("/v1/vms/{id}/stop", post(stop))
            .route("/v1/vms/{id}", delete(destroy));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Node {
            id: "node-1".to_string(),
            address: "127.0.0.1".to_string(),
            agent_port: port,
            capacity: NodeCapacity {
                vcpu: 8,
                memory_mb: 16384,
                disk_gb: 200,
                max_instances: 4,
            },
            used: NodeUsage::default(),
            last_heartbeat: 0,
            status: NodeStatus::Online,
            primary: true,
            registered_at: 0,
        }
    }

    #[tokio::test]
    async fn boot_posts_json_and_decodes_reply() {
        let node = fake_agent().await;
        let driver = AgentVmDriver::new(Duration::from_secs(5));

        let vm = driver
            .boot(
                &node,
                &BootRequest {
                    instance_id: "i-1".to_string(),
                    disk_path: "/srv/t.qcow2".to_string(),
                    vcpu: 2,
                    memory_mb: 2048,
                },
            )
            .await
            .unwrap();
        assert_eq!(vm.address, "10.10.0.2");
    }

    #[tokio::test]
    async fn stop_treats_not_found_as_done() {
        let node = fake_agent().await;
        let driver = AgentVmDriver::new(Duration::from_secs(5));

        driver.stop(&node, "vm-1").await.unwrap();
        driver.stop(&node, "gone").await.unwrap();
    }

    #[tokio::test]
    async fn remove_surfaces_client_errors() {
        let node = fake_agent().await;
        let driver = AgentVmDriver::new(Duration::from_secs(5));

        driver.remove(&node, "vm-1").await.unwrap();
        let err = driver.remove(&node, "locked").await.unwrap_err();
        assert!(matches!(err, BackendError::Engine(ref m) if m.contains("vm is locked")));
    }

    #[tokio::test]
    async fn unreachable_agent_is_transport_error() {
        let mut node = fake_agent().await;
        // Bind and drop a listener to find a port nobody serves.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        node.agent_port = listener.local_addr().unwrap().port();
        drop(listener);

        let driver = AgentVmDriver::new(Duration::from_secs(5));
        let err = driver.stop(&node, "vm-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, b"busy").is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, b"bad disk").is_transient());
    }
}

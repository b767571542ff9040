//! End-to-end tests of the HTTP surface against in-memory components.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use lab_core::ManualClock;
use lab_core::config::{IngestConfig, NodesConfig};
use labgrid_api::{AppState, CALLER_HEADER, build_router};
use labgrid_backend::{Backend, BackendFuture, BackendSet, ProvisionRequest, Provisioned};
use labgrid_engine::{InstanceManager, ManagerSettings};
use labgrid_ingest::{ConvertFuture, DiskConverter, ImageIngestPipeline};
use labgrid_pool::ResourcePool;
use labgrid_state::{BackendKind, PortBinding, StateStore};

struct FakeBackend;

impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn provision<'a>(&'a self, req: &'a ProvisionRequest) -> BackendFuture<'a, Provisioned> {
        Box::pin(async move {
            Ok(Provisioned {
                handle: format!("lab-{}", req.instance_id),
                address: "10.0.0.5".to_string(),
                ports: vec![PortBinding {
                    internal: 80,
                    external: 32768,
                }],
                node_id: None,
            })
        })
    }

    fn stop<'a>(&'a self, _handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn remove<'a>(&'a self, _handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

struct FakeConverter;

impl DiskConverter for FakeConverter {
    fn convert<'a>(
        &'a self,
        _source: &'a Path,
        _format: &'a str,
        _work_dir: &'a Path,
        output: &'a Path,
    ) -> ConvertFuture<'a> {
        Box::pin(async move {
            tokio::fs::write(output, b"qcow2").await?;
            Ok(5)
        })
    }
}

struct Harness {
    app: Router,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::shared(10_000);
    let store = StateStore::open_in_memory().unwrap();

    let pool = Arc::new(ResourcePool::new(store.clone(), NodesConfig::default(), clock.clone()).unwrap());
    let ingest = Arc::new(ImageIngestPipeline::new(
        store.clone(),
        IngestConfig {
            upload_dir: dir.path().join("uploads"),
            template_dir: dir.path().join("templates"),
            ..IngestConfig::default()
        },
        clock.clone(),
        Arc::new(FakeConverter),
    ));
    let manager = Arc::new(InstanceManager::new(
        store,
        BackendSet::new().with(Arc::new(FakeBackend)),
        clock.clone(),
        ManagerSettings::default(),
    ));

    Harness {
        app: build_router(AppState {
            manager,
            pool,
            ingest,
        }),
        clock,
        _dir: dir,
    }
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(CALLER_HEADER, user);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn put_chunk(app: &Router, upload: &str, index: u32, user: &str, data: &[u8]) -> StatusCode {
    let req = Request::builder()
        .method(Method::PUT)
        .uri(format!("/uploads/{upload}/chunks/{index}"))
        .header(CALLER_HEADER, user)
        .header("content-type", "application/octet-stream")
        .body(Body::from(data.to_vec()))
        .unwrap();
    app.clone().oneshot(req).await.unwrap().status()
}

async fn register_web_challenge(app: &Router) {
    let (status, _) = send(
        app,
        Method::PUT,
        "/admin/challenges",
        None,
        Some(json!({
            "id": "web-101",
            "name": "Web 101",
            "kind": "container",
            "image": "lab/web-101",
            "exposed_ports": [80],
            "timeout_secs": 600,
            "max_extensions": 1,
            "extension_secs": 300,
            "cooldown_secs": 120,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ── Instances ──────────────────────────────────────────────────

#[tokio::test]
async fn requests_without_caller_are_rejected() {
    let h = harness();
    let (status, body) = send(&h.app, Method::GET, "/instances", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn instance_lifecycle_over_http() {
    let h = harness();
    register_web_challenge(&h.app).await;

    let (status, body) = send(
        &h.app,
        Method::POST,
        "/instances",
        Some("alice"),
        Some(json!({"challenge_slug": "web-101"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], json!("running"));
    assert_eq!(body["data"]["expires_at"], json!(10_600));
    let id = body["data"]["id"].as_str().unwrap().to_string();

    // Second start of the same challenge names the running instance.
    let (status, body) = send(
        &h.app,
        Method::POST,
        "/instances",
        Some("alice"),
        Some(json!({"challenge_id": "web-101"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["data"]["instance_id"], json!(id));

    // Other owners cannot see it.
    let (status, _) = send(&h.app, Method::GET, &format!("/instances/{id}"), Some("bob"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&h.app, Method::GET, "/instances", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let extend = format!("/instances/{id}/extend");
    let (status, body) = send(&h.app, Method::POST, &extend, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["expires_at"], json!(10_900));
    assert_eq!(body["data"]["extensions_used"], json!(1));

    let (status, body) = send(&h.app, Method::POST, &extend, Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["data"]["max_extensions"], json!(1));

    h.clock.advance(30);
    let (status, body) = send(&h.app, Method::POST, &format!("/instances/{id}/stop"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["instance"]["status"], json!("stopped"));
    assert_eq!(body["data"]["cooldown_until"], json!(10_150));

    h.clock.advance(50);
    let (status, body) = send(
        &h.app,
        Method::POST,
        "/instances",
        Some("alice"),
        Some(json!({"challenge_slug": "web-101"})),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["data"]["remaining_seconds"], json!(70));

    // Bob is unaffected by Alice's cooldown.
    let (status, _) = send(
        &h.app,
        Method::POST,
        "/instances",
        Some("bob"),
        Some(json!({"challenge_slug": "web-101"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn unknown_challenge_is_not_found() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        Method::POST,
        "/instances",
        Some("alice"),
        Some(json!({"challenge_slug": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_challenge_is_rejected() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        Method::PUT,
        "/admin/challenges",
        None,
        Some(json!({"id": "vm-1", "name": "VM", "kind": "vm"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_delete_removes_instance() {
    let h = harness();
    register_web_challenge(&h.app).await;
    let (_, body) = send(
        &h.app,
        Method::POST,
        "/instances",
        Some("alice"),
        Some(json!({"challenge_slug": "web-101"})),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&h.app, Method::DELETE, &format!("/admin/instances/{id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&h.app, Method::GET, "/admin/instances", None, None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

// ── Nodes ──────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_requires_registered_node() {
    let h = harness();
    let report = json!({
        "node_id": "node-a",
        "used_vcpu": 4,
        "used_memory_mb": 8192,
        "active_vms": 2,
    });
    let (status, _) = send(&h.app, Method::POST, "/nodes/heartbeat", None, Some(report.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &h.app,
        Method::POST,
        "/admin/nodes",
        None,
        Some(json!({
            "id": "node-a",
            "address": "10.1.0.10",
            "capacity": {"vcpu": 32, "memory_mb": 65536, "disk_gb": 500, "max_instances": 20},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    h.clock.advance(5);
    let (status, body) = send(&h.app, Method::POST, "/nodes/heartbeat", None, Some(report)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["last_heartbeat"], json!(10_005));
    assert_eq!(body["data"]["used"]["active_vms"], json!(2));
}

// ── Uploads ────────────────────────────────────────────────────

async fn open_upload(app: &Router, user: &str, data: &[u8], checksum: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/uploads",
        Some(user),
        Some(json!({
            "filename": "router.qcow2",
            "total_size": data.len(),
            "chunk_size": 4,
            "checksum": checksum,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["total_chunks"], json!(3));
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn upload_resumes_and_completes() {
    let h = harness();
    let data = b"0123456789";
    let id = open_upload(&h.app, "alice", data, &sha256_hex(data)).await;

    assert_eq!(put_chunk(&h.app, &id, 0, "alice", &data[0..4]).await, StatusCode::OK);
    assert_eq!(put_chunk(&h.app, &id, 2, "alice", &data[8..10]).await, StatusCode::OK);

    let (status, body) = send(&h.app, Method::GET, &format!("/uploads/{id}/missing"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["missing"], json!([1]));

    let complete = format!("/uploads/{id}/complete");
    let (status, body) = send(&h.app, Method::POST, &complete, Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["data"]["missing_chunks"], json!(1));

    // Another caller cannot touch the session.
    assert_eq!(put_chunk(&h.app, &id, 1, "bob", &data[4..8]).await, StatusCode::NOT_FOUND);

    assert_eq!(put_chunk(&h.app, &id, 1, "alice", &data[4..8]).await, StatusCode::OK);
    let (status, body) = send(&h.app, Method::POST, &complete, Some("alice"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], json!("processing"));

    let (status, _) = send(&h.app, Method::POST, &complete, Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn checksum_mismatch_fails_upload() {
    let h = harness();
    let data = b"0123456789";
    let id = open_upload(&h.app, "alice", data, &sha256_hex(b"something else")).await;
    for (index, range) in [(0, 0..4), (1, 4..8), (2, 8..10)] {
        assert_eq!(put_chunk(&h.app, &id, index, "alice", &data[range]).await, StatusCode::OK);
    }

    let (status, _) = send(&h.app, Method::POST, &format!("/uploads/{id}/complete"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(&h.app, Method::GET, &format!("/uploads/{id}"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], json!("failed"));
}

#[tokio::test]
async fn unsupported_format_is_rejected() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        Method::POST,
        "/uploads",
        Some("alice"),
        Some(json!({
            "filename": "notes.txt",
            "total_size": 10,
            "checksum": "a".repeat(64),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_chunk_length_is_rejected() {
    let h = harness();
    let data = b"0123456789";
    let id = open_upload(&h.app, "alice", data, &sha256_hex(data)).await;
    assert_eq!(put_chunk(&h.app, &id, 0, "alice", b"01").await, StatusCode::BAD_REQUEST);
    assert_eq!(put_chunk(&h.app, &id, 7, "alice", b"0123").await, StatusCode::BAD_REQUEST);
}

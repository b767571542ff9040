//! labgrid-api — REST API for labgrid.
//!
//! The caller identity is taken from the `x-user-id` header, which the
//! upstream authentication layer sets; requests without it are rejected
//! with 401. Routes under `/admin` expect the same layer to restrict them
//! to operators.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/instances` | Caller's active instances |
//! | POST | `/instances` | Start a challenge instance |
//! | GET | `/instances/{id}` | Instance details |
//! | POST | `/instances/{id}/extend` | Extend the lifetime |
//! | POST | `/instances/{id}/stop` | Stop, returns the cooldown |
//! | POST | `/nodes/heartbeat` | Node usage report |
//! | POST | `/uploads` | Open an upload session |
//! | GET | `/uploads/{id}` | Session status |
//! | PUT | `/uploads/{id}/chunks/{index}` | Upload one chunk (raw body) |
//! | POST | `/uploads/{id}/complete` | Verify and start conversion |
//! | GET | `/uploads/{id}/missing` | Chunks still missing |
//! | GET/PUT | `/admin/challenges` | List / register challenges |
//! | GET | `/admin/challenges/{id}` | Challenge details |
//! | GET | `/admin/instances` | Every instance |
//! | DELETE | `/admin/instances/{id}` | Tear down and delete |
//! | GET/POST | `/admin/nodes` | List / register nodes |
//! | GET | `/admin/nodes/stale` | Nodes with an old heartbeat |
//! | POST | `/admin/nodes/{id}/status` | Mark online/offline |
//! | DELETE | `/admin/nodes/{id}` | Remove an idle node |
//! | GET | `/admin/templates` | List templates |
//! | GET | `/admin/templates/{id}` | Template details |
//! | POST | `/admin/templates/{id}/active` | Enable/disable a template |

pub mod admin_handlers;
pub mod error;
pub mod instance_handlers;
pub mod node_handlers;
pub mod response;
pub mod upload_handlers;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};

use labgrid_engine::InstanceManager;
use labgrid_ingest::ImageIngestPipeline;
use labgrid_pool::ResourcePool;

pub use error::ApiError;
pub use response::{ApiResponse, CALLER_HEADER};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub pool: Arc<ResourcePool>,
    pub ingest: Arc<ImageIngestPipeline>,
}

/// Build the complete API router.
pub fn build_router(state: AppState) -> Router {
    // Chunk bodies may be far larger than axum's default limit.
    let chunk_limit = usize::try_from(state.ingest.max_chunk_size()).unwrap_or(usize::MAX);

    let admin = Router::new()
        .route(
            "/challenges",
            get(admin_handlers::list_challenges).put(admin_handlers::put_challenge),
        )
        .route("/challenges/{id}", get(admin_handlers::get_challenge))
        .route("/instances", get(admin_handlers::list_all_instances))
        .route("/instances/{id}", delete(admin_handlers::delete_instance))
        .route(
            "/nodes",
            get(node_handlers::list_nodes).post(node_handlers::register_node),
        )
        .route("/nodes/stale", get(node_handlers::stale_nodes))
        .route("/nodes/{id}", delete(node_handlers::remove_node))
        .route("/nodes/{id}/status", post(node_handlers::set_node_status))
        .route("/templates", get(admin_handlers::list_templates))
        .route("/templates/{id}", get(admin_handlers::get_template))
        .route("/templates/{id}/active", post(admin_handlers::set_template_active));

    Router::new()
        .route(
            "/instances",
            get(instance_handlers::list_instances).post(instance_handlers::create_instance),
        )
        .route("/instances/{id}", get(instance_handlers::get_instance))
        .route("/instances/{id}/extend", post(instance_handlers::extend_instance))
        .route("/instances/{id}/stop", post(instance_handlers::stop_instance))
        .route("/nodes/heartbeat", post(node_handlers::heartbeat))
        .route("/uploads", post(upload_handlers::init_upload))
        .route("/uploads/{id}", get(upload_handlers::upload_status))
        .route(
            "/uploads/{id}/chunks/{index}",
            put(upload_handlers::upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/uploads/{id}/complete", post(upload_handlers::complete_upload))
        .route("/uploads/{id}/missing", get(upload_handlers::missing_chunks))
        .nest("/admin", admin)
        .with_state(state)
}

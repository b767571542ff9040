//! `labd serve` — wires the subsystems together and runs until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use lab_core::config::PlatformConfig;
use lab_core::{SharedClock, SystemClock, TokioCommandRunner};
use labgrid_api::AppState;
use labgrid_backend::{AgentVmDriver, BackendSet, ContainerBackend, ContainerSettings, VmBackend};
use labgrid_engine::{InstanceManager, ManagerSettings, Reconciler};
use labgrid_ingest::{ImageIngestPipeline, QemuImgConverter};
use labgrid_pool::ResourcePool;
use labgrid_state::StateStore;

pub async fn run(config: PlatformConfig) -> anyhow::Result<()> {
    info!("labgrid daemon starting");

    let data_dir = &config.server.data_dir;
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(&config.ingest.upload_dir)?;
    std::fs::create_dir_all(&config.ingest.template_dir)?;

    // ── State store ────────────────────────────────────────────
    let db_path = data_dir.join("labgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let clock: SharedClock = Arc::new(SystemClock);
    let runner = Arc::new(TokioCommandRunner);

    // ── Resource pool ──────────────────────────────────────────
    let pool = Arc::new(
        ResourcePool::new(store.clone(), config.nodes.clone(), clock.clone())?
            .with_default_agent_port(config.backend.agent_port),
    );
    let nodes = pool.list_nodes().await.len();
    info!(nodes, "resource pool initialized");

    // ── Backends ───────────────────────────────────────────────
    let call_timeout = Duration::from_secs(config.backend.call_timeout_secs);
    let backends = BackendSet::new()
        .with(Arc::new(ContainerBackend::new(
            runner.clone(),
            ContainerSettings::from(&config.backend),
        )))
        .with(Arc::new(VmBackend::new(
            store.clone(),
            pool.clone(),
            Arc::new(AgentVmDriver::new(call_timeout)),
            config.backend.vm_enabled,
        )));
    info!(vm_enabled = config.backend.vm_enabled, "backends initialized");

    // ── Image ingest ───────────────────────────────────────────
    let ingest = Arc::new(ImageIngestPipeline::new(
        store.clone(),
        config.ingest.clone(),
        clock.clone(),
        Arc::new(QemuImgConverter::new(runner, &config.ingest)),
    ));
    let recovered = ingest.recover_interrupted().await?;
    if recovered > 0 {
        warn!(recovered, "uploads interrupted by the previous shutdown were failed");
    }
    info!(upload_dir = ?config.ingest.upload_dir, "image ingest initialized");

    // ── Instance manager ───────────────────────────────────────
    let manager = Arc::new(InstanceManager::new(
        store,
        backends,
        clock.clone(),
        ManagerSettings::from_config(&config),
    ));
    info!(
        per_owner_limit = config.instances.per_owner_limit,
        "instance manager initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Reconciler ─────────────────────────────────────────────
    let reconciler = Reconciler::new(
        manager.clone(),
        clock,
        Duration::from_secs(config.reconciler.interval_secs),
    )
    .with_ingest(ingest.clone());
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));

    // ── API server ─────────────────────────────────────────────
    let router = labgrid_api::build_router(AppState {
        manager,
        pool,
        ingest,
    });
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(addr = %listener.local_addr()?, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = reconciler_handle.await;
    info!("labgrid daemon stopped");
    Ok(())
}

//! Expiry reconciler.
//!
//! A single background loop that periodically expires running instances
//! past their `expires_at`, fails abandoned upload sessions and purges
//! lapsed cooldown rows. Overlapping sweeps are harmless: expiry is a
//! guarded transition out of `running`, so a row is expired at most once.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use lab_core::SharedClock;
use labgrid_ingest::ImageIngestPipeline;
use labgrid_state::InstanceStatus;

use crate::error::EngineResult;
use crate::manager::InstanceManager;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: u32,
    pub uploads_expired: u32,
    pub cooldowns_purged: u32,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    manager: Arc<InstanceManager>,
    ingest: Option<Arc<ImageIngestPipeline>>,
    clock: SharedClock,
    interval: Duration,
}

impl Reconciler {
    pub fn new(manager: Arc<InstanceManager>, clock: SharedClock, interval: Duration) -> Self {
        Self {
            manager,
            ingest: None,
            clock,
            interval,
        }
    }

    /// Also expire abandoned upload sessions of `ingest`.
    pub fn with_ingest(mut self, ingest: Arc<ImageIngestPipeline>) -> Self {
        self.ingest = Some(ingest);
        self
    }

    /// Run one sweep at the current time.
    pub async fn reconcile_once(&self) -> EngineResult<SweepReport> {
        let now = self.clock.now_secs();
        let mut report = SweepReport::default();

        let due = self
            .manager
            .store()
            .list_instances_with_status(InstanceStatus::Running)?
            .into_iter()
            .filter(|i| i.expires_at < now);
        for instance in due {
            match self.manager.expire(&instance, now).await {
                Ok(true) => report.expired += 1,
                Ok(false) => debug!(instance_id = %instance.id, "instance left running before expiry"),
                Err(e) => warn!(instance_id = %instance.id, error = %e, "failed to expire instance"),
            }
        }

        if let Some(ingest) = &self.ingest {
            report.uploads_expired = ingest.expire_sessions(now).await?;
        }
        report.cooldowns_purged = self.manager.store().purge_expired_cooldowns(now)?;
        Ok(report)
    }

    /// Sweep every interval until `shutdown` changes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.reconcile_once().await {
                        Ok(report) if report.is_empty() => debug!("reconcile sweep: nothing to do"),
                        Ok(report) => info!(
                            expired = report.expired,
                            uploads_expired = report.uploads_expired,
                            cooldowns_purged = report.cooldowns_purged,
                            "reconcile sweep complete"
                        ),
                        Err(e) => error!(error = %e, "reconcile sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

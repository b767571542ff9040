//! Instance manager — the instance state machine.
//!
//! ```text
//! creating ──► running ──► stopped | expired
//!     │
//!     └──► failed | stopped
//! ```
//!
//! Every transition is a compare-and-set against the persisted row, so
//! concurrent callers (a user Stop, the reconciler, an in-flight Create)
//! agree on a single winner. Only the winner of a terminal transition talks
//! to the backend; losers observe the new status and back off.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lab_core::SharedClock;
use lab_core::config::{InstancesConfig, MAX_LIFETIME_SECS, PlatformConfig};
use labgrid_backend::{Backend, BackendError, BackendResult, BackendSet, ProvisionRequest, Provisioned};
use labgrid_state::{BackendKind, Challenge, Instance, InstanceStatus, StateError, StateStore, Update};

use crate::admission::AdmissionController;
use crate::error::{EngineError, EngineResult};

/// Lifetime defaults and backend call policy.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub instances: InstancesConfig,
    /// Deadline for each provision, stop and remove call.
    pub call_timeout: Duration,
    /// Total provision attempts for transient failures.
    pub provision_attempts: u32,
    pub retry_backoff: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &PlatformConfig) -> Self {
        Self {
            instances: config.instances.clone(),
            call_timeout: Duration::from_secs(config.backend.call_timeout_secs),
            provision_attempts: config.backend.provision_attempts,
            retry_backoff: Duration::from_millis(config.backend.retry_backoff_ms),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&PlatformConfig::default())
    }
}

/// Result of a successful stop.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub instance: Instance,
    pub cooldown_until: u64,
}

/// Effective lifetime parameters of a challenge.
#[derive(Debug, Clone, Copy)]
struct Lifetime {
    timeout_secs: u64,
    max_extensions: u32,
    extension_secs: u64,
    cooldown_secs: u64,
}

pub struct InstanceManager {
    store: StateStore,
    admission: AdmissionController,
    backends: BackendSet,
    clock: SharedClock,
    settings: ManagerSettings,
}

impl InstanceManager {
    pub fn new(
        store: StateStore,
        backends: BackendSet,
        clock: SharedClock,
        settings: ManagerSettings,
    ) -> Self {
        let admission = AdmissionController::new(
            store.clone(),
            settings.instances.per_owner_limit,
            clock.clone(),
        );
        Self {
            store,
            admission,
            backends,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ── Challenge catalogue ────────────────────────────────────────

    /// Register or replace a challenge.
    pub fn put_challenge(&self, challenge: Challenge) -> EngineResult<Challenge> {
        validate_challenge(&challenge)?;
        self.store.put_challenge(&challenge)?;
        info!(challenge_id = %challenge.id, kind = %challenge.kind, "challenge registered");
        Ok(challenge)
    }

    pub fn get_challenge(&self, id: &str) -> EngineResult<Challenge> {
        self.store
            .get_challenge(id)?
            .ok_or_else(|| EngineError::NotFound(format!("challenge {id}")))
    }

    pub fn list_challenges(&self) -> EngineResult<Vec<Challenge>> {
        let mut challenges = self.store.list_challenges()?;
        challenges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(challenges)
    }

    fn lifetime(&self, challenge: Option<&Challenge>) -> Lifetime {
        let defaults = &self.settings.instances;
        Lifetime {
            timeout_secs: challenge
                .and_then(|c| c.timeout_secs)
                .unwrap_or(defaults.default_timeout_secs),
            max_extensions: challenge
                .and_then(|c| c.max_extensions)
                .unwrap_or(defaults.default_max_extensions),
            extension_secs: challenge
                .and_then(|c| c.extension_secs)
                .unwrap_or(defaults.default_extension_secs),
            cooldown_secs: challenge
                .and_then(|c| c.cooldown_secs)
                .unwrap_or(defaults.default_cooldown_secs),
        }
    }

    /// Lifetime of an existing instance's challenge; falls back to the
    /// defaults if the challenge has since been removed.
    fn lifetime_of(&self, challenge_id: &str) -> EngineResult<Lifetime> {
        let challenge = self.store.get_challenge(challenge_id)?;
        Ok(self.lifetime(challenge.as_ref()))
    }

    // ── Queries ────────────────────────────────────────────────────

    /// An instance owned by `owner`. Other owners' instances are reported
    /// as missing.
    pub fn get(&self, owner: &str, id: &str) -> EngineResult<Instance> {
        match self.store.get_instance(id)? {
            Some(instance) if instance.owner == owner => Ok(instance),
            _ => Err(EngineError::NotFound(format!("instance {id}"))),
        }
    }

    /// Non-terminal instances of `owner`, oldest first.
    pub fn list_active(&self, owner: &str) -> EngineResult<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .store
            .list_instances_for_owner(owner)?
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }

    /// Every instance, terminal rows included, oldest first.
    pub fn list_all(&self) -> EngineResult<Vec<Instance>> {
        let mut instances = self.store.list_instances()?;
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Admit, persist and provision a new instance of `challenge_id`.
    pub async fn create(&self, owner: &str, challenge_id: &str) -> EngineResult<Instance> {
        self.admission.check(owner, challenge_id)?;
        let challenge = self.get_challenge(challenge_id)?;
        let lifetime = self.lifetime(Some(&challenge));

        let now = self.clock.now_secs();
        let expires_at = now.checked_add(lifetime.timeout_secs).ok_or_else(|| {
            EngineError::InvalidChallenge(format!("{challenge_id}: timeout_secs out of range"))
        })?;
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            challenge_id: challenge.id.clone(),
            kind: challenge.kind,
            handle: None,
            node_id: None,
            status: InstanceStatus::Creating,
            address: None,
            ports: Vec::new(),
            created_at: now,
            expires_at,
            extensions_used: 0,
            extensions_max: lifetime.max_extensions,
            error: None,
            updated_at: now,
        };
        self.store
            .insert_instance(&instance)
            .map_err(EngineError::from_insert)?;
        info!(
            instance_id = %instance.id,
            %owner,
            %challenge_id,
            kind = %instance.kind,
            expires_at = instance.expires_at,
            "instance creating"
        );

        let Some(backend) = self.backends.get(challenge.kind) else {
            let message = format!("no {} backend is configured", challenge.kind);
            self.mark_failed(&instance.id, &message);
            return Err(EngineError::BackendUnavailable(message));
        };

        let req = ProvisionRequest {
            instance_id: instance.id.clone(),
            owner: owner.to_string(),
            challenge,
        };
        match self.provision_with_retry(backend.as_ref(), &req).await {
            Ok(provisioned) => self.commit_running(backend.as_ref(), &instance.id, provisioned).await,
            Err(err) => {
                let message = err.to_string();
                warn!(instance_id = %instance.id, error = %message, "provisioning failed");
                self.mark_failed(&instance.id, &message);
                if err.is_unavailable() {
                    Err(EngineError::BackendUnavailable(message))
                } else {
                    Err(EngineError::ProvisionFailed(message))
                }
            }
        }
    }

    /// Provision under the call deadline, retrying transient failures.
    /// Any resource a failed attempt leaves behind is removed before the
    /// next attempt or before the failure is returned.
    async fn provision_with_retry(
        &self,
        backend: &dyn Backend,
        req: &ProvisionRequest,
    ) -> BackendResult<Provisioned> {
        let attempts = self.settings.provision_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.settings.call_timeout, backend.provision(req)).await {
                Ok(result) => result,
                Err(_) => {
                    let err = BackendError::Timeout {
                        op: "provision",
                        after: self.settings.call_timeout,
                    };
                    Err(match backend.orphan_handle(req) {
                        Some(handle) => err.leaving(handle),
                        None => err,
                    })
                }
            };

            let err = match result {
                Ok(provisioned) => return Ok(provisioned),
                Err(err) => err,
            };
            if let Some(handle) = err.partial_handle() {
                self.remove_quietly(backend, &req.instance_id, handle).await;
            }
            if !err.is_transient() || attempt >= attempts {
                return Err(err);
            }
            warn!(
                instance_id = %req.instance_id,
                attempt,
                attempts,
                error = %err,
                "transient provisioning failure, retrying"
            );
            attempt += 1;
            tokio::time::sleep(self.settings.retry_backoff).await;
        }
    }

    /// Record a provisioned resource. If the row left `creating` while the
    /// backend was working, the resource is torn down instead.
    async fn commit_running(
        &self,
        backend: &dyn Backend,
        id: &str,
        provisioned: Provisioned,
    ) -> EngineResult<Instance> {
        let now = self.clock.now_secs();
        let update = self.store.update_instance(id, |inst| {
            if inst.status != InstanceStatus::Creating {
                return false;
            }
            inst.status = InstanceStatus::Running;
            inst.handle = Some(provisioned.handle.clone());
            inst.address = Some(provisioned.address.clone());
            inst.ports = provisioned.ports.clone();
            inst.node_id = provisioned.node_id.clone();
            inst.updated_at = now;
            true
        });

        match update {
            Ok(Update::Applied(instance)) => {
                info!(
                    instance_id = %instance.id,
                    handle = %provisioned.handle,
                    address = %provisioned.address,
                    "instance running"
                );
                Ok(instance)
            }
            Ok(Update::Unchanged(instance)) => {
                info!(
                    instance_id = %id,
                    status = %instance.status,
                    "instance left creating during provisioning, releasing resource"
                );
                self.teardown(backend, id, &provisioned.handle).await;
                Err(EngineError::InvalidState(format!(
                    "instance {id} was {} before provisioning finished",
                    instance.status
                )))
            }
            Err(StateError::NotFound(_)) => {
                self.teardown(backend, id, &provisioned.handle).await;
                Err(EngineError::InvalidState(format!(
                    "instance {id} was deleted before provisioning finished"
                )))
            }
            Err(err) => {
                self.teardown(backend, id, &provisioned.handle).await;
                self.mark_failed(id, &format!("could not record provisioned resource: {err}"));
                Err(err.into())
            }
        }
    }

    /// Move a `creating` row to `failed`. A row already moved on by a
    /// concurrent stop or delete is left alone.
    fn mark_failed(&self, id: &str, message: &str) {
        let now = self.clock.now_secs();
        let result = self.store.terminate_instance(
            id,
            |i| i.status == InstanceStatus::Creating,
            InstanceStatus::Failed,
            Some(message.to_string()),
            now,
            None,
        );
        match result {
            Ok(Update::Applied(_)) => info!(instance_id = %id, "instance failed"),
            Ok(Update::Unchanged(inst)) => {
                debug!(instance_id = %id, status = %inst.status, "failure not recorded, row already moved on")
            }
            Err(StateError::NotFound(_)) => {}
            Err(e) => warn!(instance_id = %id, error = %e, "could not record instance failure"),
        }
    }

    // ── Extend ─────────────────────────────────────────────────────

    /// Push the expiry of a running instance back by one increment.
    ///
    /// Each successful call consumes one extension.
    pub fn extend(&self, owner: &str, id: &str) -> EngineResult<Instance> {
        let current = self.get(owner, id)?;
        let increment = self.lifetime_of(&current.challenge_id)?.extension_secs;
        let now = self.clock.now_secs();

        let mut refusal = None;
        let update = self.store.update_instance(id, |inst| {
            if inst.status != InstanceStatus::Running || inst.expires_at < now {
                refusal = Some(EngineError::InvalidState(format!(
                    "instance {id} is {} and cannot be extended",
                    if inst.status == InstanceStatus::Running { "past expiry" } else { "not running" }
                )));
                return false;
            }
            if inst.extensions_used >= inst.extensions_max {
                refusal = Some(EngineError::LimitExceeded {
                    max: inst.extensions_max,
                });
                return false;
            }
            let Some(expires_at) = inst.expires_at.checked_add(increment) else {
                refusal = Some(EngineError::InvalidState(format!(
                    "instance {id} cannot be extended past the maximum expiry"
                )));
                return false;
            };
            inst.expires_at = expires_at;
            inst.extensions_used += 1;
            inst.updated_at = now;
            true
        })?;

        match update {
            Update::Applied(instance) => {
                info!(
                    instance_id = %id,
                    expires_at = instance.expires_at,
                    extensions_used = instance.extensions_used,
                    extensions_max = instance.extensions_max,
                    "instance extended"
                );
                Ok(instance)
            }
            Update::Unchanged(instance) => Err(refusal.unwrap_or_else(|| {
                EngineError::InvalidState(format!("instance {id} is {}", instance.status))
            })),
        }
    }

    // ── Stop / expire / delete ─────────────────────────────────────

    /// Stop an instance from any non-terminal status and start its cooldown.
    pub async fn stop(&self, owner: &str, id: &str) -> EngineResult<StopOutcome> {
        let current = self.get(owner, id)?;
        let now = self.clock.now_secs();
        match self
            .finish(&current, InstanceStatus::Stopped, now, |_| true)
            .await?
        {
            Some(outcome) => Ok(outcome),
            None => {
                let status = self
                    .store
                    .get_instance(id)?
                    .map(|i| i.status)
                    .unwrap_or(current.status);
                Err(EngineError::InvalidState(format!("instance {id} is already {status}")))
            }
        }
    }

    /// Expire `instance` if it is still running past its expiry at `now`.
    /// Returns false when another caller moved the row first.
    pub async fn expire(&self, instance: &Instance, now: u64) -> EngineResult<bool> {
        let outcome = self
            .finish(instance, InstanceStatus::Expired, now, |i| {
                i.status == InstanceStatus::Running && i.expires_at < now
            })
            .await?;
        Ok(outcome.is_some())
    }

    /// Tear an instance down if needed and drop its record.
    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        let current = self
            .store
            .get_instance(id)?
            .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
        if !current.status.is_terminal() {
            let now = self.clock.now_secs();
            self.finish(&current, InstanceStatus::Stopped, now, |_| true)
                .await?;
        }
        self.store.delete_instance(id)?;
        info!(instance_id = %id, "instance deleted");
        Ok(())
    }

    /// Shared teardown path. The terminal transition and the cooldown are
    /// committed together; only the caller whose transition applied tears
    /// the resource down. Returns `None` when `guard` refused or the row was
    /// already terminal.
    async fn finish<G>(
        &self,
        current: &Instance,
        to: InstanceStatus,
        now: u64,
        guard: G,
    ) -> EngineResult<Option<StopOutcome>>
    where
        G: FnOnce(&Instance) -> bool,
    {
        let cooldown = self.lifetime_of(&current.challenge_id)?.cooldown_secs;
        let cooldown_until = now.saturating_add(cooldown);
        let update = self.store.terminate_instance(
            &current.id,
            guard,
            to,
            None,
            now,
            Some(cooldown_until),
        )?;
        let Update::Applied(instance) = update else {
            debug!(instance_id = %current.id, target = %to, "transition lost to another caller");
            return Ok(None);
        };
        info!(
            instance_id = %instance.id,
            owner = %instance.owner,
            status = %to,
            cooldown_until,
            "instance terminated"
        );

        // A row still creating has no handle; the create path releases
        // whatever it provisions once it sees the row moved on.
        if let Some(handle) = &instance.handle {
            match self.backends.get(instance.kind) {
                Some(backend) => self.teardown(backend.as_ref(), &instance.id, handle).await,
                None => warn!(
                    instance_id = %instance.id,
                    kind = %instance.kind,
                    "no backend for instance kind, resource left in place"
                ),
            }
        }
        Ok(Some(StopOutcome {
            instance,
            cooldown_until,
        }))
    }

    // ── Backend calls ──────────────────────────────────────────────

    /// Best-effort stop then remove. Failures are logged only.
    async fn teardown(&self, backend: &dyn Backend, instance_id: &str, handle: &str) {
        if let Err(e) = self.bounded("stop", backend.stop(handle)).await {
            warn!(%instance_id, %handle, error = %e, "backend stop failed");
        }
        self.remove_quietly(backend, instance_id, handle).await;
    }

    async fn remove_quietly(&self, backend: &dyn Backend, instance_id: &str, handle: &str) {
        match self.bounded("remove", backend.remove(handle)).await {
            Ok(()) => debug!(%instance_id, %handle, "backend resource removed"),
            Err(e) => warn!(%instance_id, %handle, error = %e, "backend remove failed"),
        }
    }

    async fn bounded<F>(&self, op: &'static str, call: F) -> BackendResult<()>
    where
        F: Future<Output = BackendResult<()>>,
    {
        tokio::time::timeout(self.settings.call_timeout, call)
            .await
            .unwrap_or(Err(BackendError::Timeout {
                op,
                after: self.settings.call_timeout,
            }))
    }
}

fn validate_challenge(challenge: &Challenge) -> EngineResult<()> {
    let invalid = |msg: &str| Err(EngineError::InvalidChallenge(format!("{}: {msg}", challenge.id)));

    if challenge.id.is_empty() {
        return Err(EngineError::InvalidChallenge("id must not be empty".into()));
    }
    if challenge.id.contains([':', '/']) {
        return invalid("id must not contain ':' or '/'");
    }
    if !(challenge.cpus.is_finite() && challenge.cpus > 0.0) {
        return invalid("cpus must be positive");
    }
    if challenge.memory_mb == 0 {
        return invalid("memory_mb must be positive");
    }
    if challenge.timeout_secs == Some(0) {
        return invalid("timeout_secs must be positive");
    }
    if challenge.cooldown_secs == Some(0) {
        return invalid("cooldown_secs must be positive");
    }
    for (field, value) in [
        ("timeout_secs", challenge.timeout_secs),
        ("extension_secs", challenge.extension_secs),
        ("cooldown_secs", challenge.cooldown_secs),
    ] {
        if value.is_some_and(|v| v > MAX_LIFETIME_SECS) {
            return invalid(&format!("{field} must not exceed {MAX_LIFETIME_SECS}"));
        }
    }
    match challenge.kind {
        BackendKind::Container if challenge.image.is_none() => {
            invalid("container challenges need an image")
        }
        BackendKind::Vm if challenge.template_id.is_none() => {
            invalid("vm challenges need a template_id")
        }
        _ => Ok(()),
    }
}

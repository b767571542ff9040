//! Admission control for new instances.
//!
//! Checks run in a fixed order: the owner's active-instance cap, then the
//! single active instance per (owner, challenge), then the cooldown. The
//! second check is advisory here; the store's uniqueness index makes it
//! binding at insert time.

use tracing::debug;

use lab_core::SharedClock;
use labgrid_state::StateStore;

use crate::error::{AdmissionError, EngineResult};

pub struct AdmissionController {
    store: StateStore,
    per_owner_limit: u32,
    clock: SharedClock,
}

impl AdmissionController {
    pub fn new(store: StateStore, per_owner_limit: u32, clock: SharedClock) -> Self {
        Self {
            store,
            per_owner_limit,
            clock,
        }
    }

    pub fn per_owner_limit(&self) -> u32 {
        self.per_owner_limit
    }

    /// Decide whether `owner` may start `challenge_id` now.
    pub fn check(&self, owner: &str, challenge_id: &str) -> EngineResult<()> {
        let active = self.store.count_active_for_owner(owner)?;
        if active >= self.per_owner_limit {
            debug!(%owner, active, limit = self.per_owner_limit, "owner at instance cap");
            return Err(AdmissionError::ResourceLimitExceeded {
                limit: self.per_owner_limit,
            }
            .into());
        }

        if let Some(existing) = self.store.find_active_instance(owner, challenge_id)? {
            return Err(AdmissionError::AlreadyRunning {
                instance_id: existing.id,
            }
            .into());
        }

        let now = self.clock.now_secs();
        if let Some(cooldown) = self.store.get_cooldown(owner, challenge_id)?
            && cooldown.is_active(now)
        {
            return Err(AdmissionError::CooldownActive {
                remaining_secs: cooldown.remaining_secs(now),
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::ManualClock;
    use labgrid_state::{BackendKind, Cooldown, Instance, InstanceStatus};

    use crate::error::EngineError;

    fn instance(id: &str, owner: &str, challenge: &str, status: InstanceStatus) -> Instance {
        Instance {
            id: id.to_string(),
            owner: owner.to_string(),
            challenge_id: challenge.to_string(),
            kind: BackendKind::Container,
            handle: None,
            node_id: None,
            status,
            address: None,
            ports: Vec::new(),
            created_at: 1000,
            expires_at: 4600,
            extensions_used: 0,
            extensions_max: 2,
            error: None,
            updated_at: 1000,
        }
    }

    fn denial(result: EngineResult<()>) -> AdmissionError {
        match result {
            Err(EngineError::Admission(e)) => e,
            other => panic!("expected admission error, got {other:?}"),
        }
    }

    #[test]
    fn fresh_owner_is_admitted() {
        let store = StateStore::open_in_memory().unwrap();
        let admission = AdmissionController::new(store, 3, ManualClock::shared(1000));
        admission.check("alice", "web").unwrap();
    }

    #[test]
    fn owner_cap_is_checked_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_instance(&instance("i-1", "alice", "web", InstanceStatus::Running)).unwrap();
        store.insert_instance(&instance("i-2", "alice", "pwn", InstanceStatus::Creating)).unwrap();
        store
            .put_cooldown(&Cooldown {
                owner: "alice".into(),
                challenge_id: "web".into(),
                cooldown_until: 2000,
            })
            .unwrap();
        let admission = AdmissionController::new(store, 2, ManualClock::shared(1000));

        assert_eq!(
            denial(admission.check("alice", "web")),
            AdmissionError::ResourceLimitExceeded { limit: 2 }
        );
    }

    #[test]
    fn terminal_rows_do_not_count() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_instance(&instance("i-1", "alice", "web", InstanceStatus::Stopped)).unwrap();
        store.insert_instance(&instance("i-2", "alice", "pwn", InstanceStatus::Failed)).unwrap();
        let admission = AdmissionController::new(store, 1, ManualClock::shared(1000));
        admission.check("alice", "crypto").unwrap();
    }

    #[test]
    fn existing_instance_is_reported() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_instance(&instance("i-1", "alice", "web", InstanceStatus::Running)).unwrap();
        let admission = AdmissionController::new(store, 3, ManualClock::shared(1000));

        assert_eq!(
            denial(admission.check("alice", "web")),
            AdmissionError::AlreadyRunning {
                instance_id: "i-1".into()
            }
        );
        admission.check("bob", "web").unwrap();
    }

    #[test]
    fn cooldown_remaining_counts_down() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_cooldown(&Cooldown {
                owner: "alice".into(),
                challenge_id: "web".into(),
                cooldown_until: 1300,
            })
            .unwrap();
        let clock = ManualClock::shared(1000);
        let admission = AdmissionController::new(store, 3, clock.clone());

        assert_eq!(
            denial(admission.check("alice", "web")),
            AdmissionError::CooldownActive { remaining_secs: 300 }
        );
        clock.advance(120);
        assert_eq!(
            denial(admission.check("alice", "web")),
            AdmissionError::CooldownActive { remaining_secs: 180 }
        );
        clock.set(1300);
        admission.check("alice", "web").unwrap();
    }
}

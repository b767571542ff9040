//! StateStore — redb-backed state persistence for labgrid.
//!
//! Provides typed CRUD operations over challenges, instances, cooldowns,
//! nodes, templates and upload sessions. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Read-modify-write operations run inside a single redb write transaction.
//! redb serializes write transactions, which is what makes the uniqueness
//! check in [`StateStore::insert_instance`] and the compare-and-set in
//! [`StateStore::terminate_instance`] atomic.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Outcome of a conditional read-modify-write.
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    /// The mutation was applied; carries the new value.
    Applied(T),
    /// The mutation was declined; carries the unchanged current value.
    Unchanged(T),
}

/// Outcome of [`StateStore::delete_idle_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRemoval {
    Removed,
    /// The node still hosts this many non-terminal instances.
    Busy(u32),
    Missing,
}

impl<T> Update<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Update::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Update::Applied(v) | Update::Unchanged(v) => v,
        }
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CHALLENGES).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(COOLDOWNS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
        txn.open_table(UPLOADS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON record helpers ────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a record in one transaction. `f` returns `false`
    /// to decline the change.
    fn update_json<T, F>(&self, table: JsonTable, key: &str, f: F) -> StateResult<Update<T>>
    where
        T: Clone + Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current: T = t
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let mut next = current.clone();
            if f(&mut next) {
                let bytes = encode(&next)?;
                t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
                Update::Applied(next)
            } else {
                Update::Unchanged(current)
            }
        };
        if outcome.is_applied() {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(outcome)
    }

    // ── Challenges ─────────────────────────────────────────────────

    /// Insert or replace a challenge definition.
    pub fn put_challenge(&self, challenge: &Challenge) -> StateResult<()> {
        self.put_json(CHALLENGES, &challenge.id, challenge)?;
        debug!(challenge_id = %challenge.id, "challenge stored");
        Ok(())
    }

    pub fn get_challenge(&self, id: &str) -> StateResult<Option<Challenge>> {
        self.get_json(CHALLENGES, id)
    }

    pub fn list_challenges(&self) -> StateResult<Vec<Challenge>> {
        self.list_json(CHALLENGES)
    }

    pub fn delete_challenge(&self, id: &str) -> StateResult<bool> {
        self.delete_key(CHALLENGES, id)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert a new instance row.
    ///
    /// For non-terminal rows the `(owner, challenge)` index entry is checked
    /// and written in the same transaction; if another non-terminal
    /// instance already holds the pair, nothing is written and
    /// [`StateError::ActiveInstanceExists`] is returned.
    pub fn insert_instance(&self, instance: &Instance) -> StateResult<()> {
        let pair = instance.pair_key();
        let value = encode(instance)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let conflict = {
            let mut active = txn.open_table(ACTIVE_INSTANCES).map_err(map_err!(Table))?;
            let existing = active
                .get(pair.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            match existing {
                Some(existing) if !instance.status.is_terminal() => Some(existing),
                _ => {
                    if !instance.status.is_terminal() {
                        active
                            .insert(pair.as_str(), instance.id.as_str())
                            .map_err(map_err!(Write))?;
                    }
                    let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
                    instances
                        .insert(instance.id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    None
                }
            }
        };

        if let Some(instance_id) = conflict {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(%pair, %instance_id, "active instance already exists");
            return Err(StateError::ActiveInstanceExists {
                owner: instance.owner.clone(),
                challenge_id: instance.challenge_id.clone(),
                instance_id,
            });
        }

        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = %instance.id, %pair, "instance inserted");
        Ok(())
    }

    /// Get an instance by id.
    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_json(INSTANCES, id)
    }

    /// List every instance, terminal rows included.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.list_json(INSTANCES)
    }

    /// List all instances belonging to `owner`.
    pub fn list_instances_for_owner(&self, owner: &str) -> StateResult<Vec<Instance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.owner == owner)
            .collect())
    }

    /// List all instances currently in `status`.
    pub fn list_instances_with_status(&self, status: InstanceStatus) -> StateResult<Vec<Instance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.status == status)
            .collect())
    }

    /// Number of non-terminal instances held by `owner`.
    pub fn count_active_for_owner(&self, owner: &str) -> StateResult<u32> {
        let count = self
            .list_instances()?
            .iter()
            .filter(|i| i.owner == owner && !i.status.is_terminal())
            .count();
        Ok(count as u32)
    }

    /// The non-terminal instance for `(owner, challenge_id)`, if any.
    pub fn find_active_instance(
        &self,
        owner: &str,
        challenge_id: &str,
    ) -> StateResult<Option<Instance>> {
        let pair = pair_key(owner, challenge_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_INSTANCES).map_err(map_err!(Table))?;
        let Some(instance_id) = active
            .get(pair.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string())
        else {
            return Ok(None);
        };
        let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match instances.get(instance_id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write a non-terminal instance.
    ///
    /// Terminal rows are immutable: `f` is not called for them and the
    /// current row is returned as [`Update::Unchanged`]. If `f` moves the
    /// row into a terminal status, the uniqueness index entry is released
    /// in the same transaction.
    pub fn update_instance<F>(&self, id: &str, f: F) -> StateResult<Update<Instance>>
    where
        F: FnOnce(&mut Instance) -> bool,
    {
        self.write_instance_update(id, None, f)
    }

    /// Move a non-terminal instance into the terminal status `to`, if
    /// `guard` accepts its current state.
    ///
    /// Only the first caller wins: a concurrent terminator observes
    /// [`Update::Unchanged`]. When `cooldown_until` is given, the cooldown
    /// for the instance's pair is upserted in the same transaction so that
    /// no Create can slip in between the index release and the cooldown.
    pub fn terminate_instance<G>(
        &self,
        id: &str,
        guard: G,
        to: InstanceStatus,
        error: Option<String>,
        now: u64,
        cooldown_until: Option<u64>,
    ) -> StateResult<Update<Instance>>
    where
        G: FnOnce(&Instance) -> bool,
    {
        debug_assert!(to.is_terminal());
        self.write_instance_update(id, cooldown_until, |inst| {
            if !guard(&*inst) {
                return false;
            }
            inst.status = to;
            if error.is_some() {
                inst.error = error;
            }
            inst.updated_at = now;
            true
        })
    }

    fn write_instance_update<F>(
        &self,
        id: &str,
        cooldown_until: Option<u64>,
        f: F,
    ) -> StateResult<Update<Instance>>
    where
        F: FnOnce(&mut Instance) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: Instance = instances
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?
                .ok_or_else(|| StateError::NotFound(format!("instance {id}")))?;

            let mut next = current.clone();
            if current.status.is_terminal() || !f(&mut next) {
                Update::Unchanged(current)
            } else {
                let value = encode(&next)?;
                instances
                    .insert(id, value.as_slice())
                    .map_err(map_err!(Write))?;

                if next.status.is_terminal() {
                    let pair = next.pair_key();
                    let mut active = txn.open_table(ACTIVE_INSTANCES).map_err(map_err!(Table))?;
                    let held = active
                        .get(pair.as_str())
                        .map_err(map_err!(Read))?
                        .is_some_and(|guard| guard.value() == id);
                    if held {
                        active.remove(pair.as_str()).map_err(map_err!(Write))?;
                    }

                    if let Some(until) = cooldown_until {
                        let cooldown = Cooldown {
                            owner: next.owner.clone(),
                            challenge_id: next.challenge_id.clone(),
                            cooldown_until: until,
                        };
                        let bytes = encode(&cooldown)?;
                        let mut cooldowns = txn.open_table(COOLDOWNS).map_err(map_err!(Table))?;
                        cooldowns
                            .insert(pair.as_str(), bytes.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                }
                Update::Applied(next)
            }
        };

        if outcome.is_applied() {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(outcome)
    }

    /// Delete an instance row. Returns true if it existed.
    ///
    /// Also drops the uniqueness index entry if it points at this row.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let removed: Option<Instance> = instances
                .remove(id)
                .map_err(map_err!(Write))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            existed = removed.is_some();

            if let Some(instance) = removed {
                let pair = instance.pair_key();
                let mut active = txn.open_table(ACTIVE_INSTANCES).map_err(map_err!(Table))?;
                let held = active
                    .get(pair.as_str())
                    .map_err(map_err!(Read))?
                    .is_some_and(|guard| guard.value() == id);
                if held {
                    active.remove(pair.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = %id, existed, "instance deleted");
        Ok(existed)
    }

    // ── Cooldowns ──────────────────────────────────────────────────

    /// Insert or replace a cooldown record.
    pub fn put_cooldown(&self, cooldown: &Cooldown) -> StateResult<()> {
        self.put_json(COOLDOWNS, &cooldown.table_key(), cooldown)
    }

    pub fn get_cooldown(&self, owner: &str, challenge_id: &str) -> StateResult<Option<Cooldown>> {
        self.get_json(COOLDOWNS, &pair_key(owner, challenge_id))
    }

    pub fn list_cooldowns(&self) -> StateResult<Vec<Cooldown>> {
        self.list_json(COOLDOWNS)
    }

    /// Delete every cooldown that has lifted by `now`. Returns number deleted.
    pub fn purge_expired_cooldowns(&self, now: u64) -> StateResult<u32> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = self
            .list_cooldowns()?
            .into_iter()
            .filter(|c| !c.is_active(now))
            .map(|c| c.table_key())
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(COOLDOWNS).map_err(map_err!(Table))?;
            for key in &keys {
                // Re-check under the write lock; a Stop may have renewed it.
                let still_expired = table
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| decode::<Cooldown>(guard.value()))
                    .transpose()?
                    .is_some_and(|c| !c.is_active(now));
                if still_expired {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put_json(NODES, &node.id, node)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get_json(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_json(NODES)
    }

    /// Read-modify-write a node in one transaction.
    pub fn update_node<F>(&self, node_id: &str, f: F) -> StateResult<Update<Node>>
    where
        F: FnOnce(&mut Node) -> bool,
    {
        self.update_json(NODES, node_id, f)
    }

    /// Delete a node only if no non-terminal instance is placed on it. The
    /// count and the delete share one write transaction, so an instance
    /// committed onto the node cannot slip in between.
    pub fn delete_idle_node(&self, node_id: &str) -> StateResult<NodeRemoval> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut active = 0u32;
            for entry in instances.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let instance: Instance = decode(value.value())?;
                if instance.node_id.as_deref() == Some(node_id) && !instance.status.is_terminal() {
                    active += 1;
                }
            }
            if active > 0 {
                NodeRemoval::Busy(active)
            } else {
                let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
                match nodes.remove(node_id).map_err(map_err!(Write))? {
                    Some(_) => NodeRemoval::Removed,
                    None => NodeRemoval::Missing,
                }
            }
        };
        if outcome == NodeRemoval::Removed {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(%node_id, "node deleted");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(outcome)
    }

    // ── Templates ──────────────────────────────────────────────────

    pub fn put_template(&self, template: &VmTemplate) -> StateResult<()> {
        self.put_json(TEMPLATES, &template.id, template)?;
        debug!(template_id = %template.id, name = %template.name, "template stored");
        Ok(())
    }

    pub fn get_template(&self, id: &str) -> StateResult<Option<VmTemplate>> {
        self.get_json(TEMPLATES, id)
    }

    pub fn list_templates(&self) -> StateResult<Vec<VmTemplate>> {
        self.list_json(TEMPLATES)
    }

    pub fn update_template<F>(&self, id: &str, f: F) -> StateResult<Update<VmTemplate>>
    where
        F: FnOnce(&mut VmTemplate) -> bool,
    {
        self.update_json(TEMPLATES, id, f)
    }

    // ── Upload sessions ────────────────────────────────────────────

    pub fn put_upload(&self, session: &UploadSession) -> StateResult<()> {
        self.put_json(UPLOADS, &session.id, session)
    }

    pub fn get_upload(&self, id: &str) -> StateResult<Option<UploadSession>> {
        self.get_json(UPLOADS, id)
    }

    pub fn list_uploads(&self) -> StateResult<Vec<UploadSession>> {
        self.list_json(UPLOADS)
    }

    /// Read-modify-write an upload session in one transaction, so concurrent
    /// chunk receipts never lose each other's updates.
    pub fn update_upload<F>(&self, id: &str, f: F) -> StateResult<Update<UploadSession>>
    where
        F: FnOnce(&mut UploadSession) -> bool,
    {
        self.update_json(UPLOADS, id, f)
    }
}

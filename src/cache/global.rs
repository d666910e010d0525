//! The process-wide tier: data, listed flags, increment counters and
//! per-model commit locks.
//!
//! Every map is keyed by `model_key`. Data entries are soft-deleted by
//! flipping the instance invalid, never by erasing on the read path. The
//! commit worker erases them after the corresponding remote mutation has
//! landed, so concurrent readers only ever observe "present" or "gone",
//! never a torn erase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::model::{cell_valid, new_cell, Model, ModelCell};

const SOURCE: &str = "cache::global";

/// Rows of one model type, keyed by `data_key`.
pub type ModelMap = Arc<RwLock<HashMap<String, ModelCell>>>;

/// Presence of a gate means a deletion or clear commit for the model is in
/// flight. Readers that fall through to the remote tier park on it.
struct ModelGate {
    holds: AtomicI64,
    released: AtomicBool,
    notify: Notify,
}

impl ModelGate {
    fn new() -> Self {
        Self {
            holds: AtomicI64::new(0),
            released: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

pub struct GlobalStore {
    data: RwLock<HashMap<String, ModelMap>>,
    listed: RwLock<HashMap<String, bool>>,
    locks: Mutex<HashMap<String, Arc<ModelGate>>>,
    counters: RwLock<HashMap<String, Arc<AtomicI64>>>,
    counter_init: tokio::sync::Mutex<()>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            listed: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            counter_init: tokio::sync::Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Data map
    // ------------------------------------------------------------------

    pub fn model_map(&self, model_key: &str) -> Option<ModelMap> {
        rw_read(&self.data, SOURCE, "model_map")
            .get(model_key)
            .cloned()
    }

    fn ensure_model_map(&self, model_key: &str) -> ModelMap {
        if let Some(map) = self.model_map(model_key) {
            return map;
        }
        rw_write(&self.data, SOURCE, "ensure_model_map")
            .entry(model_key.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, model_key: &str, data_key: &str) -> Option<ModelCell> {
        let map = self.model_map(model_key)?;
        let cell = rw_read(&map, SOURCE, "get").get(data_key).cloned();
        cell
    }

    /// Insert-or-replace one instance.
    ///
    /// Replacing a still-valid entry is unexpected enough to warn about;
    /// replacing a soft-deleted entry is the normal resurrect path and
    /// stays silent. Existing cells are updated in place so concurrent
    /// holders observe the new value.
    pub fn put(&self, model: Box<dyn Model>) {
        let model_key = model.model_key();
        let data_key = model.data_key();
        let map = self.ensure_model_map(&model_key);

        let existing = rw_read(&map, SOURCE, "put").get(&data_key).cloned();
        match existing {
            Some(cell) => {
                if cell_valid(&cell) {
                    warn!(data_key = %data_key, "global cache entry overwritten");
                }
                *rw_write(&cell, SOURCE, "put_replace") = model;
            }
            None => {
                rw_write(&map, SOURCE, "put_insert").insert(data_key, new_cell(model));
            }
        }
    }

    /// Replace an entry in place, only if the row is already cached.
    /// Used by `defer` to push a session's final state into the global
    /// tier ahead of the asynchronous replication.
    pub fn refresh(&self, model: Box<dyn Model>) {
        let Some(cell) = self.get(&model.model_key(), &model.data_key()) else {
            return;
        };
        *rw_write(&cell, SOURCE, "refresh") = model;
    }

    /// Snapshot of one model's `(data_key, cell)` pairs. Callers iterate
    /// outside the map lock.
    pub fn entries(&self, model_key: &str) -> Vec<(String, ModelCell)> {
        let Some(map) = self.model_map(model_key) else {
            return Vec::new();
        };
        let snapshot = rw_read(&map, SOURCE, "entries")
            .iter()
            .map(|(data_key, cell)| (data_key.clone(), cell.clone()))
            .collect();
        snapshot
    }

    /// Drop one entry if it is still marked invalid. Runs in the commit
    /// worker after the remote delete has landed.
    pub fn remove_if_invalid(&self, model_key: &str, data_key: &str) {
        if let Some(map) = self.model_map(model_key) {
            let mut map = rw_write(&map, SOURCE, "remove_if_invalid");
            if let Some(cell) = map.get(data_key) {
                if !rw_read(cell, SOURCE, "remove_if_invalid_check").valid() {
                    map.remove(data_key);
                }
            }
        }
    }

    /// Drop every soft-deleted entry of a model. Runs in the commit worker
    /// after a remote clear has landed.
    pub fn sweep_invalid(&self, model_key: &str) {
        if let Some(map) = self.model_map(model_key) {
            rw_write(&map, SOURCE, "sweep_invalid")
                .retain(|_, cell| rw_read(cell, SOURCE, "sweep_check").valid());
        }
    }

    // ------------------------------------------------------------------
    // Listed flags
    // ------------------------------------------------------------------

    pub fn is_listed(&self, model_key: &str) -> bool {
        rw_read(&self.listed, SOURCE, "is_listed")
            .get(model_key)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_listed(&self, model_key: &str, listed: bool) {
        rw_write(&self.listed, SOURCE, "set_listed").insert(model_key.to_string(), listed);
    }

    // ------------------------------------------------------------------
    // Per-model commit locks
    // ------------------------------------------------------------------

    /// Take one hold on the model's gate, installing it on first use.
    pub fn lock(&self, model_key: &str) {
        let mut locks = mutex_lock(&self.locks, SOURCE, "lock");
        let gate = locks
            .entry(model_key.to_string())
            .or_insert_with(|| Arc::new(ModelGate::new()));
        let holds = gate.holds.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(model = %model_key, holds, "commit lock acquired");
    }

    /// Drop the gate entirely and release every waiter.
    ///
    /// Load-and-delete semantics: the first unlock wins and later unlocks
    /// of the same gate are no-ops. Tolerable because deletion commits
    /// serialize per shard; revisit if sharding changes.
    pub fn unlock(&self, model_key: &str) {
        let gate = mutex_lock(&self.locks, SOURCE, "unlock").remove(model_key);
        if let Some(gate) = gate {
            gate.released.store(true, Ordering::Release);
            gate.notify.notify_waiters();
            debug!(model = %model_key, "commit lock released");
        }
    }

    /// Park until no deletion commit is in flight for the model.
    pub async fn wait_unlocked(&self, caller: &'static str, model_key: &str) {
        let gate = mutex_lock(&self.locks, SOURCE, "wait_unlocked")
            .get(model_key)
            .cloned();
        let Some(gate) = gate else {
            return;
        };

        debug!(caller, model = %model_key, "waiting for commit lock");
        loop {
            let notified = gate.notify.notified();
            if gate.released.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
        debug!(caller, model = %model_key, "commit lock cleared");
    }

    // ------------------------------------------------------------------
    // Increment counters
    // ------------------------------------------------------------------

    pub fn counter(&self, key: &str) -> Option<Arc<AtomicI64>> {
        rw_read(&self.counters, SOURCE, "counter").get(key).cloned()
    }

    /// Install a counter if absent; returns the live counter either way.
    pub fn install_counter(&self, key: &str, initial: i64) -> Arc<AtomicI64> {
        rw_write(&self.counters, SOURCE, "install_counter")
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(initial)))
            .clone()
    }

    /// Serializes first-use counter initialization against the remote MAX.
    pub fn counter_init_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.counter_init
    }

    // ------------------------------------------------------------------
    // Dump
    // ------------------------------------------------------------------

    /// Wipe everything: data, listed flags, counters; outstanding lock
    /// waiters are released, not stranded.
    pub fn dump_all(&self) {
        rw_write(&self.data, SOURCE, "dump_all_data").clear();
        rw_write(&self.listed, SOURCE, "dump_all_listed").clear();
        rw_write(&self.counters, SOURCE, "dump_all_counters").clear();

        let mut locks = mutex_lock(&self.locks, SOURCE, "dump_all_locks");
        for gate in locks.values() {
            gate.released.store(true, Ordering::Release);
            gate.notify.notify_waiters();
        }
        locks.clear();
    }

    /// Wipe one model's footprint across every map.
    pub fn dump_model(&self, model_key: &str) {
        rw_write(&self.data, SOURCE, "dump_model_data").remove(model_key);
        rw_write(&self.listed, SOURCE, "dump_model_listed").remove(model_key);

        let prefix = format!("{model_key}|");
        rw_write(&self.counters, SOURCE, "dump_model_counters")
            .retain(|key, _| !key.starts_with(&prefix));

        if let Some(gate) = mutex_lock(&self.locks, SOURCE, "dump_model_locks").remove(model_key) {
            gate.released.store(true, Ordering::Release);
            gate.notify.notify_waiters();
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn data_snapshot(&self) -> Vec<(String, String)> {
        let maps: Vec<ModelMap> = rw_read(&self.data, SOURCE, "data_snapshot")
            .values()
            .cloned()
            .collect();
        let mut rows = Vec::new();
        for map in maps {
            for (data_key, cell) in rw_read(&map, SOURCE, "data_snapshot_rows").iter() {
                rows.push((
                    data_key.clone(),
                    rw_read(cell, SOURCE, "data_snapshot_json").json(),
                ));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn listed_snapshot(&self) -> Vec<(String, bool)> {
        let mut rows: Vec<(String, bool)> = rw_read(&self.listed, SOURCE, "listed_snapshot")
            .iter()
            .map(|(key, listed)| (key.clone(), *listed))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn counter_snapshot(&self) -> Vec<(String, i64)> {
        let mut rows: Vec<(String, i64)> = rw_read(&self.counters, SOURCE, "counter_snapshot")
            .iter()
            .map(|(key, value)| (key.clone(), value.load(Ordering::Acquire)))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn lock_snapshot(&self) -> Vec<String> {
        let mut keys: Vec<String> = mutex_lock(&self.locks, SOURCE, "lock_snapshot")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl Default for GlobalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_without_lock_is_pass_through() {
        let store = GlobalStore::new();
        store.wait_unlocked("test", "game_user").await;
    }

    #[tokio::test]
    async fn waiters_release_on_unlock() {
        let store = Arc::new(GlobalStore::new());
        store.lock("game_user");

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.wait_unlocked("test", "game_user").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.unlock("game_user");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("waiter task");
        assert!(store.lock_snapshot().is_empty());
    }

    #[tokio::test]
    async fn dump_all_releases_waiters() {
        let store = Arc::new(GlobalStore::new());
        store.lock("game_user");
        store.install_counter("game_user|id", 5);
        store.set_listed("game_user", true);

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.wait_unlocked("test", "game_user").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.dump_all();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("waiter task");

        assert!(store.counter_snapshot().is_empty());
        assert!(store.listed_snapshot().is_empty());
        assert!(store.lock_snapshot().is_empty());
    }
}

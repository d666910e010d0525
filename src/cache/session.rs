//! The per-session tier: entries a single logical thread has touched
//! between `watch` and `defer`.
//!
//! Each entry pairs the live working instance (shared with the caller
//! through a [`Handle`](crate::model::Handle)) with an immutable snapshot
//! taken at first insertion. The snapshot never changes; `defer` diffs the
//! live instance against it to detect updates.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::warn;

use crate::cache::lock::{rw_read, rw_write};
use crate::cond::Condition;
use crate::model::{clone_fresh, new_cell, Model, ModelCell};

const SOURCE: &str = "cache::session";

/// Monotonic write intent: `Unmarked -> ReadOnly -> ReadWrite`, never down.
///
/// Read-only entries are skipped by dirty detection; the lattice guarantees
/// that one writable touch anywhere in the session keeps the entry eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteState {
    Unmarked,
    ReadOnly,
    ReadWrite,
}

impl WriteState {
    /// Apply one observation to the lattice.
    pub fn observe(&mut self, writable: bool) {
        let next = if writable {
            Self::ReadWrite
        } else {
            Self::ReadOnly
        };
        if next > *self {
            *self = next;
        }
    }
}

/// One `(session, row)` record.
pub struct SessionEntry {
    /// Live working instance, aliased by caller handles.
    pub cell: ModelCell,
    /// Snapshot captured at first insertion; dirty-detection baseline.
    pub raw: Box<dyn Model>,
    pub write: WriteState,
    /// Set by `write` on a first-seen instance.
    pub create: bool,
    /// Set by `delete`.
    pub delete: bool,
    /// Present when the session issued a bulk clear.
    pub clear: Option<Condition>,
    /// Insertion order within the session, preserved into the commit batch.
    pub seq: u64,
}

impl SessionEntry {
    pub fn set_writable(&mut self, writable: bool) {
        self.write.observe(writable);
    }
}

type ModelEntries = HashMap<String, SessionEntry>;
type SessionEntries = HashMap<String, ModelEntries>;

pub struct SessionStore {
    entries: RwLock<HashMap<u64, SessionEntries>>,
    listed: RwLock<HashMap<u64, HashMap<String, bool>>>,
    seq: AtomicU64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            listed: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Insert-or-replace the entry for the instance's `data_key`, then run
    /// `apply` on it under the store lock.
    ///
    /// Replacing a still-valid entry with a different value is logged; the
    /// existing cell is updated in place so caller handles stay current.
    /// Tracking flags survive replacement; only the instance and its
    /// snapshot move.
    pub fn put_with<R>(
        &self,
        gid: u64,
        model: Box<dyn Model>,
        apply: impl FnOnce(&mut SessionEntry) -> R,
    ) -> R {
        let model_key = model.model_key();
        let data_key = model.data_key();

        let mut sessions = rw_write(&self.entries, SOURCE, "put_with");
        let entries = sessions
            .entry(gid)
            .or_default()
            .entry(model_key)
            .or_default();

        match entries.entry(data_key) {
            Entry::Occupied(mut slot) => {
                {
                    let current = rw_read(&slot.get().cell, SOURCE, "put_overwrite_check");
                    if current.valid() && !current.equals(model.as_ref()) {
                        warn!(data_key = %slot.key(), "session cache entry overwritten");
                    }
                }
                let entry = slot.get_mut();
                entry.raw = clone_fresh(model.as_ref());
                *rw_write(&entry.cell, SOURCE, "put_replace") = model;
                apply(entry)
            }
            Entry::Vacant(slot) => {
                let entry = slot.insert(SessionEntry {
                    raw: clone_fresh(model.as_ref()),
                    cell: new_cell(model),
                    write: WriteState::Unmarked,
                    create: false,
                    delete: false,
                    clear: None,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                });
                apply(entry)
            }
        }
    }

    /// Run `apply` on an existing entry; `None` when the row was never
    /// touched by this session.
    pub fn with_entry<R>(
        &self,
        gid: u64,
        model_key: &str,
        data_key: &str,
        apply: impl FnOnce(&mut SessionEntry) -> R,
    ) -> Option<R> {
        let mut sessions = rw_write(&self.entries, SOURCE, "with_entry");
        sessions
            .get_mut(&gid)?
            .get_mut(model_key)?
            .get_mut(data_key)
            .map(apply)
    }

    /// Visit every entry of one model; the visitor returns `false` to stop.
    pub fn for_each_entry(
        &self,
        gid: u64,
        model_key: &str,
        mut visit: impl FnMut(&mut SessionEntry) -> bool,
    ) {
        let mut sessions = rw_write(&self.entries, SOURCE, "for_each_entry");
        let Some(entries) = sessions.get_mut(&gid).and_then(|s| s.get_mut(model_key)) else {
            return;
        };
        for entry in entries.values_mut() {
            if !visit(entry) {
                break;
            }
        }
    }

    /// Detach and return everything this session touched. Called by `defer`.
    pub fn take_session(&self, gid: u64) -> Option<SessionEntries> {
        rw_write(&self.entries, SOURCE, "take_session").remove(&gid)
    }

    pub fn has_session(&self, gid: u64) -> bool {
        rw_read(&self.entries, SOURCE, "has_session").contains_key(&gid)
    }

    pub fn is_listed(&self, gid: u64, model_key: &str) -> bool {
        rw_read(&self.listed, SOURCE, "is_listed")
            .get(&gid)
            .and_then(|flags| flags.get(model_key))
            .copied()
            .unwrap_or(false)
    }

    pub fn set_listed(&self, gid: u64, model_key: &str, listed: bool) {
        rw_write(&self.listed, SOURCE, "set_listed")
            .entry(gid)
            .or_default()
            .insert(model_key.to_string(), listed);
    }

    /// Drop the listed flags of one session. Called by `defer`.
    pub fn drop_listed(&self, gid: u64) {
        rw_write(&self.listed, SOURCE, "drop_listed").remove(&gid);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_state_never_downgrades() {
        let mut state = WriteState::Unmarked;
        state.observe(false);
        assert_eq!(state, WriteState::ReadOnly);
        state.observe(true);
        assert_eq!(state, WriteState::ReadWrite);
        state.observe(false);
        assert_eq!(state, WriteState::ReadWrite);
    }

    #[test]
    fn unmarked_accepts_either_state() {
        let mut readonly = WriteState::Unmarked;
        readonly.observe(false);
        assert_eq!(readonly, WriteState::ReadOnly);

        let mut readwrite = WriteState::Unmarked;
        readwrite.observe(true);
        assert_eq!(readwrite, WriteState::ReadWrite);
    }
}

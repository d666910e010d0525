//! Session lifecycle: `watch` opens a context for the current logical
//! thread, CRUD primitives accumulate entries against it, `defer` diffs
//! what changed and hands one batch to the commit pipeline.

mod clear;
mod count;
mod delete;
mod incre;
mod list;
mod read;
mod write;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::cache::lock::{rw_read, rw_write};
use crate::cache::session::WriteState;
use crate::commit::{CommitAction, CommitBatch, CommitEntry, FlushTarget};
use crate::cond::Condition;
use crate::engine::Core;
use crate::error::OrmError;
use crate::model::{cell_valid, clone_fresh, Model};

const SOURCE: &str = "session";

/// Identity of the current logical thread of control.
///
/// Inside the tokio runtime this is the task id, which is stable for the
/// task's lifetime and never shared between live tasks. Outside a task the
/// thread id stands in.
pub(crate) fn logical_id() -> u64 {
    if let Some(id) = tokio::task::try_id() {
        let text = id.to_string();
        if let Ok(value) = text.parse::<u64>() {
            return value;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        return hasher.finish();
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

/// Which primitive an accounting sample belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum OpKind {
    Read,
    List,
    Write,
    Delete,
    Clear,
    Incre,
}

/// Per-primitive call and latency counters for one session.
#[derive(Default)]
pub(crate) struct OpCounters {
    counts: [AtomicU64; 6],
    micros: [AtomicU64; 6],
}

impl OpCounters {
    pub(crate) fn note(&self, kind: OpKind, elapsed: Duration) {
        let slot = kind as usize;
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
        self.micros[slot].fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn summary(&self) -> String {
        const NAMES: [&str; 6] = ["read", "list", "write", "delete", "clear", "incre"];
        let mut parts = Vec::new();
        for (slot, name) in NAMES.iter().enumerate() {
            let count = self.counts[slot].load(Ordering::Relaxed);
            if count > 0 {
                let millis = self.micros[slot].load(Ordering::Relaxed) as f64 / 1e3;
                parts.push(format!("{name}({count}):{millis:.2}ms"));
            }
        }
        parts.join(" ")
    }
}

/// Live state of one `watch`..`defer` block.
pub(crate) struct SessionContext {
    pub sid: u64,
    pub writable: bool,
    pub started: Instant,
    pub ops: OpCounters,
}

/// `gid -> context` for every open session.
pub(crate) struct ContextRegistry {
    contexts: RwLock<HashMap<u64, Arc<SessionContext>>>,
    next_sid: AtomicU64,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            next_sid: AtomicU64::new(0),
        }
    }

    /// Open a context for `gid`, returning the allocated session id. An
    /// existing context for the same gid is replaced, like a missing
    /// `defer` would leave behind.
    pub fn open(&self, gid: u64, writable: bool) -> Arc<SessionContext> {
        let context = Arc::new(SessionContext {
            sid: self.next_sid.fetch_add(1, Ordering::AcqRel) + 1,
            writable,
            started: Instant::now(),
            ops: OpCounters::default(),
        });
        rw_write(&self.contexts, SOURCE, "open").insert(gid, Arc::clone(&context));
        context
    }

    pub fn get(&self, gid: u64) -> Option<Arc<SessionContext>> {
        rw_read(&self.contexts, SOURCE, "get").get(&gid).cloned()
    }

    pub fn remove(&self, gid: u64) -> Option<Arc<SessionContext>> {
        rw_write(&self.contexts, SOURCE, "remove").remove(&gid)
    }

    pub fn contains(&self, gid: u64) -> bool {
        rw_read(&self.contexts, SOURCE, "contains").contains_key(&gid)
    }
}

/// Optional per-call arguments of the read-side primitives: an explicit
/// writable intent and/or a condition.
#[derive(Default, Clone, Copy)]
pub struct Options<'a> {
    pub(crate) writable: Option<bool>,
    pub(crate) cond: Option<&'a Condition>,
}

impl<'a> Options<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = Some(writable);
        self
    }

    pub fn cond(mut self, cond: &'a Condition) -> Self {
        self.cond = Some(cond);
        self
    }
}

/// One `watch`..`defer` block bound to a logical thread.
///
/// Obtained from [`Engine::watch`](crate::engine::Engine::watch). CRUD runs
/// against this session's tier first; `defer` ends the block. Using a
/// session after its `defer` is the "no context" error and degrades to
/// logged no-ops.
pub struct Session {
    pub(crate) core: Arc<Core>,
    pub(crate) pipeline: Arc<crate::commit::CommitPipeline>,
    pub(crate) gid: u64,
    pub(crate) sid: u64,
}

impl Session {
    /// Session id allocated by `watch`, monotonically increasing.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Logical-thread id the session is keyed under; also the shard key.
    pub fn gid(&self) -> u64 {
        self.gid
    }

    /// Shared preamble of every primitive: dump barrier, context lookup,
    /// meta lookup.
    pub(crate) async fn preamble(
        &self,
        op: &'static str,
        model: &dyn Model,
    ) -> Option<(Arc<SessionContext>, Arc<crate::model::meta::ModelMeta>)> {
        self.core.gate.wait().await;

        let Some(context) = self.core.contexts.get(self.gid) else {
            let err = OrmError::NoContext { gid: self.gid };
            error!(critical = true, op, error = %err, "primitive outside a session");
            return None;
        };
        let Some(meta) = self.core.metas.lookup(model) else {
            let err = OrmError::NotRegistered {
                model: model.model_key(),
            };
            error!(critical = true, op, error = %err, "primitive on an unregistered model");
            return None;
        };
        Some((context, meta))
    }

    /// Writability gate of the mutating primitives.
    pub(crate) fn writable_or_log(
        &self,
        op: &'static str,
        context: &SessionContext,
        meta: &crate::model::meta::ModelMeta,
    ) -> bool {
        if !context.writable || !meta.writable {
            let err = OrmError::NotWritable {
                model: meta.model_key.clone(),
            };
            error!(op, sid = context.sid, error = %err, "mutating primitive ignored");
            return false;
        }
        true
    }

    /// Wait for the pipeline to drain this session's shard.
    pub async fn flush(&self) {
        self.pipeline.flush(FlushTarget::Gid(self.gid)).await;
    }

    /// End the session: detect what changed, build one commit batch, route
    /// it to this gid's shard, and drop the session tier.
    ///
    /// Read-only contexts drop their entries without producing a batch.
    pub async fn defer(&self) {
        self.core.gate.wait().await;

        let Some(context) = self.core.contexts.remove(self.gid) else {
            error!(gid = self.gid, "defer without a matching watch");
            return;
        };

        let sessions = self.core.session.take_session(self.gid);
        if let Some(sessions) = sessions {
            if context.writable {
                let entries = self.collect_batch(sessions);
                if !entries.is_empty() {
                    let mut batch = CommitBatch::new(self.gid);
                    batch.entries = entries;
                    self.pipeline.submit(batch);
                }
            }
            // A read-only session's entries are simply dropped.
        }
        self.core.session.drop_listed(self.gid);

        info!(
            sid = context.sid,
            elapsed_ms = context.started.elapsed().as_secs_f64() * 1e3,
            crud = %context.ops.summary(),
            "session deferred"
        );
    }

    /// Diff every touched entry and produce the commit entries, in session
    /// insertion order.
    fn collect_batch(
        &self,
        sessions: HashMap<String, HashMap<String, crate::cache::SessionEntry>>,
    ) -> Vec<CommitEntry> {
        let mut ordered: Vec<(u64, CommitEntry)> = Vec::new();

        for (model_key, rows) in sessions {
            let Some(meta) = self.core.metas.get(&model_key) else {
                continue;
            };
            if !meta.writable {
                // Globally read-only data never reaches the pipeline.
                continue;
            }

            for (data_key, entry) in rows {
                let action = if entry.create {
                    rw_write(&entry.cell, SOURCE, "encode_create").on_encode();
                    Some(CommitAction::Create)
                } else if let Some(cond) = entry.clear.clone() {
                    Some(CommitAction::Clear(cond))
                } else if !cell_valid(&entry.cell) {
                    Some(CommitAction::Delete)
                } else if entry.write == WriteState::ReadOnly {
                    // Read-only entries are not compared and never written.
                    None
                } else {
                    rw_write(&entry.cell, SOURCE, "encode_compare").on_encode();
                    let dirty = !rw_read(&entry.cell, SOURCE, "compare")
                        .equals(entry.raw.as_ref());
                    dirty.then_some(CommitAction::Update)
                };

                let Some(action) = action else {
                    continue;
                };

                match &action {
                    CommitAction::Create | CommitAction::Update => {
                        // Keep the global tier consistent with the not yet
                        // replicated mutation.
                        if meta.cache {
                            self.core
                                .global
                                .refresh(clone_fresh(&**rw_read(&entry.cell, SOURCE, "refresh")));
                        }
                    }
                    CommitAction::Delete | CommitAction::Clear(_) => {
                        // Held until the commit worker replays the entry, so
                        // remote readers cannot observe the doomed rows.
                        self.core.global.lock(&model_key);
                    }
                }

                debug!(data_key = %data_key, action = ?action, "session entry scheduled");
                ordered.push((
                    entry.seq,
                    CommitEntry {
                        cell: entry.cell,
                        action,
                        alias: meta.alias.clone(),
                        model_key: model_key.clone(),
                        data_key,
                    },
                ));
            }
        }

        ordered.sort_by_key(|(seq, _)| *seq);
        ordered.into_iter().map(|(_, entry)| entry).collect()
    }
}

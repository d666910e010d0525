//! The `read` primitive: exact lookup by primary key, or fuzzy lookup by
//! condition, through session tier, global tier and remote tier in order.

use tracing::{debug, warn};

use crate::cache::lock::rw_read;
use crate::cond::{matcher, Condition};
use crate::model::meta::ModelMeta;
use crate::model::{cell_valid, clone_fresh, Handle, Model, ModelCell};
use crate::session::{OpKind, Options, Session};

const SOURCE: &str = "session::read";

enum Reconciled {
    Deleted,
    Session(ModelCell),
    Mismatch,
}

impl Session {
    /// Exact read by primary key.
    pub async fn read<T: Model + Clone>(&self, probe: T) -> Handle<T> {
        self.read_with(probe, Options::default()).await
    }

    /// Read with an explicit writable intent and/or condition.
    ///
    /// The returned handle is invalid when the row does not exist or is
    /// soft-deleted anywhere between the session tier and the remote tier.
    pub async fn read_with<T: Model + Clone>(&self, mut probe: T, opts: Options<'_>) -> Handle<T> {
        let started = std::time::Instant::now();
        let Some((context, meta)) = self.preamble("read", &probe).await else {
            probe.set_valid(false);
            return Handle::detached(probe);
        };

        let writable = opts.writable.unwrap_or(meta.writable);
        let handle = match opts.cond {
            None => self.read_exact(probe, writable, &meta).await,
            Some(cond) => self.read_fuzzy(probe, writable, cond, &meta).await,
        };

        context.ops.note(OpKind::Read, started.elapsed());
        handle
    }

    async fn read_exact<T: Model + Clone>(
        &self,
        mut probe: T,
        writable: bool,
        meta: &ModelMeta,
    ) -> Handle<T> {
        let model_key = probe.model_key();
        let data_key = probe.data_key();

        // Session tier: this session's own view always wins.
        let session_hit = self
            .core
            .session
            .with_entry(self.gid, &model_key, &data_key, |entry| {
                if !cell_valid(&entry.cell) {
                    None
                } else {
                    entry.set_writable(writable);
                    Some(entry.cell.clone())
                }
            });
        if let Some(found) = session_hit {
            return match found {
                Some(cell) => Handle::new(cell),
                None => {
                    probe.set_valid(false);
                    Handle::detached(probe)
                }
            };
        }

        // Global tier: clone into the session so later mutations stay local.
        if meta.cache {
            if let Some(cell) = self.core.global.get(&model_key, &data_key) {
                let cloned = {
                    let guard = rw_read(&cell, SOURCE, "global_hit");
                    guard.valid().then(|| clone_fresh(&**guard))
                };
                return match cloned {
                    Some(cloned) => {
                        let cell = self.core.session.put_with(self.gid, cloned, |entry| {
                            entry.set_writable(writable);
                            entry.cell.clone()
                        });
                        Handle::new(cell)
                    }
                    None => {
                        // Soft-deleted globally: gone, do not resurrect from
                        // the remote tier while the delete is in flight.
                        probe.set_valid(false);
                        Handle::detached(probe)
                    }
                };
            }
        }

        // Remote tier.
        self.core.global.wait_unlocked("read", &model_key).await;
        let ops = match self.core.sources.require(&meta.alias) {
            Ok(ops) => ops,
            Err(err) => {
                warn!(model = %model_key, error = %err, "read has no backing source");
                probe.set_valid(false);
                return Handle::detached(probe);
            }
        };
        match ops.read(&probe, None).await {
            Ok(Some(mut found)) => {
                found.on_decode();
                found.set_valid(true);
                if meta.cache {
                    self.core.global.put(clone_fresh(found.as_ref()));
                }
                let cell = self
                    .core
                    .session
                    .put_with(self.gid, found, |entry| entry.cell.clone());
                Handle::new(cell)
            }
            Ok(None) => {
                probe.set_valid(false);
                Handle::detached(probe)
            }
            Err(err) => {
                warn!(data_key = %data_key, error = %err, "remote read failed");
                probe.set_valid(false);
                Handle::detached(probe)
            }
        }
    }

    async fn read_fuzzy<T: Model + Clone>(
        &self,
        mut probe: T,
        writable: bool,
        cond: &Condition,
        meta: &ModelMeta,
    ) -> Handle<T> {
        let model_key = probe.model_key();

        // Session tier, only once this session has materialized the full
        // row set: first valid match wins.
        if self.core.session.is_listed(self.gid, &model_key) {
            let mut found = None;
            self.core.session.for_each_entry(self.gid, &model_key, |entry| {
                let hit = {
                    let guard = rw_read(&entry.cell, SOURCE, "scan_session");
                    guard.valid() && matcher::matches(&**guard, Some(cond))
                };
                if hit {
                    entry.set_writable(writable);
                    found = Some(entry.cell.clone());
                    return false;
                }
                true
            });
            return match found {
                Some(cell) => Handle::new(cell),
                None => {
                    probe.set_valid(false);
                    Handle::detached(probe)
                }
            };
        }

        // Global tier, same precondition on its listed flag.
        if meta.cache && self.core.global.is_listed(&model_key) {
            for (_, cell) in self.core.global.entries(&model_key) {
                let cloned = {
                    let guard = rw_read(&cell, SOURCE, "scan_global");
                    (guard.valid() && matcher::matches(&**guard, Some(cond)))
                        .then(|| clone_fresh(&**guard))
                };
                if let Some(cloned) = cloned {
                    let cell = self.core.session.put_with(self.gid, cloned, |entry| {
                        entry.set_writable(writable);
                        entry.cell.clone()
                    });
                    return Handle::new(cell);
                }
            }
            probe.set_valid(false);
            return Handle::detached(probe);
        }

        // Remote tier, then reconcile against both in-memory tiers.
        self.core.global.wait_unlocked("read", &model_key).await;
        let ops = match self.core.sources.require(&meta.alias) {
            Ok(ops) => ops,
            Err(err) => {
                warn!(model = %model_key, error = %err, "read has no backing source");
                probe.set_valid(false);
                return Handle::detached(probe);
            }
        };
        let mut found = match ops.read(&probe, Some(cond)).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                probe.set_valid(false);
                return Handle::detached(probe);
            }
            Err(err) => {
                warn!(model = %model_key, error = %err, "remote read failed");
                probe.set_valid(false);
                return Handle::detached(probe);
            }
        };
        found.on_decode();
        found.set_valid(true);
        let data_key = found.data_key();

        let reconciled = self
            .core
            .session
            .with_entry(self.gid, &model_key, &data_key, |entry| {
                if !cell_valid(&entry.cell) {
                    Reconciled::Deleted
                } else {
                    let matched = {
                        let guard = rw_read(&entry.cell, SOURCE, "reconcile_session");
                        matcher::matches(&**guard, Some(cond))
                    };
                    if matched {
                        entry.set_writable(writable);
                        Reconciled::Session(entry.cell.clone())
                    } else {
                        Reconciled::Mismatch
                    }
                }
            });
        match reconciled {
            Some(Reconciled::Deleted) => {
                debug!(data_key = %data_key, "session marks the remote result deleted");
                probe.set_valid(false);
                return Handle::detached(probe);
            }
            Some(Reconciled::Session(cell)) => {
                debug!(data_key = %data_key, "remote result shadowed by session entry");
                return Handle::new(cell);
            }
            Some(Reconciled::Mismatch) => {
                warn!(
                    data_key = %data_key,
                    "remote result replaces a session entry that no longer matches; \
                     the entry's changes are discarded"
                );
            }
            None => {}
        }

        if meta.cache {
            if let Some(cell) = self.core.global.get(&model_key, &data_key) {
                let cloned = {
                    let guard = rw_read(&cell, SOURCE, "reconcile_global");
                    guard.valid().then(|| clone_fresh(&**guard))
                };
                return match cloned {
                    Some(cloned) => {
                        debug!(data_key = %data_key, "using global object over remote result");
                        let cell = self.core.session.put_with(self.gid, cloned, |entry| {
                            entry.set_writable(writable);
                            entry.cell.clone()
                        });
                        Handle::new(cell)
                    }
                    None => {
                        debug!(data_key = %data_key, "global marks the remote result deleted");
                        probe.set_valid(false);
                        Handle::detached(probe)
                    }
                };
            }
            self.core.global.put(clone_fresh(found.as_ref()));
        }

        let cell = self
            .core
            .session
            .put_with(self.gid, found, |entry| entry.cell.clone());
        Handle::new(cell)
    }
}

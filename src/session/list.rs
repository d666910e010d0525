//! The `list` primitive: materialize every row satisfying a condition,
//! reconciling remote results against both in-memory tiers.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::cache::lock::rw_read;
use crate::model::{cell_valid, clone_fresh, Handle, Model, ModelCell};
use crate::cond::matcher;
use crate::session::{OpKind, Options, Session};

const SOURCE: &str = "session::list";

enum Reconciled {
    Deleted,
    Session(ModelCell),
}

impl Session {
    /// List every row of the model. Sets the listed flags, so subsequent
    /// fuzzy reads and counts stay in memory.
    pub async fn list<T: Model + Clone>(&self, probe: T) -> Vec<Handle<T>> {
        self.list_with(probe, Options::default()).await
    }

    /// List rows with an explicit writable intent and/or condition.
    pub async fn list_with<T: Model + Clone>(
        &self,
        probe: T,
        opts: Options<'_>,
    ) -> Vec<Handle<T>> {
        let started = std::time::Instant::now();
        let Some((context, meta)) = self.preamble("list", &probe).await else {
            return Vec::new();
        };
        let writable = opts.writable.unwrap_or(meta.writable);
        let cond = opts.cond;
        let model_key = probe.model_key();

        let mut handles: Vec<Handle<T>> = Vec::new();

        if self.core.session.is_listed(self.gid, &model_key) {
            // Session tier already holds the full row set.
            self.core.session.for_each_entry(self.gid, &model_key, |entry| {
                let hit = {
                    let guard = rw_read(&entry.cell, SOURCE, "scan_session");
                    guard.valid() && matcher::matches(&**guard, cond)
                };
                if hit {
                    entry.set_writable(writable);
                    handles.push(Handle::new(entry.cell.clone()));
                }
                true
            });
        } else if meta.cache && self.core.global.is_listed(&model_key) {
            // Global tier holds the full set; clone matches into the session.
            for (_, cell) in self.core.global.entries(&model_key) {
                let cloned = {
                    let guard = rw_read(&cell, SOURCE, "scan_global");
                    (guard.valid() && matcher::matches(&**guard, cond))
                        .then(|| clone_fresh(&**guard))
                };
                let Some(cloned) = cloned else {
                    continue;
                };
                let data_key = cloned.data_key();
                let existing =
                    self.core
                        .session
                        .with_entry(self.gid, &model_key, &data_key, |entry| {
                            if !cell_valid(&entry.cell) {
                                None
                            } else {
                                entry.set_writable(writable);
                                Some(entry.cell.clone())
                            }
                        });
                match existing {
                    Some(Some(cell)) => handles.push(Handle::new(cell)),
                    Some(None) => {} // deleted within this session
                    None => {
                        let cell = self.core.session.put_with(self.gid, cloned, |entry| {
                            entry.set_writable(writable);
                            entry.cell.clone()
                        });
                        handles.push(Handle::new(cell));
                    }
                }
            }
        } else {
            // Remote tier.
            self.core.global.wait_unlocked("list", &model_key).await;
            let ops = match self.core.sources.require(&meta.alias) {
                Ok(ops) => ops,
                Err(err) => {
                    warn!(model = %model_key, error = %err, "list has no backing source");
                    context.ops.note(OpKind::List, started.elapsed());
                    return handles;
                }
            };
            let rows = match ops.list(&probe, cond).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(model = %model_key, error = %err, "remote list failed");
                    context.ops.note(OpKind::List, started.elapsed());
                    return handles;
                }
            };

            let mut seen: HashSet<String> = HashSet::new();
            for mut row in rows {
                row.on_decode();
                row.set_valid(true);
                let data_key = row.data_key();

                let reconciled =
                    self.core
                        .session
                        .with_entry(self.gid, &model_key, &data_key, |entry| {
                            if !cell_valid(&entry.cell) {
                                Reconciled::Deleted
                            } else {
                                Reconciled::Session(entry.cell.clone())
                            }
                        });
                match reconciled {
                    Some(Reconciled::Deleted) => {
                        debug!(data_key = %data_key, "row deleted within this session");
                        continue;
                    }
                    Some(Reconciled::Session(cell)) => {
                        debug!(data_key = %data_key, "using session object");
                        seen.insert(data_key);
                        handles.push(Handle::new(cell));
                        continue;
                    }
                    None => {}
                }

                if meta.cache {
                    if let Some(cell) = self.core.global.get(&model_key, &data_key) {
                        let cloned = {
                            let guard = rw_read(&cell, SOURCE, "reconcile_global");
                            guard.valid().then(|| clone_fresh(&**guard))
                        };
                        match cloned {
                            Some(cloned) => {
                                debug!(data_key = %data_key, "using global object");
                                let cell =
                                    self.core.session.put_with(self.gid, cloned, |entry| {
                                        entry.set_writable(writable);
                                        entry.cell.clone()
                                    });
                                seen.insert(data_key);
                                handles.push(Handle::new(cell));
                            }
                            None => {
                                debug!(data_key = %data_key, "row soft-deleted globally");
                            }
                        }
                        continue;
                    }
                    self.core.global.put(clone_fresh(row.as_ref()));
                }

                let cell = self.core.session.put_with(self.gid, row, |entry| {
                    entry.set_writable(writable);
                    entry.cell.clone()
                });
                seen.insert(data_key);
                handles.push(Handle::new(cell));
            }

            // Rows this session or the global tier hold that the remote did
            // not return yet, typically writes still waiting in the pipeline.
            self.core.session.for_each_entry(self.gid, &model_key, |entry| {
                let addition = {
                    let guard = rw_read(&entry.cell, SOURCE, "supplement_session");
                    (guard.valid()
                        && !seen.contains(&guard.data_key())
                        && matcher::matches(&**guard, cond))
                    .then(|| guard.data_key())
                };
                if let Some(data_key) = addition {
                    debug!(data_key = %data_key, "adding session-only row");
                    seen.insert(data_key);
                    handles.push(Handle::new(entry.cell.clone()));
                }
                true
            });
            if meta.cache {
                for (data_key, cell) in self.core.global.entries(&model_key) {
                    if seen.contains(&data_key) {
                        continue;
                    }
                    let cloned = {
                        let guard = rw_read(&cell, SOURCE, "supplement_global");
                        (guard.valid() && matcher::matches(&**guard, cond))
                            .then(|| clone_fresh(&**guard))
                    };
                    if let Some(cloned) = cloned {
                        debug!(data_key = %data_key, "adding global-only row");
                        let cell = self.core.session.put_with(self.gid, cloned, |entry| {
                            entry.set_writable(writable);
                            entry.cell.clone()
                        });
                        seen.insert(data_key);
                        handles.push(Handle::new(cell));
                    }
                }
            }

            if cond.is_none() && meta.cache {
                self.core.global.set_listed(&model_key, true);
            }
        }

        // A full list leaves the session tier holding the complete row set.
        if cond.is_none() {
            self.core.session.set_listed(self.gid, &model_key, true);
        }

        context.ops.note(OpKind::List, started.elapsed());
        handles
    }
}

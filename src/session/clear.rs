//! The `clear` primitive: bulk soft-delete by condition across both
//! in-memory tiers, plus one cleanup record so the commit pipeline replays
//! the range delete remotely.

use std::collections::HashSet;

use tracing::debug;

use crate::cache::lock::{rw_read, rw_write};
use crate::cond::{matcher, Condition};
use crate::model::{clone_fresh, Model};
use crate::session::{OpKind, Session};

const SOURCE: &str = "session::clear";

impl Session {
    /// Soft-delete every row of the model matching `cond`; all rows when
    /// `None`. Drops both listed flags, since the materialized row sets are
    /// no longer complete views.
    pub async fn clear<T: Model + Clone>(&self, mut probe: T, cond: Option<&Condition>) {
        let started = std::time::Instant::now();
        let Some((context, meta)) = self.preamble("clear", &probe).await else {
            return;
        };
        if !self.writable_or_log("clear", &context, &meta) {
            return;
        }

        let model_key = probe.model_key();
        let range = cond.cloned().unwrap_or_default();
        let mut marked: HashSet<String> = HashSet::new();

        // Session tier: invalidate matches in place.
        self.core.session.for_each_entry(self.gid, &model_key, |entry| {
            let hit = {
                let guard = rw_read(&entry.cell, SOURCE, "scan_session");
                matcher::matches(&**guard, cond).then(|| guard.data_key())
            };
            if let Some(data_key) = hit {
                rw_write(&entry.cell, SOURCE, "invalidate_session").set_valid(false);
                entry.delete = true;
                entry.create = false;
                marked.insert(data_key);
            }
            true
        });

        // Global tier: invalidate matches, and track the ones this session
        // never touched so the cleanup covers them too.
        if meta.cache {
            for (data_key, cell) in self.core.global.entries(&model_key) {
                let hit = {
                    let guard = rw_read(&cell, SOURCE, "scan_global");
                    matcher::matches(&**guard, cond)
                };
                if !hit {
                    continue;
                }
                rw_write(&cell, SOURCE, "invalidate_global").set_valid(false);
                if marked.contains(&data_key) {
                    continue;
                }
                let cloned = clone_fresh(&**rw_read(&cell, SOURCE, "clone_global"));
                let range = range.clone();
                self.core.session.put_with(self.gid, cloned, |entry| {
                    rw_write(&entry.cell, SOURCE, "invalidate_clone").set_valid(false);
                    entry.delete = true;
                    entry.create = false;
                    entry.clear = Some(range);
                });
                marked.insert(data_key);
            }
        }

        // Neither tier can claim a complete row set anymore.
        self.core.session.set_listed(self.gid, &model_key, false);
        self.core.global.set_listed(&model_key, false);

        // Cleanup record: guarantees the pipeline replays the range delete
        // even when nothing was cached.
        probe.set_valid(false);
        self.core
            .session
            .put_with(self.gid, Box::new(probe), |entry| {
                rw_write(&entry.cell, SOURCE, "invalidate_probe").set_valid(false);
                entry.create = false;
                entry.clear = Some(range);
            });

        debug!(model = %model_key, marked = marked.len(), "clear marked cached rows");
        context.ops.note(OpKind::Clear, started.elapsed());
    }
}

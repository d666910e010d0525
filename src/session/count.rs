//! The `count` primitive: answered from whichever tier holds a complete
//! view, falling back to the remote store.

use tracing::warn;

use crate::cache::lock::rw_read;
use crate::cond::{matcher, Condition};
use crate::model::Model;
use crate::session::Session;

const SOURCE: &str = "session::count";

impl Session {
    /// Count rows matching `cond` (all rows when `None`), excluding
    /// soft-deleted entries.
    pub async fn count<T: Model + Clone>(&self, probe: T, cond: Option<&Condition>) -> i64 {
        let Some((_context, meta)) = self.preamble("count", &probe).await else {
            return 0;
        };
        let model_key = probe.model_key();

        if self.core.session.is_listed(self.gid, &model_key) {
            let mut total = 0;
            self.core.session.for_each_entry(self.gid, &model_key, |entry| {
                let guard = rw_read(&entry.cell, SOURCE, "scan_session");
                if guard.valid() && matcher::matches(&**guard, cond) {
                    total += 1;
                }
                true
            });
            return total;
        }

        if meta.cache && self.core.global.is_listed(&model_key) {
            let mut total = 0;
            for (_, cell) in self.core.global.entries(&model_key) {
                let guard = rw_read(&cell, SOURCE, "scan_global");
                if guard.valid() && matcher::matches(&**guard, cond) {
                    total += 1;
                }
            }
            return total;
        }

        match self.core.sources.require(&meta.alias) {
            Ok(ops) => match ops.count(&probe, cond).await {
                Ok(total) => total,
                Err(err) => {
                    warn!(model = %model_key, error = %err, "remote count failed");
                    -1
                }
            },
            Err(err) => {
                warn!(model = %model_key, error = %err, "count has no backing source");
                -1
            }
        }
    }
}

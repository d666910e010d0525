//! The `write` primitive: record a create/update in both in-memory tiers.
//! Nothing reaches the remote store until `defer` ships the batch.

use crate::model::{clone_fresh, Model};
use crate::session::{OpKind, Session};

impl Session {
    /// Mark an instance written. The instance becomes this session's live
    /// working copy; the remote insert happens asynchronously after
    /// `defer`.
    pub async fn write<T: Model + Clone>(&self, mut model: T) {
        let started = std::time::Instant::now();
        let Some((context, meta)) = self.preamble("write", &model).await else {
            return;
        };
        if !self.writable_or_log("write", &context, &meta) {
            return;
        }

        model.set_valid(true);

        if meta.cache {
            // Write-through clone with the delete marker cleared.
            self.core.global.put(clone_fresh(&model));
        }

        self.core
            .session
            .put_with(self.gid, Box::new(model), |entry| {
                entry.create = true;
                entry.delete = false;
                entry.clear = None;
            });

        context.ops.note(OpKind::Write, started.elapsed());
    }
}

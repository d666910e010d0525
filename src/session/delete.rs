//! The `delete` primitive: soft-delete across both in-memory tiers. The
//! remote delete replays asynchronously; until then the row reads as gone.

use crate::cache::lock::rw_write;
use crate::model::Model;
use crate::session::{OpKind, Session};

const SOURCE: &str = "session::delete";

impl Session {
    /// Soft-delete one row by primary key.
    pub async fn delete<T: Model + Clone>(&self, mut model: T) {
        let started = std::time::Instant::now();
        let Some((context, meta)) = self.preamble("delete", &model).await else {
            return;
        };
        if !self.writable_or_log("delete", &context, &meta) {
            return;
        }

        model.set_valid(false);
        let model_key = model.model_key();
        let data_key = model.data_key();

        if meta.cache {
            if let Some(cell) = self.core.global.get(&model_key, &data_key) {
                rw_write(&cell, SOURCE, "invalidate_global").set_valid(false);
            }
        }

        let existing = self
            .core
            .session
            .with_entry(self.gid, &model_key, &data_key, |entry| {
                rw_write(&entry.cell, SOURCE, "invalidate_session").set_valid(false);
                entry.delete = true;
                entry.create = false;
                entry.clear = None;
            });
        if existing.is_none() {
            self.core
                .session
                .put_with(self.gid, Box::new(model), |entry| {
                    entry.delete = true;
                    entry.create = false;
                    entry.clear = None;
                });
        }

        context.ops.note(OpKind::Delete, started.elapsed());
    }
}

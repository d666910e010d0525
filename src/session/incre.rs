//! The `incre` primitive: process-wide monotonic counters per
//! `(model, column)`, seeded from the remote `MAX(column)` on first use.

use std::sync::atomic::Ordering;

use tracing::error;

use crate::model::Model;
use crate::session::{OpKind, Session};

impl Session {
    /// Fetch-and-add 1 on the model's primary-key counter.
    pub async fn incre<T: Model + Clone>(&self, probe: T) -> i64 {
        self.incre_by(probe, None, 1).await
    }

    /// Fetch-and-add `delta` on the counter of `column` (primary key when
    /// `None`). Returns the new value, strictly increasing across
    /// concurrent sessions; -1 when the counter cannot be resolved.
    pub async fn incre_by<T: Model + Clone>(
        &self,
        probe: T,
        column: Option<&str>,
        delta: i64,
    ) -> i64 {
        let started = std::time::Instant::now();
        let Some((context, meta)) = self.preamble("incre", &probe).await else {
            return -1;
        };
        if !self.writable_or_log("incre", &context, &meta) {
            return -1;
        }

        let column = column.unwrap_or(meta.primary_key);
        if column.is_empty() {
            error!(model = %meta.model_key, "incre column is empty");
            return 0;
        }
        let key = format!("{}|{}", meta.model_key, column);

        let value = if let Some(counter) = self.core.global.counter(&key) {
            counter.fetch_add(delta, Ordering::AcqRel) + delta
        } else {
            // First use: serialize against other initializers, re-check,
            // then seed from the remote maximum.
            let _init = self.core.global.counter_init_lock().lock().await;
            if let Some(counter) = self.core.global.counter(&key) {
                counter.fetch_add(delta, Ordering::AcqRel) + delta
            } else {
                match self.core.sources.require(&meta.alias) {
                    Ok(ops) => match ops.max(&probe, column).await {
                        Ok(max) => {
                            let initial = max + delta;
                            self.core.global.install_counter(&key, initial);
                            initial
                        }
                        Err(err) => {
                            error!(counter = %key, error = %err, "counter seed failed");
                            -1
                        }
                    },
                    Err(err) => {
                        error!(counter = %key, error = %err, "incre has no backing source");
                        -1
                    }
                }
            }
        };

        context.ops.note(OpKind::Incre, started.elapsed());
        value
    }
}

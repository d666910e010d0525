//! In-process [`ModelOps`] backend.
//!
//! Serves two roles: the test double for everything above the remote tier,
//! and a real backend for cache-only deployments that want the full session
//! machinery without a database. Rows are deep copies; nothing handed out
//! aliases the stored instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cache::lock::mutex_lock;
use crate::cond::{matcher, Condition};
use crate::error::{ConfigError, RemoteError};
use crate::model::{clone_fresh, Model};
use crate::source::{ModelOps, SourceDriver};

const SOURCE: &str = "source::memory";

type Rows = BTreeMap<String, Box<dyn Model>>;

/// Row store keyed by `model_key`, then `data_key`.
#[derive(Default)]
pub struct MemorySource {
    tables: Mutex<HashMap<String, Rows>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate one row, bypassing the session machinery. Test seam.
    pub fn seed(&self, model: &dyn Model) {
        let mut tables = mutex_lock(&self.tables, SOURCE, "seed");
        tables
            .entry(model.model_key())
            .or_default()
            .insert(model.data_key(), clone_fresh(model));
    }

    /// Number of stored rows for one model. Test seam.
    pub fn stored(&self, probe: &dyn Model) -> usize {
        mutex_lock(&self.tables, SOURCE, "stored")
            .get(&probe.model_key())
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    fn filtered(&self, probe: &dyn Model, cond: Option<&Condition>) -> Vec<Box<dyn Model>> {
        let tables = mutex_lock(&self.tables, SOURCE, "filtered");
        let Some(rows) = tables.get(&probe.model_key()) else {
            return Vec::new();
        };
        rows.values()
            .filter(|row| matcher::matches(row.as_ref(), cond))
            .map(|row| clone_fresh(row.as_ref()))
            .collect()
    }

    fn column_values(&self, probe: &dyn Model, column: &str) -> Result<Vec<i64>, RemoteError> {
        if !probe.columns().contains(&column) {
            return Err(RemoteError::UnknownColumn {
                model: probe.model_key(),
                column: column.to_string(),
            });
        }
        let tables = mutex_lock(&self.tables, SOURCE, "column_values");
        Ok(tables
            .get(&probe.model_key())
            .map(|rows| {
                rows.values()
                    .filter_map(|row| row.field(column).as_int())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ModelOps for MemorySource {
    async fn read(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<Option<Box<dyn Model>>, RemoteError> {
        match cond {
            None => {
                let tables = mutex_lock(&self.tables, SOURCE, "read");
                Ok(tables
                    .get(&probe.model_key())
                    .and_then(|rows| rows.get(&probe.data_key()))
                    .map(|row| clone_fresh(row.as_ref())))
            }
            Some(_) => Ok(self.filtered(probe, cond).into_iter().next()),
        }
    }

    async fn list(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<Vec<Box<dyn Model>>, RemoteError> {
        let mut rows = self.filtered(probe, cond);
        if let Some(cond) = cond {
            if cond.offset() > 0 {
                rows.drain(..cond.offset().min(rows.len()));
            }
            if cond.limit() > 0 {
                rows.truncate(cond.limit());
            }
        }
        Ok(rows)
    }

    async fn write(&self, model: &dyn Model) -> Result<u64, RemoteError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "write");
        tables
            .entry(model.model_key())
            .or_default()
            .insert(model.data_key(), clone_fresh(model));
        Ok(1)
    }

    async fn delete(&self, model: &dyn Model) -> Result<u64, RemoteError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "delete");
        let removed = tables
            .get_mut(&model.model_key())
            .and_then(|rows| rows.remove(&model.data_key()));
        Ok(u64::from(removed.is_some()))
    }

    async fn clear(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<u64, RemoteError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "clear");
        let Some(rows) = tables.get_mut(&probe.model_key()) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, row| !matcher::matches(row.as_ref(), cond));
        Ok((before - rows.len()) as u64)
    }

    async fn count(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<i64, RemoteError> {
        let tables = mutex_lock(&self.tables, SOURCE, "count");
        Ok(tables
            .get(&probe.model_key())
            .map(|rows| {
                rows.values()
                    .filter(|row| matcher::matches(row.as_ref(), cond))
                    .count() as i64
            })
            .unwrap_or(0))
    }

    async fn max(&self, probe: &dyn Model, column: &str) -> Result<i64, RemoteError> {
        Ok(self
            .column_values(probe, column)?
            .into_iter()
            .max()
            .unwrap_or(0))
    }

    async fn min(&self, probe: &dyn Model, column: &str) -> Result<i64, RemoteError> {
        Ok(self
            .column_values(probe, column)?
            .into_iter()
            .min()
            .unwrap_or(0))
    }
}

/// Driver behind the `memory` source kind. The address is ignored; every
/// opened alias gets its own empty store.
pub struct MemoryDriver;

#[async_trait]
impl SourceDriver for MemoryDriver {
    async fn open(
        &self,
        _alias: &str,
        _addr: &str,
        _pool: u32,
        _conn: u32,
    ) -> Result<Arc<dyn ModelOps>, ConfigError> {
        Ok(Arc::new(MemorySource::new()))
    }
}

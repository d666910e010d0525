//! The remote tier, as the cache sees it.
//!
//! The engine never talks SQL. Every model type resolves, through its
//! alias, to a [`ModelOps`] backend that answers reads, lists, aggregates
//! and replays mutations. Backends register directly
//! ([`SourceRegistry::register`]) or are opened by a named [`SourceDriver`]
//! from configuration. The crate ships one driver, `memory`, backed by
//! [`memory::MemorySource`].

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::cache::lock::{rw_read, rw_write};
use crate::cond::Condition;
use crate::error::{ConfigError, RemoteError};
use crate::model::Model;

const SOURCE: &str = "source";

/// Persistence operations one backend provides for all model types.
///
/// Instances cross the boundary type-erased; the probe argument carries the
/// model/data coordinates the backend needs to address rows.
#[async_trait]
pub trait ModelOps: Send + Sync {
    /// Fetch one row: by primary key when `cond` is `None`, else the first
    /// row satisfying `cond`.
    async fn read(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<Option<Box<dyn Model>>, RemoteError>;

    /// Fetch every row satisfying `cond` (all rows when `None`), honoring
    /// the condition's limit/offset.
    async fn list(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<Vec<Box<dyn Model>>, RemoteError>;

    /// Insert-or-update one row.
    async fn write(&self, model: &dyn Model) -> Result<u64, RemoteError>;

    /// Delete one row by primary key.
    async fn delete(&self, model: &dyn Model) -> Result<u64, RemoteError>;

    /// Delete every row satisfying `cond`; all rows when `None`.
    async fn clear(&self, probe: &dyn Model, cond: Option<&Condition>)
        -> Result<u64, RemoteError>;

    async fn count(&self, probe: &dyn Model, cond: Option<&Condition>)
        -> Result<i64, RemoteError>;

    /// Largest value of an integer column; 0 for an empty table.
    async fn max(&self, probe: &dyn Model, column: &str) -> Result<i64, RemoteError>;

    /// Smallest value of an integer column; 0 for an empty table.
    async fn min(&self, probe: &dyn Model, column: &str) -> Result<i64, RemoteError>;
}

/// Opens a [`ModelOps`] backend from a configured source entry.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    async fn open(
        &self,
        alias: &str,
        addr: &str,
        pool: u32,
        conn: u32,
    ) -> Result<Arc<dyn ModelOps>, ConfigError>;
}

/// `alias -> backend` map, plus the named drivers that can populate it.
pub struct SourceRegistry {
    backends: RwLock<HashMap<String, Arc<dyn ModelOps>>>,
    drivers: RwLock<HashMap<String, Arc<dyn SourceDriver>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        let registry = Self {
            backends: RwLock::new(HashMap::new()),
            drivers: RwLock::new(HashMap::new()),
        };
        registry.register_driver("memory", Arc::new(memory::MemoryDriver));
        registry
    }

    /// Attach a backend under an alias, replacing any previous one.
    pub fn register(&self, alias: &str, backend: Arc<dyn ModelOps>) {
        rw_write(&self.backends, SOURCE, "register").insert(alias.to_string(), backend);
    }

    pub fn get(&self, alias: &str) -> Option<Arc<dyn ModelOps>> {
        rw_read(&self.backends, SOURCE, "get").get(alias).cloned()
    }

    /// Backend for an alias, as a typed error when absent.
    pub fn require(&self, alias: &str) -> Result<Arc<dyn ModelOps>, RemoteError> {
        self.get(alias).ok_or_else(|| RemoteError::UnknownSource {
            alias: alias.to_string(),
        })
    }

    pub fn register_driver(&self, name: &str, driver: Arc<dyn SourceDriver>) {
        rw_write(&self.drivers, SOURCE, "register_driver").insert(name.to_string(), driver);
    }

    pub fn driver(&self, name: &str) -> Option<Arc<dyn SourceDriver>> {
        rw_read(&self.drivers, SOURCE, "driver").get(name).cloned()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

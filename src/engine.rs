//! The `Engine`: one value owning every piece of process-wide state, the
//! meta registry, both cache tiers, the source registry, the dump barrier
//! and the commit pipeline. Construct it once at startup and share it.

use std::sync::Arc;

use tracing::{error, info};

use crate::cache::{DumpGate, GlobalStore, SessionStore};
use crate::commit::{CommitPipeline, CommitStats, FlushTarget};
use crate::config::OrmConfig;
use crate::error::{ConfigError, OrmError};
use crate::model::meta::MetaRegistry;
use crate::model::Model;
use crate::session::{logical_id, ContextRegistry, Session};
use crate::source::{ModelOps, SourceDriver, SourceRegistry};

/// Shared state behind every session and commit worker.
pub(crate) struct Core {
    pub(crate) metas: MetaRegistry,
    pub(crate) global: Arc<GlobalStore>,
    pub(crate) session: SessionStore,
    pub(crate) contexts: ContextRegistry,
    pub(crate) sources: Arc<SourceRegistry>,
    pub(crate) gate: DumpGate,
}

/// The data-access layer. See the crate docs for the full lifecycle.
///
/// Must be constructed inside a tokio runtime; the commit workers are
/// spawned immediately.
pub struct Engine {
    core: Arc<Core>,
    pipeline: Arc<CommitPipeline>,
    dump_serial: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Engine with default sizing and no configured sources.
    pub fn new() -> Self {
        Self::start(&OrmConfig::default())
    }

    /// Engine from configuration: commit sizing plus every configured
    /// source opened through its driver. Only built-in drivers are known at
    /// this point; register third-party drivers with
    /// [`Engine::register_driver`] and call [`Engine::open_sources`] for
    /// configs that need them.
    pub async fn with_config(mut config: OrmConfig) -> Result<Self, ConfigError> {
        config.resolve_addrs()?;
        let engine = Self::start(&config);
        engine.open_sources(&config).await?;
        Ok(engine)
    }

    fn start(config: &OrmConfig) -> Self {
        let global = Arc::new(GlobalStore::new());
        let sources = Arc::new(SourceRegistry::new());
        let pipeline = CommitPipeline::start(
            config.commit.queue_count(),
            config.commit.queue_capacity(),
            Arc::clone(&global),
            Arc::clone(&sources),
        );
        Self {
            core: Arc::new(Core {
                metas: MetaRegistry::new(),
                global,
                session: SessionStore::new(),
                contexts: ContextRegistry::new(),
                sources,
                gate: DumpGate::new(),
            }),
            pipeline: Arc::new(pipeline),
            dump_serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Open every source named in `config` through its registered driver.
    pub async fn open_sources(&self, config: &OrmConfig) -> Result<(), ConfigError> {
        for (driver_name, aliases) in &config.source {
            let driver = self.core.sources.driver(driver_name).ok_or_else(|| {
                ConfigError::UnknownDriver {
                    driver: driver_name.clone(),
                    alias: aliases.keys().next().cloned().unwrap_or_default(),
                }
            })?;
            for (alias, entry) in aliases {
                let backend = driver
                    .open(alias, &entry.addr, entry.pool, entry.conn)
                    .await?;
                self.core.sources.register(alias, backend);
                info!(driver = %driver_name, alias = %alias, "source opened");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a model type.
    ///
    /// `cache` opts the type into the global tier; `writable` allows
    /// session mutations. Must run before any primitive references the
    /// type.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration or a probe without identity, both
    /// setup bugs. Use [`Engine::try_meta`] to handle them as errors.
    pub fn meta(&self, probe: &dyn Model, cache: bool, writable: bool) {
        if let Err(err) = self.try_meta(probe, cache, writable) {
            panic!("{err}");
        }
    }

    /// Fallible form of [`Engine::meta`].
    pub fn try_meta(
        &self,
        probe: &dyn Model,
        cache: bool,
        writable: bool,
    ) -> Result<(), OrmError> {
        let meta = self.core.metas.register(probe, cache, writable)?;
        info!(model = %meta.model_key, cache, writable, "model registered");
        Ok(())
    }

    /// Attach a remote backend under a source alias.
    pub fn register_source(&self, alias: &str, backend: Arc<dyn ModelOps>) {
        self.core.sources.register(alias, backend);
    }

    /// Make a named driver available to [`Engine::open_sources`].
    pub fn register_driver(&self, name: &str, driver: Arc<dyn SourceDriver>) {
        self.core.sources.register_driver(name, driver);
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Start a session bound to the current logical thread.
    ///
    /// The returned session id increases monotonically across the process.
    /// Pair every `watch` with a [`Session::defer`].
    pub async fn watch(&self, writable: bool) -> Session {
        self.core.gate.wait().await;

        let gid = logical_id();
        let context = self.core.contexts.open(gid, writable);
        info!(gid, sid = context.sid, writable, "session started");
        Session {
            core: Arc::clone(&self.core),
            pipeline: Arc::clone(&self.pipeline),
            gid,
            sid: context.sid,
        }
    }

    /// Whether a session context is currently open for `gid`.
    pub fn has_context(&self, gid: u64) -> bool {
        self.core.contexts.contains(gid)
    }

    // ------------------------------------------------------------------
    // Pipeline controls
    // ------------------------------------------------------------------

    /// Wait for the targeted commit shard(s) to drain.
    pub async fn flush(&self, target: FlushTarget) {
        self.pipeline.flush(target).await;
    }

    /// Shut the commit pipeline down: signal every worker, wait for the
    /// drain, zero the pending gauges. Idempotent.
    pub async fn close(&self) {
        self.pipeline.close().await;
    }

    /// Live pipeline counters; also exported through the `metrics` facade.
    pub fn commit_stats(&self) -> &CommitStats {
        self.pipeline.stats()
    }

    /// Close the pipeline when the process receives an interrupt, so queued
    /// batches drain instead of being lost. Call once at startup.
    pub fn close_on_interrupt(&self) {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, draining commit pipeline");
                pipeline.close().await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Remote `MAX(column)`; the primary key when `column` is `None`.
    /// Returns -1 when the source is missing or fails.
    pub async fn max(&self, probe: &dyn Model, column: Option<&str>) -> i64 {
        self.aggregate(probe, column, true).await
    }

    /// Remote `MIN(column)`; the primary key when `column` is `None`.
    /// Returns -1 when the source is missing or fails.
    pub async fn min(&self, probe: &dyn Model, column: Option<&str>) -> i64 {
        self.aggregate(probe, column, false).await
    }

    async fn aggregate(&self, probe: &dyn Model, column: Option<&str>, max: bool) -> i64 {
        let column = column.unwrap_or_else(|| probe.primary_key());
        let ops = match self.core.sources.require(probe.alias()) {
            Ok(ops) => ops,
            Err(err) => {
                error!(model = %probe.model_key(), error = %err, "aggregate has no backing source");
                return -1;
            }
        };
        let result = if max {
            ops.max(probe, column).await
        } else {
            ops.min(probe, column).await
        };
        match result {
            Ok(value) => value,
            Err(err) => {
                error!(model = %probe.model_key(), column, error = %err, "remote aggregate failed");
                -1
            }
        }
    }

    // ------------------------------------------------------------------
    // Dump & diagnostics
    // ------------------------------------------------------------------

    /// Wipe the global tier: everything, or just the given models.
    ///
    /// Dumps serialize among themselves, and sessions park on the dump
    /// barrier until the wipe finishes. Outstanding per-model lock waiters
    /// are released.
    pub async fn dump(&self, models: &[&dyn Model]) {
        let _serial = self.dump_serial.lock().await;
        self.core.gate.begin();

        if models.is_empty() {
            self.core.global.dump_all();
            info!("all models' cache dumped");
        } else {
            for model in models {
                let model_key = model.model_key();
                self.core.global.dump_model(&model_key);
                info!(model = %model_key, "model cache dumped");
            }
        }

        self.core.gate.finish();
    }

    /// Text snapshot of the global tier, one section per map.
    pub async fn print(&self) -> String {
        self.core.gate.wait().await;

        let mut out = String::new();
        out.push_str("[Data]\n");
        for (data_key, json) in self.core.global.data_snapshot() {
            out.push_str(&format!("\t{data_key} = {json}\n"));
        }
        out.push_str("[List]\n");
        for (model_key, listed) in self.core.global.listed_snapshot() {
            out.push_str(&format!("\t{model_key} = {listed}\n"));
        }
        out.push_str("[Incre]\n");
        for (key, value) in self.core.global.counter_snapshot() {
            out.push_str(&format!("\t{key} = {value}\n"));
        }
        out.push_str("[Lock]\n");
        for model_key in self.core.global.lock_snapshot() {
            out.push_str(&format!("\t{model_key}\n"));
        }
        out
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

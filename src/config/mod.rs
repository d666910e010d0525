//! Configuration layer: typed settings with layered precedence (defaults →
//! file → environment).
//!
//! ```toml
//! [commit]
//! queues = 4        # commit shards; defaults to host parallelism
//! capacity = 100000 # per-shard channel capacity
//!
//! [source.memory.main]
//! addr = ""
//!
//! [source.mysql.game]
//! addr = "${MYSQL_GAME_DSN}"  # ${VAR} resolved against the environment
//! pool = 4                    # idle connection cap
//! conn = 16                   # max open connections
//! ```
//!
//! Environment variables prefixed `STRATO__` override file values, e.g.
//! `STRATO__COMMIT__QUEUES=8`.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "STRATO";
const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Root configuration value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrmConfig {
    #[serde(default)]
    pub commit: CommitConfig,
    /// `driver -> alias -> source`, mirroring the key shape
    /// `Orm/Source/<driver>/<alias>`.
    #[serde(default)]
    pub source: HashMap<String, HashMap<String, SourceConfig>>,
}

/// Commit pipeline sizing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitConfig {
    /// Number of commit shards. Zero or absent means host parallelism.
    #[serde(default)]
    pub queues: usize,
    /// Per-shard channel capacity. Zero or absent means 100000.
    #[serde(default)]
    pub capacity: usize,
}

impl CommitConfig {
    pub fn queue_count(&self) -> usize {
        if self.queues > 0 {
            self.queues
        } else {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        }
    }

    pub fn queue_capacity(&self) -> usize {
        if self.capacity > 0 {
            self.capacity
        } else {
            DEFAULT_QUEUE_CAPACITY
        }
    }
}

/// One configured persistence source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// DSN; may reference environment variables as `${VAR}`.
    #[serde(default)]
    pub addr: String,
    /// Idle connection cap.
    #[serde(default)]
    pub pool: u32,
    /// Max open connections.
    #[serde(default)]
    pub conn: u32,
}

impl OrmConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().display().to_string();
        let config = Config::builder()
            .add_source(File::with_name(&path))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse from TOML text, then apply environment overrides.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Resolve every `${VAR}` reference in source addresses. Fails on the
    /// first reference to an unset variable.
    pub fn resolve_addrs(&mut self) -> Result<(), ConfigError> {
        for (driver, aliases) in &mut self.source {
            for (alias, entry) in aliases {
                let key = format!("source.{driver}.{alias}.addr");
                entry.addr = interpolate(&entry.addr, &key)?;
            }
        }
        Ok(())
    }
}

/// Expand `${VAR}` references against the process environment.
fn interpolate(value: &str, key: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            // No closing brace: keep the text verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &tail[..end];
        match std::env::var(name) {
            Ok(resolved) => out.push_str(&resolved),
            Err(_) => {
                return Err(ConfigError::MissingVar {
                    name: name.to_string(),
                    key: key.to_string(),
                })
            }
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

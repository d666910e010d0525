//! Error kinds raised by the cache layer.
//!
//! Most CRUD primitives deliberately do not surface these to the caller:
//! they log and degrade to a no-op, matching the engine's "keep serving"
//! policy. The enums exist so that the fallible seams (registration,
//! configuration, remote sources) stay typed.

use thiserror::Error;

/// Failure reported by a remote persistence source.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("source error: {0}")]
    Source(String),
    #[error("source `{alias}` is not registered")]
    UnknownSource { alias: String },
    #[error("column `{column}` does not exist on `{model}`")]
    UnknownColumn { model: String, column: String },
}

impl RemoteError {
    pub fn source(err: impl std::fmt::Display) -> Self {
        Self::Source(err.to_string())
    }
}

/// Error kinds of the session and cache layer.
#[derive(Debug, Error)]
pub enum OrmError {
    /// CRUD was called for a type that never went through `Engine::meta`.
    #[error("model `{model}` is not registered")]
    NotRegistered { model: String },
    /// CRUD was called outside a `watch`/`defer` pair.
    #[error("no session context for gid {gid}")]
    NoContext { gid: u64 },
    /// A mutating primitive ran in a read-only session or on read-only meta.
    #[error("`{model}` is not writable in this context")]
    NotWritable { model: String },
    /// Duplicate registration of the same model key.
    #[error("model `{model}` is already registered")]
    AlreadyRegistered { model: String },
    /// Malformed input that indicates a setup bug.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("environment variable `{name}` referenced by `{key}` is not set")]
    MissingVar { name: String, key: String },
    #[error("unknown source driver `{driver}` for alias `{alias}`")]
    UnknownDriver { driver: String, alias: String },
    #[error("driver `{driver}` failed to open `{alias}`: {message}")]
    Driver {
        driver: String,
        alias: String,
        message: String,
    },
}

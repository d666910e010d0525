//! strato: a session-scoped, two-tier, write-behind cache over a
//! relational persistence engine.
//!
//! Application code opens a session, reads and writes plain model values,
//! and ends the session; everything else is the engine's problem:
//!
//! - **Two cache tiers.** A process-wide global map shared by all sessions
//!   and a per-session map scoped to one logical thread. Repeated reads of
//!   the same row are served from memory; a session always sees its own
//!   writes.
//! - **Dirty detection.** Ending a session diffs every touched row against
//!   the snapshot taken when it entered the session; creates, updates,
//!   deletes and bulk clears become one commit batch.
//! - **Sharded asynchronous commits.** Batches route to `gid %
//!   queue_count` worker queues and replay against the remote store in the
//!   background. Per-model locks keep readers from observing rows a
//!   pending commit is about to delete.
//!
//! ```ignore
//! let engine = Engine::with_config(OrmConfig::from_path("strato.toml")?).await?;
//! engine.meta(&User::default(), true, true);
//!
//! let session = engine.watch(true).await;
//! session.write(User { id: 1, name: "ada".into(), ..Default::default() }).await;
//! let user = session.read(User::probe(1)).await;
//! session.defer().await;
//!
//! engine.flush(FlushTarget::All).await;
//! engine.close().await;
//! ```
//!
//! The remote store is abstracted behind [`ModelOps`]; the crate ships an
//! in-memory implementation and real engines plug in through
//! [`SourceDriver`]s.

pub mod cache;
pub mod commit;
pub mod cond;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod session;
pub mod source;

pub use commit::FlushTarget;
pub use cond::{cond, CondArg, Condition, Op};
pub use config::OrmConfig;
pub use engine::Engine;
pub use error::{ConfigError, OrmError, RemoteError};
pub use model::{FieldValue, Handle, Model};
pub use session::{Options, Session};
pub use source::{memory::MemorySource, ModelOps, SourceDriver};

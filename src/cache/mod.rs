//! The two cache tiers and their synchronization primitives.
//!
//! - **Global tier** ([`global::GlobalStore`]): process-wide, shared by all
//!   sessions; also owns the listed flags, increment counters and per-model
//!   commit locks.
//! - **Session tier** ([`session::SessionStore`]): scoped to one logical
//!   thread of control, discarded at `defer`.

pub mod gate;
pub mod global;
pub(crate) mod lock;
pub mod session;

pub use gate::DumpGate;
pub use global::{GlobalStore, ModelMap};
pub use session::{SessionEntry, SessionStore, WriteState};

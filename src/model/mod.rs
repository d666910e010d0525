//! The polymorphic data record and its shared in-memory form.
//!
//! A concrete record type implements [`Model`] once and then participates in
//! every tier of the cache. Instances move through the engine type-erased as
//! `Box<dyn Model>` inside shared cells; the session hands typed [`Handle`]s
//! back to application code. A handle aliases the session-tier cell, so
//! mutations made through [`Handle::update`] are what dirty detection sees
//! when the session ends.
//!
//! ```ignore
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     id: i64,
//!     name: String,
//!     #[serde(skip)]
//!     valid: bool,
//! }
//!
//! impl Model for User {
//!     fn alias(&self) -> &'static str { "game" }
//!     fn table(&self) -> &'static str { "user" }
//!     fn columns(&self) -> &'static [&'static str] { &["id", "name"] }
//!     fn primary_key(&self) -> &'static str { "id" }
//!     fn field(&self, column: &str) -> FieldValue {
//!         match column {
//!             "id" => self.id.into(),
//!             "name" => self.name.clone().into(),
//!             _ => FieldValue::Null,
//!         }
//!     }
//!     // valid/set_valid/clone_model/json/as_any boilerplate elided
//! }
//! ```

pub mod meta;

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "model";

/// A single persisted column value, normalized for in-memory comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Integer view; integers only, no lossy float truncation.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; widens integers so mixed-width comparisons work.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Null-ness as the matcher defines it: `Null`, or the empty string.
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Str(v) => v.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! field_value_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                Self::Int(v as i64)
            }
        })*
    };
}

field_value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// The capability set every cached record exposes.
///
/// `model_key` and `data_key` are the cache coordinates: one per type, one
/// per row. `valid` is the soft-deletion marker: an invalid instance is
/// treated as deleted by every read path. `on_encode`/`on_decode` bracket
/// remote writes and reads for types that need field pre/post-processing.
pub trait Model: Send + Sync + 'static {
    /// Database alias this type lives under.
    fn alias(&self) -> &'static str;

    /// Table name.
    fn table(&self) -> &'static str;

    /// Persisted column names, in declaration order.
    fn columns(&self) -> &'static [&'static str];

    /// Primary-key column name.
    fn primary_key(&self) -> &'static str;

    /// Value of one persisted column. Unknown columns yield `Null`.
    fn field(&self, column: &str) -> FieldValue;

    fn valid(&self) -> bool;

    fn set_valid(&mut self, valid: bool);

    /// Deep copy. The engine post-processes clones through [`clone_fresh`].
    fn clone_model(&self) -> Box<dyn Model>;

    /// JSON rendering for diagnostics (`Engine::print`).
    fn json(&self) -> String;

    /// Called before an instance is compared or written to the remote tier.
    fn on_encode(&mut self) {}

    /// Called after an instance arrives from the remote tier or a clone.
    fn on_decode(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Stable per-type key, `"<alias>_<table>"`.
    fn model_key(&self) -> String {
        format!("{}_{}", self.alias(), self.table())
    }

    /// Stable per-row key, `"<model_key>_<primary key value>"`.
    fn data_key(&self) -> String {
        format!("{}_{}", self.model_key(), self.field(self.primary_key()))
    }

    /// Column-wise equality over all persisted fields.
    fn equals(&self, other: &dyn Model) -> bool {
        self.columns()
            .iter()
            .all(|column| self.field(column) == other.field(column))
    }
}

/// Clone an instance the way the cache tiers expect: decoded and valid.
pub fn clone_fresh(model: &dyn Model) -> Box<dyn Model> {
    let mut cloned = model.clone_model();
    cloned.on_decode();
    cloned.set_valid(true);
    cloned
}

/// Shared, interiorly mutable slot holding one type-erased instance.
pub type ModelCell = Arc<RwLock<Box<dyn Model>>>;

pub(crate) fn new_cell(model: Box<dyn Model>) -> ModelCell {
    Arc::new(RwLock::new(model))
}

pub(crate) fn cell_valid(cell: &ModelCell) -> bool {
    rw_read(cell, SOURCE, "cell_valid").valid()
}

pub(crate) fn cell_clone(cell: &ModelCell) -> Box<dyn Model> {
    rw_read(cell, SOURCE, "cell_clone").clone_model()
}

/// Typed view over a session-tier cell.
///
/// Cloning the handle clones the alias, not the record. `get` snapshots the
/// current value; `update` mutates it in place, which is how a session makes
/// changes that `defer` will pick up as updates.
pub struct Handle<T> {
    cell: ModelCell,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<T: Model + Clone> Handle<T> {
    pub(crate) fn new(cell: ModelCell) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// Wrap an instance that is not tracked by any session, typically a
    /// probe coming back from a missed read.
    pub(crate) fn detached(model: T) -> Self {
        Self::new(new_cell(Box::new(model)))
    }

    /// Snapshot of the current value.
    ///
    /// # Panics
    ///
    /// Panics if the cell holds a different concrete type, which cannot
    /// happen through the public session API.
    pub fn get(&self) -> T {
        rw_read(&self.cell, SOURCE, "handle_get")
            .as_any()
            .downcast_ref::<T>()
            .cloned()
            .expect("handle cell holds a foreign model type")
    }

    /// Mutate the tracked instance in place.
    pub fn update(&self, apply: impl FnOnce(&mut T)) {
        let mut guard = rw_write(&self.cell, SOURCE, "handle_update");
        if let Some(model) = guard.as_any_mut().downcast_mut::<T>() {
            apply(model);
        }
    }

    /// Soft-deletion state of the tracked instance.
    pub fn valid(&self) -> bool {
        rw_read(&self.cell, SOURCE, "handle_valid").valid()
    }

    pub fn data_key(&self) -> String {
        rw_read(&self.cell, SOURCE, "handle_data_key").data_key()
    }
}

impl<T: Model + Clone> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("data_key", &self.data_key())
            .field("valid", &self.valid())
            .finish()
    }
}

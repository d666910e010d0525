//! Shared fixtures: a concrete model type and engine builders wired to the
//! in-memory source.
#![allow(dead_code)]

use std::any::Any;
use std::sync::{Arc, Once};

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use strato::config::OrmConfig;
use strato::{Engine, FieldValue, MemorySource, Model};

pub const ALIAS: &str = "game";

/// Install a diagnostic tracing subscriber once per test binary.
///
/// `STRATO_LOG` controls verbosity (`STRATO_LOG=debug cargo test -- --nocapture`);
/// the default keeps only warnings so test output stays readable.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_env("STRATO_LOG")
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub age: i64,
    #[serde(skip)]
    pub valid: bool,
}

impl User {
    pub fn new(id: i64, name: &str, age: i64) -> Self {
        Self {
            id,
            name: name.to_string(),
            age,
            valid: true,
        }
    }

    /// Key-only instance for reads and deletes.
    pub fn probe(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

impl Model for User {
    fn alias(&self) -> &'static str {
        ALIAS
    }
    fn table(&self) -> &'static str {
        "user"
    }
    fn columns(&self) -> &'static [&'static str] {
        &["id", "name", "age"]
    }
    fn primary_key(&self) -> &'static str {
        "id"
    }
    fn field(&self, column: &str) -> FieldValue {
        match column {
            "id" => self.id.into(),
            "name" => self.name.clone().into(),
            "age" => self.age.into(),
            _ => FieldValue::Null,
        }
    }
    fn valid(&self) -> bool {
        self.valid
    }
    fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }
    fn clone_model(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Monotonic counter fixture without payload columns.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Seq {
    pub id: i64,
    #[serde(skip)]
    pub valid: bool,
}

impl Model for Seq {
    fn alias(&self) -> &'static str {
        ALIAS
    }
    fn table(&self) -> &'static str {
        "seq"
    }
    fn columns(&self) -> &'static [&'static str] {
        &["id"]
    }
    fn primary_key(&self) -> &'static str {
        "id"
    }
    fn field(&self, column: &str) -> FieldValue {
        match column {
            "id" => self.id.into(),
            _ => FieldValue::Null,
        }
    }
    fn valid(&self) -> bool {
        self.valid
    }
    fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }
    fn clone_model(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Engine with a single shard, so ordering assertions are deterministic,
/// plus the in-memory source it talks to.
pub async fn engine_with_memory() -> (Engine, Arc<MemorySource>) {
    engine_with_queues(1).await
}

/// Engine with an explicit shard count and its in-memory source.
pub async fn engine_with_queues(queues: usize) -> (Engine, Arc<MemorySource>) {
    engine_custom(queues, 1024).await
}

/// Engine with explicit shard count and queue capacity.
pub async fn engine_custom(queues: usize, capacity: usize) -> (Engine, Arc<MemorySource>) {
    init_tracing();
    let config = OrmConfig::from_toml(&format!(
        r#"
        [commit]
        queues = {queues}
        capacity = {capacity}
        "#,
    ))
    .expect("config");
    let engine = Engine::with_config(config).await.expect("engine");
    let source = Arc::new(MemorySource::new());
    engine.register_source(ALIAS, source.clone());
    (engine, source)
}

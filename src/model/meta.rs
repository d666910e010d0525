//! Per-type registration: cacheability, writability and the field table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cache::lock::{rw_read, rw_write};
use crate::error::OrmError;
use crate::model::Model;

const SOURCE: &str = "model::meta";

/// Registered facts about one concrete model type.
///
/// Captured once at registration; lookups on the CRUD hot path are a single
/// map read.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub model_key: String,
    pub alias: String,
    pub table: String,
    /// Participates in the global tier.
    pub cache: bool,
    /// May be mutated through the session API.
    pub writable: bool,
    pub primary_key: &'static str,
    pub columns: &'static [&'static str],
}

/// Process-wide `model_key -> ModelMeta` map.
#[derive(Default)]
pub struct MetaRegistry {
    entries: RwLock<HashMap<String, Arc<ModelMeta>>>,
}

impl MetaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model type. Duplicate registration and probes without a
    /// complete identity are setup bugs, reported as typed errors so the
    /// caller can decide to panic.
    pub fn register(
        &self,
        probe: &dyn Model,
        cache: bool,
        writable: bool,
    ) -> Result<Arc<ModelMeta>, OrmError> {
        if probe.alias().is_empty() || probe.table().is_empty() {
            return Err(OrmError::InvalidArgument {
                message: "model registration requires a non-empty alias and table".to_string(),
            });
        }
        if probe.primary_key().is_empty() {
            return Err(OrmError::InvalidArgument {
                message: format!(
                    "model `{}` registration requires a primary-key column",
                    probe.model_key()
                ),
            });
        }

        let meta = Arc::new(ModelMeta {
            model_key: probe.model_key(),
            alias: probe.alias().to_string(),
            table: probe.table().to_string(),
            cache,
            writable,
            primary_key: probe.primary_key(),
            columns: probe.columns(),
        });

        let mut entries = rw_write(&self.entries, SOURCE, "register");
        if entries.contains_key(&meta.model_key) {
            return Err(OrmError::AlreadyRegistered {
                model: meta.model_key.clone(),
            });
        }
        entries.insert(meta.model_key.clone(), Arc::clone(&meta));
        Ok(meta)
    }

    pub fn get(&self, model_key: &str) -> Option<Arc<ModelMeta>> {
        rw_read(&self.entries, SOURCE, "get").get(model_key).cloned()
    }

    pub fn lookup(&self, model: &dyn Model) -> Option<Arc<ModelMeta>> {
        self.get(&model.model_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;
    use serde::Serialize;
    use std::any::Any;

    #[derive(Debug, Clone, Serialize, Default)]
    struct Sample {
        id: i64,
        #[serde(skip)]
        valid: bool,
    }

    impl Model for Sample {
        fn alias(&self) -> &'static str {
            "test"
        }
        fn table(&self) -> &'static str {
            "sample"
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

    #[test]
    fn register_then_lookup() {
        let registry = MetaRegistry::new();
        let probe = Sample::default();
        registry.register(&probe, true, true).expect("register");

        let meta = registry.lookup(&probe).expect("registered meta");
        assert_eq!(meta.model_key, "test_sample");
        assert!(meta.cache);
        assert!(meta.writable);
        assert_eq!(meta.primary_key, "id");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = MetaRegistry::new();
        let probe = Sample::default();
        registry.register(&probe, true, true).expect("register");

        let err = registry.register(&probe, false, false).unwrap_err();
        assert!(matches!(err, OrmError::AlreadyRegistered { .. }));
    }

    #[test]
    fn unknown_model_is_absent() {
        let registry = MetaRegistry::new();
        assert!(registry.get("test_sample").is_none());
    }
}

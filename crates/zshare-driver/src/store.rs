//! Per-entity key/value persistence
//!
//! The orchestrator owns the authoritative records; the driver keeps a
//! small side store of resolved names per entity id. Writes to
//! different keys are independent, so readers must tolerate partially
//! written records by falling back to deterministic name derivation.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Keys used by the driver
pub mod keys {
    pub const ENTITY_TYPE: &str = "entity_type";
    pub const DATASET_NAME: &str = "dataset_name";
    pub const POOL_NAME: &str = "pool_name";
    pub const SSH_CMD: &str = "ssh_cmd";
    pub const SNAPSHOT_NAME: &str = "snapshot_name";
    pub const REPL_SNAPSHOT_TAG: &str = "repl_snapshot_tag";
}

/// Key/value store contract consumed by the driver
pub trait EntityStore: Send + Sync {
    /// Read one key of one entity, `None` when not yet known
    fn get(&self, entity_id: &str, key: &str) -> Option<String>;

    /// Merge the given pairs into the entity's record
    fn update(&self, entity_id: &str, pairs: &[(&str, &str)]);

    /// Drop the whole record for an entity
    fn delete(&self, entity_id: &str);
}

/// In-memory `EntityStore` for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, entity_id: &str, key: &str) -> Option<String> {
        self.inner.read().get(entity_id)?.get(key).cloned()
    }

    fn update(&self, entity_id: &str, pairs: &[(&str, &str)]) {
        let mut inner = self.inner.write();
        let record = inner.entry(entity_id.to_string()).or_default();
        for (key, value) in pairs {
            record.insert((*key).to_string(), (*value).to_string());
        }
    }

    fn delete(&self, entity_id: &str) {
        self.inner.write().remove(entity_id);
    }
}

//! Protocol helper seam
//!
//! Export management (NFS and friends) lives outside the core. The
//! driver resolves a helper by protocol string from an explicit
//! registry built once at construction; there is no process-wide
//! helper singleton, so tests and multiple driver instances can carry
//! their own doubles.

use std::collections::HashMap;
use std::sync::Arc;
use zshare_common::{AccessRule, Error, Result};

/// Per-protocol export management contract
pub trait ProtocolHelper: Send + Sync {
    /// Create exports for a dataset, returning its export locations
    fn create_exports(&self, dataset_name: &str) -> Result<Vec<String>>;

    /// Remove all exports of a dataset
    fn remove_exports(&self, dataset_name: &str) -> Result<()>;

    /// Current export locations of a dataset
    fn get_exports(&self, dataset_name: &str) -> Result<Vec<String>>;

    /// Apply access rules; `make_all_ro` downgrades every rule to
    /// read-only (used for non-active replicas)
    fn update_access(
        &self,
        dataset_name: &str,
        access_rules: &[AccessRule],
        add_rules: &[AccessRule],
        delete_rules: &[AccessRule],
        make_all_ro: bool,
    ) -> Result<()>;
}

/// Explicit protocol-to-helper mapping owned by a driver instance
#[derive(Clone, Default)]
pub struct HelperRegistry {
    helpers: HashMap<String, Arc<dyn ProtocolHelper>>,
}

impl HelperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a helper under a protocol name, replacing any existing one
    #[must_use]
    pub fn with_helper(mut self, proto: impl Into<String>, helper: Arc<dyn ProtocolHelper>) -> Self {
        self.helpers.insert(proto.into(), helper);
        self
    }

    /// Resolve the helper for a protocol
    pub fn get(&self, proto: &str) -> Result<&Arc<dyn ProtocolHelper>> {
        self.helpers
            .get(proto)
            .ok_or_else(|| Error::UnknownProtocol(proto.to_string()))
    }

    /// Whether any helper is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }
}

impl std::fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperRegistry")
            .field("protocols", &self.helpers.keys().collect::<Vec<_>>())
            .finish()
    }
}

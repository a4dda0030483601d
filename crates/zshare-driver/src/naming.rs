//! Deterministic naming of datasets and snapshots
//!
//! ZFS disallows hyphens in the parts of its namespace we control, so
//! every orchestrator id is sanitized with `-` replaced by `_`. Pool
//! configuration is validated once at construction; name derivations
//! after that are pure string transforms.

use chrono::Utc;
use zshare_common::{DriverConfig, Error, Result};

/// Validated pool list plus the configured name prefixes
#[derive(Clone, Debug)]
pub struct NameScheme {
    /// `(root pool, full configured entry)` pairs, trailing `/` stripped
    pools: Vec<(String, String)>,
    dataset_name_prefix: String,
    snapshot_name_prefix: String,
    replica_snapshot_prefix: String,
}

fn sanitize(id: &str) -> String {
    id.replace('-', "_")
}

impl NameScheme {
    /// Validate the configured pool list and capture the name prefixes.
    ///
    /// An empty pool list, a duplicated pool, or one pool nested inside
    /// another (`foo` next to `foo/quuz`) is a fatal configuration
    /// error: nested roots would make dataset listings ambiguous.
    pub fn new(config: &DriverConfig) -> Result<Self> {
        if config.zpool_list.is_empty() {
            return Err(Error::configuration("no zpools configured"));
        }
        let mut pools: Vec<(String, String)> = Vec::with_capacity(config.zpool_list.len());
        for entry in &config.zpool_list {
            let entry = entry.trim_end_matches('/');
            if entry.is_empty() {
                return Err(Error::configuration("empty zpool entry"));
            }
            let root = entry.split('/').next().unwrap_or(entry);
            if pools.iter().any(|(existing, _)| existing == root) {
                return Err(Error::configuration(format!(
                    "zpool `{root}` is listed more than once (or nested inside another entry)"
                )));
            }
            pools.push((root.to_string(), entry.to_string()));
        }
        Ok(Self {
            pools,
            dataset_name_prefix: config.dataset_name_prefix.clone(),
            snapshot_name_prefix: config.snapshot_name_prefix.clone(),
            replica_snapshot_prefix: config.replica_snapshot_prefix.clone(),
        })
    }

    /// Root pool names, in configuration order
    pub fn pool_roots(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|(root, _)| root.as_str())
    }

    /// Dataset leaf name for a share id
    #[must_use]
    pub fn share_name(&self, share_id: &str) -> String {
        format!("{}{}", self.dataset_name_prefix, sanitize(share_id))
    }

    /// Snapshot tag for a user snapshot id
    #[must_use]
    pub fn snapshot_name(&self, snapshot_id: &str) -> String {
        format!("{}{}", self.snapshot_name_prefix, sanitize(snapshot_id))
    }

    /// Full dataset name for a share placed on `pool`
    ///
    /// `pool` is the root pool recorded on the entity; the derived name
    /// uses the full configured entry (which may be a nested dataset
    /// root such as `bar/subbar`).
    pub fn dataset_name(&self, pool: &str, share_id: &str) -> Result<String> {
        let entry = self
            .pools
            .iter()
            .find(|(root, _)| root == pool)
            .map(|(_, entry)| entry)
            .ok_or_else(|| Error::configuration(format!("zpool `{pool}` is not configured")))?;
        Ok(format!("{entry}/{}", self.share_name(share_id)))
    }

    /// Snapshot-tag prefix reserved for one replica's replication snapshots
    #[must_use]
    pub fn replication_snapshot_prefix(&self, replica_id: &str) -> String {
        format!("{}_{}", self.replica_snapshot_prefix, sanitize(replica_id))
    }

    /// Fresh, unique replication snapshot tag for one sync round
    #[must_use]
    pub fn replication_snapshot_tag(&self, replica_id: &str) -> String {
        format!(
            "{}_time_{}",
            self.replication_snapshot_prefix(replica_id),
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )
    }

    /// Whether a snapshot tag belongs to the reserved replication class
    #[must_use]
    pub fn is_replication_tag(&self, tag: &str) -> bool {
        tag.starts_with(&self.replica_snapshot_prefix)
    }
}

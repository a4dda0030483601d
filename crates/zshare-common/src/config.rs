//! Configuration types for ZShare
//!
//! This module defines the driver configuration consumed by the core.
//! Validation of pool names and addresses happens at driver
//! construction, not during deserialization.

use serde::{Deserialize, Serialize};

/// Driver configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Backend name reported to the orchestrator
    pub backend_name: String,
    /// ZFS pools (or nested dataset roots) this driver provisions into
    pub zpool_list: Vec<String>,
    /// IP address shares are exported on
    pub share_export_ip: String,
    /// IP address of the service network used for replication transfers
    pub service_ip: String,
    /// Route all zfs commands through SSH instead of local execution
    pub use_ssh: bool,
    /// SSH username for remote command execution
    pub ssh_username: String,
    /// SSH connection timeout in seconds
    pub ssh_conn_timeout_secs: u64,
    /// Prefix for dataset names derived from share ids
    pub dataset_name_prefix: String,
    /// Prefix for snapshot tags derived from snapshot ids
    pub snapshot_name_prefix: String,
    /// Prefix reserved for internal replication snapshots
    pub replica_snapshot_prefix: String,
    /// `key=value` options applied to every created dataset
    pub dataset_creation_options: Vec<String>,
    /// Replication domain tag; pools advertise replication when set
    pub replication_domain: Option<String>,
    /// Reserved capacity percentage reported per pool
    pub reserved_percentage: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend_name: "zshare".to_string(),
            zpool_list: Vec::new(),
            share_export_ip: String::new(),
            service_ip: String::new(),
            use_ssh: false,
            ssh_username: "root".to_string(),
            ssh_conn_timeout_secs: 60,
            dataset_name_prefix: "share_".to_string(),
            snapshot_name_prefix: "snapshot_".to_string(),
            replica_snapshot_prefix: "tmp_snapshot_for_replication_".to_string(),
            dataset_creation_options: Vec::new(),
            replication_domain: None,
            reserved_percentage: 0,
        }
    }
}

impl DriverConfig {
    /// The `user@host` target used to reach this backend's service network
    #[must_use]
    pub fn service_ssh_target(&self) -> String {
        format!("{}@{}", self.ssh_username, self.service_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert!(config.zpool_list.is_empty());
        assert_eq!(config.replica_snapshot_prefix, "tmp_snapshot_for_replication_");
        assert_eq!(config.reserved_percentage, 0);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: DriverConfig = serde_json::from_str(
            r#"{
                "zpool_list": ["foo", "bar/subbar"],
                "share_export_ip": "1.1.1.1",
                "service_ip": "2.2.2.2"
            }"#,
        )
        .unwrap();
        assert_eq!(config.zpool_list, ["foo", "bar/subbar"]);
        assert_eq!(config.dataset_name_prefix, "share_");
        assert_eq!(config.ssh_username, "root");
        assert!(!config.use_ssh);
    }

    #[test]
    fn test_service_ssh_target() {
        let config = DriverConfig {
            ssh_username: "admin".to_string(),
            service_ip: "240.241.242.244".to_string(),
            ..DriverConfig::default()
        };
        assert_eq!(config.service_ssh_target(), "admin@240.241.242.244");
    }
}

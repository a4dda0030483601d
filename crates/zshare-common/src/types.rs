//! Domain records for ZShare
//!
//! Shares, snapshots and replicas are owned by the orchestrator; the
//! structs here mirror the fields the core reads. Host strings follow
//! the `hostname@backend#pool` convention.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Extract the pool component from a `hostname@backend#pool` host string
pub fn pool_from_host(host: &str) -> Result<&str> {
    host.rsplit_once('#')
        .map(|(_, pool)| pool)
        .filter(|pool| !pool.is_empty())
        .ok_or_else(|| Error::invalid_request(format!("host `{host}` names no pool")))
}

/// A file share as presented by the orchestrator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Share {
    /// Orchestrator identifier
    pub id: String,
    /// `hostname@backend#pool` placement string
    pub host: String,
    /// Provisioned size in gigabytes
    pub size_gb: u64,
    /// Access protocol, e.g. "NFS"
    pub share_proto: String,
}

impl Share {
    /// Pool this share is placed on
    pub fn pool(&self) -> Result<&str> {
        pool_from_host(&self.host)
    }
}

/// A user-facing snapshot of a share
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Orchestrator identifier
    pub id: String,
    /// Identifier of the share the snapshot belongs to
    pub share_id: String,
    /// `hostname@backend#pool` placement string
    pub host: String,
    /// Size in gigabytes of the share at snapshot time
    pub size_gb: u64,
}

/// One copy of a replicated share
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Replica {
    /// Orchestrator identifier
    pub id: String,
    /// `hostname@backend#pool` placement string
    pub host: String,
    /// Provisioned size in gigabytes
    pub size_gb: u64,
    /// Access protocol, e.g. "NFS"
    pub share_proto: String,
    /// Current state; `None` for a replica still being created
    pub replica_state: Option<ReplicaState>,
}

impl Replica {
    /// Pool this replica is placed on
    pub fn pool(&self) -> Result<&str> {
        pool_from_host(&self.host)
    }

    /// Whether this replica currently holds the active role
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.replica_state == Some(ReplicaState::Active)
    }
}

/// Replication state of a single replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    /// The read-write, externally exported copy
    Active,
    /// Synchronized with the active copy
    InSync,
    /// Fell behind; needs a resync from the last common baseline
    OutOfSync,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::InSync => "in_sync",
            Self::OutOfSync => "out_of_sync",
        })
    }
}

/// Whether a replica's access rules match the orchestrator's view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessRulesStatus {
    /// Rules applied as requested
    Active,
    /// Rules could not be applied; a later update must reconcile
    OutOfSync,
}

impl fmt::Display for AccessRulesStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::OutOfSync => "out_of_sync",
        })
    }
}

/// Per-replica outcome reported back to the orchestrator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaUpdate {
    /// Replica the entry refers to
    pub id: String,
    /// New replication state, when it changed
    pub replica_state: Option<ReplicaState>,
    /// New access-rules status
    pub access_rules_status: AccessRulesStatus,
    /// Export locations, populated only on replica creation
    pub export_locations: Option<Vec<String>>,
}

/// One access rule to apply to a share's exports
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessRule {
    /// Rule kind, e.g. "ip"
    pub access_type: String,
    /// Address or principal the rule applies to
    pub access_to: String,
    /// Requested level, e.g. "rw" or "ro"
    pub access_level: String,
}

/// Per-share virtual server handle. This driver model is host-less, so
/// any operation receiving one fails with an invalid-request error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareServer {
    /// Orchestrator identifier
    pub id: String,
}

/// Capacity summary for one configured pool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Pool name
    pub pool_name: String,
    /// Total capacity in gigabytes
    pub total_capacity_gb: f64,
    /// Free capacity in gigabytes
    pub free_capacity_gb: f64,
    /// Configured reserved percentage
    pub reserved_percentage: u8,
    /// Replication kind advertised when a replication domain is set
    pub replication_type: Option<String>,
}

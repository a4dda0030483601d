//! ZShare Driver - ZFS share management core
//!
//! This crate implements the driver core invoked by a storage
//! orchestrator:
//! - Deterministic naming of pools, datasets and snapshots
//! - Share and snapshot lifecycle on copy-on-write datasets
//! - Bounded-retry teardown of mounted or busy resources
//! - Cross-host snapshot replication (create, resync, promote, delete)

pub mod driver;
pub mod helpers;
pub mod naming;
pub mod replication;
pub mod store;
pub mod teardown;

#[cfg(test)]
pub(crate) mod test_support;

pub use driver::ZfsDriver;
pub use helpers::{HelperRegistry, ProtocolHelper};
pub use naming::NameScheme;
pub use store::{EntityStore, MemoryStore};
pub use teardown::TeardownPolicy;

//! ZShare Exec - Command execution facade
//!
//! This crate provides:
//! - The `Executor` trait the driver core issues commands through
//! - A process-backed `LocalExecutor`, including the two-process
//!   send/receive pipeline used for replication transfers
//! - The header-driven parser for `zfs` tabular answers

pub mod answer;
pub mod executor;

pub use answer::{parse_table, Row};
pub use executor::{CommandOutput, Executor, LocalExecutor};

//! ZShare Common - Shared types and utilities
//!
//! This crate provides the common error type, configuration structures,
//! and domain records used across all ZShare components.

pub mod config;
pub mod error;
pub mod types;

pub use config::DriverConfig;
pub use error::{is_busy_signature, Error, Result};
pub use types::*;

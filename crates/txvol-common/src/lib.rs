//! txvol Common - Shared types and utilities
//!
//! This crate provides the error type, configuration, dataset name helpers
//! and block checksums used by the volume layer and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::BlockChecksum;
pub use config::VolumeConfig;
pub use error::{Error, Result};
pub use types::*;

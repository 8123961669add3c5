//! chunklog Common - Shared types and utilities
//!
//! This crate provides the identifiers, configuration, checksum helpers and
//! error definitions used by the log engine and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{compute_payload_crc, verify_payload_crc};
pub use config::{HarddriveAccess, LogConfig};
pub use error::{Error, Result};
pub use types::*;

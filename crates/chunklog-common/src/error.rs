//! Error types for chunklog
//!
//! This module defines the common error type used by the log engine.

use crate::types::{NodeId, RangeId};
use thiserror::Error;

/// Common result type for chunklog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for chunklog
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("secondary log of range {range} (owner 0x{owner:04X}) is full: {required} bytes required")]
    LogFull {
        owner: NodeId,
        range: RangeId,
        required: usize,
    },

    #[error("log entry too large: {size} bytes, max {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    // Corruption errors
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    // Protocol errors
    #[error("backup range {range} of owner 0x{owner:04X} not found")]
    RangeNotFound { owner: NodeId, range: RangeId },

    #[error("backup range {range} of owner 0x{owner:04X} already exists")]
    RangeAlreadyExists { owner: NodeId, range: RangeId },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Lifecycle errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("log engine is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a data corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::DataCorruption(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the caller may retry the failed operation.
    ///
    /// Nothing is retried inside the engine: a torn append that is retried
    /// could duplicate data. Only a full secondary log may succeed later,
    /// once reorganization has freed segments.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LogFull { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RangeNotFound { .. })
    }

    /// Check if this error reports corrupted log data
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::DataCorruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let full = Error::LogFull {
            owner: 1,
            range: 0,
            required: 128,
        };
        assert!(full.is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
        assert!(!Error::storage("write failed").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::RangeNotFound { owner: 2, range: 7 }.is_not_found());
        assert!(!Error::corruption("bad header").is_not_found());
    }

    #[test]
    fn test_error_corruption() {
        assert!(
            Error::ChecksumMismatch {
                expected: 1,
                actual: 2
            }
            .is_corruption()
        );
        assert!(Error::corruption("zero length").is_corruption());
        assert!(!Error::ShuttingDown.is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = Error::RangeNotFound {
            owner: 0x00AB,
            range: 3,
        };
        assert_eq!(err.to_string(), "backup range 3 of owner 0x00AB not found");

        let err = Error::ChecksumMismatch {
            expected: 0xDEAD_BEEF,
            actual: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0xdeadbeef, got 0x00000001"
        );
    }
}

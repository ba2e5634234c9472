//! Error types for lsvol
//!
//! This module defines the storage-layer error type shared by the
//! allocator, cache, block store and metadata log.

use crate::types::RegionId;
use thiserror::Error;

/// Common result type for lsvol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for lsvol
#[derive(Debug, Error)]
pub enum Error {
    // Allocation errors
    #[error("out of space: requested {requested} blocks, {available} free")]
    OutOfSpace { requested: u64, available: u64 },

    #[error("region not found: {0}")]
    RegionNotFound(RegionId),

    #[error("invalid block range: {0}")]
    InvalidBlock(String),

    // Cache errors
    #[error("cache full: need {needed} bytes, capacity {capacity} bytes")]
    CacheFull { needed: u64, capacity: u64 },

    // Device errors
    #[error("device I/O error on {region} at block {offset}: {source}")]
    DeviceIo {
        region: RegionId,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    // Metadata log errors
    #[error("log store error: {0}")]
    Log(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request timeout")]
    Timeout,

    #[error("engine halted after a fatal error")]
    Halted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a log store error
    pub fn log(msg: impl Into<String>) -> Self {
        Self::Log(msg.into())
    }

    /// Create a device I/O error
    pub fn device_io(region: RegionId, offset: u64, source: std::io::Error) -> Self {
        Self::DeviceIo {
            region,
            offset,
            source,
        }
    }

    /// Device and log failures cannot be recovered locally
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceIo { .. } | Self::Log(_) | Self::Halted)
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheFull { .. } | Self::Timeout)
    }
}

//! Volume error types

use lsvol_common::Error as StorageError;
use thiserror::Error;

/// Volume-layer error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Request extends past the end of the volume
    #[error("LBA {lba} + {nblks} blocks exceeds volume size {size}")]
    OutOfBounds { lba: u64, nblks: u64, size: u64 },

    /// Buffer length does not match the block count
    #[error("Invalid length: {len} bytes for {nblks} blocks of {block_size}")]
    InvalidLength {
        len: usize,
        nblks: u64,
        block_size: u32,
    },

    /// Volume has not been opened
    #[error("Volume is not open")]
    NotOpen,

    /// Volume is already open
    #[error("Volume is already open")]
    AlreadyOpen,

    /// Engine halted after a fatal error
    #[error("Engine halted after a fatal error")]
    Halted,

    /// Metadata replay failed
    #[error("Recovery failed: {0}")]
    Recovery(String),

    /// Storage layer error
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BlockError {
    /// Device and log failures, which escalate to the fatal policy
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_fatal(),
            Self::Halted => true,
            _ => false,
        }
    }
}

/// Result type for volume operations
pub type BlockResult<T> = Result<T, BlockError>;

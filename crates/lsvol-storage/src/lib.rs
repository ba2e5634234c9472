//! lsvol Storage - Physical layer of the block engine
//!
//! This crate implements everything below the logical volume:
//! - Asynchronous block devices (in-memory and file-backed)
//! - Multi-region block allocation with epoch-deferred frees
//! - Write-back block cache with pinning and LRU eviction
//! - The block store composing allocator, cache and devices
//! - The metadata log used for crash recovery

pub mod blkstore;
pub mod block;
pub mod cache;
pub mod device;
pub mod metalog;

// Re-exports
pub use blkstore::{AllocatedWrite, BlockStore};
pub use block::{AllocHints, BlockAllocator, BlockBitmap, Extent};
pub use cache::{BlockCache, CacheKey, CacheStats, FlushStats, PinGuard};
pub use device::{BlockDevice, DeviceSet, FileDevice, MemDevice};
pub use metalog::{FileLogStore, LogRecord, LogStore, MemLogStore};

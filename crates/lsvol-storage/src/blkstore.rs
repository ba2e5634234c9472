//! Block store
//!
//! Composes the allocator, the write-back cache and the devices into the
//! unit of allocate, write, read and free over raw storage.

use crate::block::{AllocHints, BlockAllocator};
use crate::cache::{BlockCache, FlushStats};
use crate::device::DeviceSet;
use bytes::Bytes;
use lsvol_common::{BlockId, Epoch, Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of [`BlockStore::alloc_and_write`]
///
/// Owns the written ranges until [`AllocatedWrite::publish`] hands them
/// over. Dropping it unpublished, including when the writing future is
/// cancelled, invalidates their cache entries and returns them to the
/// allocator.
#[must_use = "dropping an unpublished write releases its blocks"]
pub struct AllocatedWrite {
    blocks: Vec<BlockId>,
    allocator: Arc<BlockAllocator>,
    cache: Arc<BlockCache>,
    /// Time spent in the allocator
    pub alloc_time: Duration,
    /// Time spent writing into the cache or devices
    pub write_time: Duration,
}

impl AllocatedWrite {
    /// Ranges holding the data, in data order
    #[must_use]
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Take ownership of the ranges, e.g. once they are mapped
    #[must_use]
    pub fn publish(mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.blocks)
    }
}

impl fmt::Debug for AllocatedWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedWrite")
            .field("blocks", &self.blocks)
            .field("alloc_time", &self.alloc_time)
            .field("write_time", &self.write_time)
            .finish_non_exhaustive()
    }
}

impl Drop for AllocatedWrite {
    fn drop(&mut self) {
        if self.blocks.is_empty() {
            return;
        }
        for block in &self.blocks {
            self.cache.invalidate(*block);
            self.allocator.release(*block);
        }
        debug!("released {} unpublished ranges", self.blocks.len());
    }
}

/// Allocator + cache + devices
pub struct BlockStore {
    allocator: Arc<BlockAllocator>,
    cache: Arc<BlockCache>,
    devices: Arc<DeviceSet>,
    block_size: u32,
}

impl BlockStore {
    /// Build a store with a fresh allocator over every region in `devices`
    #[must_use]
    pub fn new(devices: Arc<DeviceSet>, cache_capacity_bytes: u64, allow_split: bool) -> Self {
        let allocator = Arc::new(BlockAllocator::new(&devices.regions(), allow_split));
        let cache = Arc::new(BlockCache::new(Arc::clone(&devices), cache_capacity_bytes));
        Self::from_parts(allocator, cache, devices)
    }

    #[must_use]
    pub fn from_parts(
        allocator: Arc<BlockAllocator>,
        cache: Arc<BlockCache>,
        devices: Arc<DeviceSet>,
    ) -> Self {
        let block_size = devices.block_size();
        Self {
            allocator,
            cache,
            devices,
            block_size,
        }
    }

    pub const fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    pub const fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub const fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Write `data` to `block` through the cache
    ///
    /// The data lands in the cache as dirty for `epoch`. If the cache is
    /// full, every dirty entry is written back and the insert retried;
    /// if it still does not fit, the data is written straight to the
    /// device instead.
    pub async fn write(&self, block: BlockId, data: Bytes, epoch: Epoch) -> Result<()> {
        match self.cache.put_dirty(block, &data, epoch) {
            Err(Error::CacheFull { needed, capacity }) => {
                warn!(
                    "cache full ({} of {} bytes needed), forcing write-back",
                    needed, capacity
                );
                self.cache.flush_dirty(|_| true).await?;
                self.cache.evict();
            }
            other => return other,
        }

        match self.cache.put_dirty(block, &data, epoch) {
            Err(Error::CacheFull { .. }) => {
                warn!("cache still full, writing {} through to device", block);
                // Stale entries from an earlier use of these blocks must not
                // shadow the new data
                self.cache.invalidate(block);
                self.devices.write(block.region, block.offset, data).await
            }
            other => other,
        }
    }

    /// Read the contents of `block`
    pub async fn read(&self, block: BlockId) -> Result<Bytes> {
        self.cache.get_or_fetch(block).await
    }

    /// Allocate room for `data` and write it
    ///
    /// On a write failure every allocated range is released before the
    /// error is returned; nothing has been published for them yet. The
    /// same happens if the returned future is dropped before completing.
    pub async fn alloc_and_write(
        &self,
        data: Bytes,
        epoch: Epoch,
        hints: AllocHints,
    ) -> Result<AllocatedWrite> {
        let bs = self.block_size as usize;
        if data.is_empty() || data.len() % bs != 0 {
            return Err(Error::InvalidBlock(format!(
                "write of {} bytes is not a whole number of blocks",
                data.len()
            )));
        }
        let nblks = u32::try_from(data.len() / bs)
            .map_err(|_| Error::InvalidBlock("write too large".into()))?;

        let start = Instant::now();
        let blocks = self.allocator.allocate_extents(nblks, hints)?;
        let alloc_time = start.elapsed();

        let mut written = AllocatedWrite {
            blocks,
            allocator: Arc::clone(&self.allocator),
            cache: Arc::clone(&self.cache),
            alloc_time,
            write_time: Duration::ZERO,
        };

        let start = Instant::now();
        let mut pos = 0usize;
        for block in &written.blocks {
            let len = block.byte_len(self.block_size);
            self.write(*block, data.slice(pos..pos + len), epoch).await?;
            pos += len;
        }
        written.write_time = start.elapsed();
        Ok(written)
    }

    /// Write back dirty cache entries for epochs at or before `epoch`
    pub async fn flush_through(&self, epoch: Epoch) -> Result<FlushStats> {
        self.cache.flush_dirty(move |e| e <= epoch).await
    }

    /// Make every acknowledged device write durable
    pub async fn sync(&self) -> Result<()> {
        self.devices.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::device::{BlockDevice, MemDevice};
    use lsvol_common::RegionId;

    const BS: u32 = 512;

    fn setup(dev_blocks: u64, cache_blocks: u64) -> (Arc<MemDevice>, BlockStore) {
        let dev = Arc::new(MemDevice::new(BS, dev_blocks));
        let set = DeviceSet::from_devices(BS, [dev.clone() as Arc<dyn BlockDevice>]).unwrap();
        let store = BlockStore::new(Arc::new(set), cache_blocks * u64::from(BS), false);
        (dev, store)
    }

    fn fill(nblks: u32, byte: u8) -> Bytes {
        Bytes::from(vec![byte; (nblks * BS) as usize])
    }

    #[tokio::test]
    async fn test_alloc_write_read() {
        let (dev, store) = setup(32, 16);
        let written = store
            .alloc_and_write(fill(4, 5), Epoch::new(1), AllocHints::default())
            .await
            .unwrap();
        let blocks = written.publish();
        assert_eq!(blocks.len(), 1);
        let block = blocks[0];
        assert_eq!(block.nblks, 4);

        assert_eq!(store.read(block).await.unwrap(), fill(4, 5));
        // Still only in the cache
        assert_eq!(dev.write_count(), 0);

        store.flush_through(Epoch::new(1)).await.unwrap();
        store.sync().await.unwrap();
        assert_eq!(dev.submit_read(block.offset, 4).await.unwrap(), fill(4, 5));
    }

    #[tokio::test]
    async fn test_cache_full_falls_back_to_write_through() {
        let (dev, store) = setup(32, 2);
        let a = store
            .alloc_and_write(fill(2, 1), Epoch::new(1), AllocHints::default())
            .await
            .unwrap()
            .publish();

        // Epoch 1 entries stay pinned, so the second write cannot be cached
        let b = store
            .alloc_and_write(fill(2, 2), Epoch::new(1), AllocHints::default())
            .await
            .unwrap()
            .publish();
        assert!(dev.write_count() >= 4);
        assert_eq!(store.read(a[0]).await.unwrap(), fill(2, 1));
        assert_eq!(store.read(b[0]).await.unwrap(), fill(2, 2));
    }

    #[tokio::test]
    async fn test_failed_write_releases_allocation() {
        let (dev, store) = setup(8, 1);
        // Fill the cache so the next write goes to the device
        let _held = store
            .alloc_and_write(fill(1, 1), Epoch::new(1), AllocHints::default())
            .await
            .unwrap();
        dev.fail_writes(true);

        let free_before = store.allocator().free_blocks();
        let err = store
            .alloc_and_write(fill(2, 2), Epoch::new(1), AllocHints::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.allocator().free_blocks(), free_before);
    }

    #[tokio::test]
    async fn test_unpublished_write_is_released() {
        let (_dev, store) = setup(16, 8);
        let written = store
            .alloc_and_write(fill(3, 4), Epoch::new(1), AllocHints::default())
            .await
            .unwrap();
        let block = written.blocks()[0];
        assert_eq!(store.allocator().free_blocks(), 13);
        assert!(store.cache().contains(&CacheKey::new(block.region, block.offset)));

        drop(written);
        assert_eq!(store.allocator().free_blocks(), 16);
        assert!(!store.allocator().is_allocated(block));
        assert_eq!(store.cache().dirty_bytes(), 0);
        assert!(store.cache().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_write_releases_allocation() {
        let dev = Arc::new(MemDevice::new(BS, 16).with_latency(Duration::from_millis(200)));
        let set = DeviceSet::from_devices(BS, [dev as Arc<dyn BlockDevice>]).unwrap();
        let store = BlockStore::new(Arc::new(set), u64::from(BS), false);
        let _held = store
            .alloc_and_write(fill(1, 1), Epoch::new(1), AllocHints::default())
            .await
            .unwrap();

        // The cache is full, so this write blocks on a slow write-back
        let write = store.alloc_and_write(fill(1, 2), Epoch::new(1), AllocHints::default());
        assert!(tokio::time::timeout(Duration::from_millis(20), write).await.is_err());

        assert_eq!(store.allocator().free_blocks(), 15);
        assert_eq!(store.cache().pin_count(&CacheKey::new(RegionId(0), 0)), 0);
    }

    #[tokio::test]
    async fn test_out_of_space_surfaces() {
        let (_dev, store) = setup(4, 8);
        let err = store
            .alloc_and_write(fill(5, 0), Epoch::new(1), AllocHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfSpace { requested: 5, .. }));
        assert_eq!(store.allocator().free_blocks(), 4);
        assert!(!store.allocator().is_allocated(BlockId::new(RegionId(0), 0, 1)));
    }

    #[tokio::test]
    async fn test_rejects_partial_block() {
        let (_dev, store) = setup(4, 8);
        let err = store
            .alloc_and_write(Bytes::from(vec![0u8; 100]), Epoch::new(1), AllocHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBlock(_)));
    }
}

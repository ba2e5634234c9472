//! Write-back block cache
//!
//! Entries are keyed per physical block and hold the block's bytes, a
//! dirty flag, an explicit pin count and an epoch pin. Eviction is LRU over
//! a logical clock and only ever considers entries that are clean,
//! unpinned and not held for an uncommitted epoch.
//!
//! Entries live in a sharded map, so lookups and updates of different
//! blocks do not contend. Resident bytes are accounted under a single
//! mutex which is also held for the duration of an eviction pass; a new
//! entry is only inserted after its bytes have been reserved there, so
//! the resident total never exceeds capacity.
//!
//! The same mutex guards the eviction order: an ordered set of candidate
//! keys stamped with their access clock. A key is queued whenever its
//! entry becomes evictable. Hits only bump the entry's clock; a stale
//! stamp is re-queued when it reaches the front, and entries that stopped
//! being evictable are dropped from the queue until they qualify again.

use crate::device::DeviceSet;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use lsvol_common::{BlockId, Epoch, Error, RegionId, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Longest run of contiguous dirty blocks written in one device request
const MAX_FLUSH_RUN: usize = 256;

/// Device writes in flight during a flush
const FLUSH_CONCURRENCY: usize = 32;

/// Snapshot of a dirty entry taken for write-back: key, data, generation
type DirtyBlock = (CacheKey, Bytes, u64);

/// Cache key uniquely identifies a block across all regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub region: RegionId,
    pub blkno: u64,
}

impl CacheKey {
    #[must_use]
    pub const fn new(region: RegionId, blkno: u64) -> Self {
        Self { region, blkno }
    }

    fn of(block: BlockId) -> impl Iterator<Item = Self> {
        (block.offset..block.end()).map(move |blkno| Self::new(block.region, blkno))
    }
}

struct CacheEntry {
    data: Bytes,
    last_access: AtomicU64,
    dirty: bool,
    /// Epoch of the write that dirtied the entry
    dirty_epoch: Epoch,
    /// Held until this epoch commits
    epoch_pin: Option<Epoch>,
    pins: u32,
    /// Bumped on every dirtying write
    generation: u64,
}

impl CacheEntry {
    fn clean(data: Bytes, clock: u64) -> Self {
        Self {
            data,
            last_access: AtomicU64::new(clock),
            dirty: false,
            dirty_epoch: Epoch::ZERO,
            epoch_pin: None,
            pins: 0,
            generation: 0,
        }
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }

    const fn is_evictable(&self) -> bool {
        self.pins == 0 && !self.dirty && self.epoch_pin.is_none()
    }
}

/// Resident byte count and eviction order
#[derive(Default)]
struct Residency {
    bytes: u64,
    /// Eviction candidates as (access clock when queued, key)
    lru: BTreeSet<(u64, CacheKey)>,
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    /// Dirty blocks written back to a device
    pub writebacks: AtomicU64,
}

impl CacheStats {
    /// Hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Result of a dirty flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Blocks written to devices
    pub blocks: u64,
    /// Device write requests issued
    pub requests: u64,
}

/// Keeps cache entries pinned while alive
#[must_use = "entries are unpinned as soon as the guard is dropped"]
pub struct PinGuard<'a> {
    cache: &'a BlockCache,
    keys: Vec<CacheKey>,
}

impl PinGuard<'_> {
    /// Number of entries this guard pinned
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin_keys(&self.keys);
    }
}

/// LRU write-back cache in front of a [`DeviceSet`]
pub struct BlockCache {
    entries: DashMap<CacheKey, CacheEntry>,
    devices: Arc<DeviceSet>,
    /// Also serializes eviction passes
    resident: Mutex<Residency>,
    dirty_bytes: AtomicU64,
    capacity: u64,
    block_size: u32,
    clock: AtomicU64,
    generation: AtomicU64,
    stats: CacheStats,
}

impl BlockCache {
    /// Create a cache holding at most `capacity_bytes` of block data
    #[must_use]
    pub fn new(devices: Arc<DeviceSet>, capacity_bytes: u64) -> Self {
        let block_size = devices.block_size();
        Self {
            entries: DashMap::new(),
            devices,
            resident: Mutex::new(Residency::default()),
            dirty_bytes: AtomicU64::new(0),
            capacity: capacity_bytes,
            block_size,
            clock: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    const fn bs(&self) -> u64 {
        self.block_size as u64
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.resident.lock().bytes
    }

    #[must_use]
    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Check if a block's entry is dirty
    #[must_use]
    pub fn is_dirty(&self, key: &CacheKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.dirty)
    }

    /// Explicit pin count of a block's entry
    #[must_use]
    pub fn pin_count(&self, key: &CacheKey) -> u32 {
        self.entries.get(key).map_or(0, |e| e.pins)
    }

    /// Reserve room for `bytes` more resident data, evicting if needed
    fn reserve(&self, bytes: u64) -> bool {
        let mut res = self.resident.lock();
        if res.bytes + bytes > self.capacity {
            self.evict_locked(&mut res, bytes);
        }
        if res.bytes + bytes > self.capacity {
            return false;
        }
        res.bytes += bytes;
        true
    }

    fn unreserve(&self, bytes: u64) {
        let mut res = self.resident.lock();
        res.bytes = res.bytes.saturating_sub(bytes);
    }

    /// Queue entries that just became evictable
    ///
    /// Must not be called while holding an entry guard.
    fn enqueue(&self, candidates: Vec<(u64, CacheKey)>) {
        if !candidates.is_empty() {
            self.resident.lock().lru.extend(candidates);
        }
    }

    /// Evict LRU entries until `needed` more bytes fit
    fn evict_locked(&self, res: &mut Residency, needed: u64) {
        let mut evicted = 0u64;
        while res.bytes + needed > self.capacity {
            let Some((stamp, key)) = res.lru.pop_first() else {
                break;
            };
            let mut touched = None;
            let removed = self.entries.remove_if(&key, |_, e| {
                if !e.is_evictable() {
                    return false;
                }
                let access = e.last_access.load(Ordering::Relaxed);
                if access > stamp {
                    touched = Some(access);
                    return false;
                }
                true
            });
            if removed.is_some() {
                res.bytes = res.bytes.saturating_sub(self.bs());
                evicted += 1;
            } else if let Some(access) = touched {
                res.lru.insert((access, key));
            }
        }
        self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    /// Run an eviction pass down to capacity
    pub fn evict(&self) {
        let mut res = self.resident.lock();
        if res.bytes > self.capacity {
            self.evict_locked(&mut res, 0);
        }
    }

    /// Look up a single block without fetching
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let entry = self.entries.get(key)?;
        entry.touch(self.tick());
        Some(entry.data.clone())
    }

    /// Read the blocks of `block`, fetching misses from the device
    ///
    /// Fetched blocks are inserted clean unless another writer populated
    /// the key first, in which case the resident value wins. A block
    /// evicted concurrently is simply fetched again.
    pub async fn get_or_fetch(&self, block: BlockId) -> Result<Bytes> {
        let mut parts: Vec<Option<Bytes>> = CacheKey::of(block).map(|k| self.get(&k)).collect();
        let misses = parts.iter().filter(|p| p.is_none()).count() as u64;
        self.stats
            .hits
            .fetch_add(parts.len() as u64 - misses, Ordering::Relaxed);
        self.stats.misses.fetch_add(misses, Ordering::Relaxed);

        if misses == 0 && parts.len() == 1 {
            return parts.pop().flatten().ok_or_else(|| Error::internal("empty cache read"));
        }

        // Fetch each run of consecutive misses with one device read
        let bs = self.block_size as usize;
        let mut i = 0usize;
        while i < parts.len() {
            if parts[i].is_some() {
                i += 1;
                continue;
            }
            let run_start = i;
            while i < parts.len() && parts[i].is_none() {
                i += 1;
            }
            let run = block.slice(run_start as u32, (i - run_start) as u32);
            let data = self.devices.read(run).await?;
            for (j, key) in CacheKey::of(run).enumerate() {
                let blk = data.slice(j * bs..(j + 1) * bs);
                parts[run_start + j] = Some(self.insert_clean(key, blk));
            }
        }

        let mut out = BytesMut::with_capacity(block.byte_len(self.block_size));
        for part in parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        Ok(out.freeze())
    }

    /// Insert a fetched block; returns the value now authoritative for it
    fn insert_clean(&self, key: CacheKey, data: Bytes) -> Bytes {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        if !self.reserve(self.bs()) {
            // Full of dirty or pinned data; serve uncached
            return data;
        }
        let clock = self.tick();
        match self.entries.entry(key) {
            Entry::Occupied(e) => {
                let raced = e.get().data.clone();
                // Shard lock released before touching the accounting lock
                drop(e);
                self.unreserve(self.bs());
                raced
            }
            Entry::Vacant(v) => {
                v.insert(CacheEntry::clean(data.clone(), clock));
                self.enqueue(vec![(clock, key)]);
                data
            }
        }
    }

    /// Insert or overwrite the blocks of `block` as dirty for `epoch`
    ///
    /// The entries stay pinned for `epoch` until [`Self::unpin_epoch`]
    /// releases it. Fails with `CacheFull`, inserting nothing, when the new
    /// entries do not fit even after an eviction pass.
    pub fn put_dirty(&self, block: BlockId, data: &Bytes, epoch: Epoch) -> Result<()> {
        let bs = self.block_size as usize;
        if data.len() != block.byte_len(self.block_size) {
            return Err(Error::InvalidBlock(format!(
                "{} bytes for {block}",
                data.len()
            )));
        }

        let vacant = CacheKey::of(block)
            .filter(|k| !self.entries.contains_key(k))
            .count() as u64;
        let needed = vacant * self.bs();
        if needed > 0 && !self.reserve(needed) {
            return Err(Error::CacheFull {
                needed,
                capacity: self.capacity,
            });
        }

        let mut reserved = needed;
        let clock = self.tick();
        for (i, key) in CacheKey::of(block).enumerate() {
            let blk = data.slice(i * bs..(i + 1) * bs);
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            match self.entries.entry(key) {
                Entry::Occupied(mut e) => {
                    let entry = e.get_mut();
                    if !entry.dirty {
                        self.dirty_bytes.fetch_add(self.bs(), Ordering::Relaxed);
                    }
                    entry.data = blk;
                    entry.dirty = true;
                    entry.dirty_epoch = epoch;
                    entry.epoch_pin = entry.epoch_pin.max(Some(epoch));
                    entry.generation = generation;
                    entry.touch(clock);
                }
                Entry::Vacant(v) => {
                    if reserved < self.bs() {
                        // A counted entry was evicted meanwhile. Unwind so no
                        // partial block range stays dirty.
                        drop(v);
                        self.invalidate(block.slice(0, i as u32));
                        return Err(Error::CacheFull {
                            needed: self.bs(),
                            capacity: self.capacity,
                        });
                    }
                    reserved -= self.bs();
                    v.insert(CacheEntry {
                        data: blk,
                        last_access: AtomicU64::new(clock),
                        dirty: true,
                        dirty_epoch: epoch,
                        epoch_pin: Some(epoch),
                        pins: 0,
                        generation,
                    });
                    self.dirty_bytes.fetch_add(self.bs(), Ordering::Relaxed);
                }
            }
        }
        if reserved > 0 {
            self.unreserve(reserved);
        }
        Ok(())
    }

    /// Pin the resident blocks of `block` against eviction
    pub fn pin(&self, block: BlockId) -> PinGuard<'_> {
        let keys = CacheKey::of(block)
            .filter(|k| {
                self.entries.get_mut(k).is_some_and(|mut e| {
                    e.pins += 1;
                    true
                })
            })
            .collect();
        PinGuard { cache: self, keys }
    }

    fn unpin_keys(&self, keys: &[CacheKey]) {
        let mut freed = Vec::new();
        for key in keys {
            if let Some(mut e) = self.entries.get_mut(key) {
                debug_assert!(e.pins > 0, "unpin of unpinned {key:?}");
                e.pins = e.pins.saturating_sub(1);
                if e.is_evictable() {
                    freed.push((e.last_access.load(Ordering::Relaxed), *key));
                }
            }
        }
        self.enqueue(freed);
    }

    /// Write dirty entries whose epoch satisfies `pred` to their devices
    ///
    /// Contiguous blocks are coalesced into one request. An entry is only
    /// marked clean once its write is acknowledged, and only if no newer
    /// write re-dirtied it meanwhile. Epoch pins are left in place. The
    /// flushed entries are pinned for the duration and unpinned even if
    /// the future is dropped part way.
    pub async fn flush_dirty<F>(&self, pred: F) -> Result<FlushStats>
    where
        F: Fn(Epoch) -> bool + Send + Sync,
    {
        let mut dirty: Vec<DirtyBlock> = Vec::new();
        for mut e in self.entries.iter_mut() {
            if e.dirty && pred(e.dirty_epoch) {
                e.pins += 1;
                dirty.push((*e.key(), e.data.clone(), e.generation));
            }
        }
        let pinned = PinGuard {
            cache: self,
            keys: dirty.iter().map(|(k, _, _)| *k).collect(),
        };
        if pinned.is_empty() {
            return Ok(FlushStats::default());
        }
        dirty.sort_unstable_by_key(|(k, _, _)| *k);
        let blocks = dirty.len() as u64;

        let mut runs: Vec<Vec<DirtyBlock>> = Vec::new();
        for item in dirty {
            let follows = runs.last().is_some_and(|run| {
                run.len() < MAX_FLUSH_RUN
                    && run.last().is_some_and(|(prev, _, _)| {
                        prev.region == item.0.region && prev.blkno + 1 == item.0.blkno
                    })
            });
            if follows {
                let last = runs.len() - 1;
                runs[last].push(item);
            } else {
                runs.push(vec![item]);
            }
        }

        let requests = runs.len() as u64;
        let results: Vec<Result<()>> = futures::stream::iter(runs)
            .map(|run| self.write_run(run))
            .buffer_unordered(FLUSH_CONCURRENCY)
            .collect()
            .await;
        drop(pinned);

        for result in results {
            result?;
        }

        self.stats.writebacks.fetch_add(blocks, Ordering::Relaxed);
        debug!("flushed {} dirty blocks in {} requests", blocks, requests);
        Ok(FlushStats { blocks, requests })
    }

    /// Write one contiguous run and mark its entries clean
    async fn write_run(&self, run: Vec<DirtyBlock>) -> Result<()> {
        let Some(&(first, _, _)) = run.first() else {
            return Ok(());
        };
        let data = if let [(_, blk, _)] = run.as_slice() {
            blk.clone()
        } else {
            let mut buf = BytesMut::with_capacity(run.len() * self.block_size as usize);
            for (_, blk, _) in &run {
                buf.extend_from_slice(blk);
            }
            buf.freeze()
        };
        self.devices.write(first.region, first.blkno, data).await?;
        for (key, _, generation) in &run {
            if let Some(mut e) = self.entries.get_mut(key)
                && e.dirty
                && e.generation == *generation
            {
                e.dirty = false;
                self.dirty_bytes.fetch_sub(self.bs(), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Drop epoch pins held for epochs at or before `committed`
    ///
    /// Returns the number of entries released. Entries that are dirty
    /// again keep their pin.
    pub fn unpin_epoch(&self, committed: Epoch) -> usize {
        let mut freed = Vec::new();
        let mut released = 0;
        for mut e in self.entries.iter_mut() {
            if !e.dirty && e.epoch_pin.is_some_and(|p| p <= committed) {
                e.epoch_pin = None;
                released += 1;
                if e.is_evictable() {
                    freed.push((e.last_access.load(Ordering::Relaxed), *e.key()));
                }
            }
        }
        self.enqueue(freed);
        released
    }

    /// Remove the entries of `block` regardless of state
    ///
    /// Returns the number of dirty blocks dropped without being written.
    pub fn invalidate(&self, block: BlockId) -> usize {
        let mut removed = Vec::new();
        let mut dropped_dirty = 0usize;
        for key in CacheKey::of(block) {
            if let Some((_, e)) = self.entries.remove(&key) {
                removed.push((e.last_access.load(Ordering::Relaxed), key));
                if e.dirty {
                    dropped_dirty += 1;
                    self.dirty_bytes.fetch_sub(self.bs(), Ordering::Relaxed);
                }
            }
        }
        if !removed.is_empty() {
            let mut res = self.resident.lock();
            res.bytes = res.bytes.saturating_sub(removed.len() as u64 * self.bs());
            for stamp in &removed {
                res.lru.remove(stamp);
            }
        }
        if dropped_dirty > 0 {
            warn!("invalidated {} dirty blocks of {}", dropped_dirty, block);
        }
        dropped_dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemDevice};
    use std::time::Duration;

    const BS: u32 = 512;

    fn setup(capacity_blocks: u64) -> (Arc<MemDevice>, BlockCache) {
        let dev = Arc::new(MemDevice::new(BS, 64));
        let set = DeviceSet::from_devices(BS, [dev.clone() as Arc<dyn BlockDevice>]).unwrap();
        let cache = BlockCache::new(Arc::new(set), capacity_blocks * u64::from(BS));
        (dev, cache)
    }

    fn blk(offset: u64, nblks: u32) -> BlockId {
        BlockId::new(RegionId(0), offset, nblks)
    }

    fn fill(nblks: u32, byte: u8) -> Bytes {
        Bytes::from(vec![byte; (nblks * BS) as usize])
    }

    fn key(blkno: u64) -> CacheKey {
        CacheKey::new(RegionId(0), blkno)
    }

    #[tokio::test]
    async fn test_fetch_populates_clean_entries() {
        let (dev, cache) = setup(8);
        dev.submit_write(2, fill(2, 9)).await.unwrap();

        let data = cache.get_or_fetch(blk(2, 2)).await.unwrap();
        assert_eq!(data, fill(2, 9));
        assert_eq!(dev.read_count(), 2);
        assert!(cache.contains(&key(2)) && !cache.is_dirty(&key(2)));

        let again = cache.get_or_fetch(blk(2, 2)).await.unwrap();
        assert_eq!(again, data);
        assert_eq!(dev.read_count(), 2);
        assert!((cache.stats().hit_ratio() - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_dirty_entries_flush_then_clean() {
        let (dev, cache) = setup(8);
        cache.put_dirty(blk(0, 3), &fill(3, 1), Epoch::new(1)).unwrap();
        assert_eq!(cache.dirty_bytes(), 3 * u64::from(BS));
        assert_eq!(dev.write_count(), 0);

        let stats = cache.flush_dirty(|e| e <= Epoch::new(1)).await.unwrap();
        assert_eq!(stats, FlushStats { blocks: 3, requests: 1 });
        assert_eq!(cache.dirty_bytes(), 0);
        assert_eq!(dev.submit_read(0, 3).await.unwrap(), fill(3, 1));
    }

    #[tokio::test]
    async fn test_flush_respects_epoch_predicate() {
        let (dev, cache) = setup(8);
        cache.put_dirty(blk(0, 1), &fill(1, 1), Epoch::new(1)).unwrap();
        cache.put_dirty(blk(1, 1), &fill(1, 2), Epoch::new(2)).unwrap();

        cache.flush_dirty(|e| e <= Epoch::new(1)).await.unwrap();
        assert!(!cache.is_dirty(&key(0)));
        assert!(cache.is_dirty(&key(1)));
        assert_eq!(dev.write_count(), 1);
    }

    #[tokio::test]
    async fn test_dirty_and_epoch_pinned_entries_not_evicted() {
        let (_dev, cache) = setup(2);
        cache.put_dirty(blk(0, 2), &fill(2, 1), Epoch::new(1)).unwrap();

        let err = cache.put_dirty(blk(2, 1), &fill(1, 2), Epoch::new(1)).unwrap_err();
        assert!(matches!(err, Error::CacheFull { .. }));

        // Clean but still held for epoch 1
        cache.flush_dirty(|_| true).await.unwrap();
        assert!(cache.put_dirty(blk(2, 1), &fill(1, 2), Epoch::new(1)).is_err());

        assert_eq!(cache.unpin_epoch(Epoch::new(1)), 2);
        cache.put_dirty(blk(2, 1), &fill(1, 2), Epoch::new(2)).unwrap();
        assert!(cache.resident_bytes() <= cache.capacity());
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_pinned_entry_survives_eviction() {
        let (_dev, cache) = setup(2);
        let _ = cache.get_or_fetch(blk(0, 1)).await.unwrap();
        let _ = cache.get_or_fetch(blk(1, 1)).await.unwrap();

        let guard = cache.pin(blk(0, 1));
        assert_eq!(guard.len(), 1);
        assert_eq!(cache.pin_count(&key(0)), 1);

        // Block 0 is LRU but pinned, so block 1 goes
        let _ = cache.get_or_fetch(blk(5, 1)).await.unwrap();
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));

        drop(guard);
        assert_eq!(cache.pin_count(&key(0)), 0);
        let _ = cache.get_or_fetch(blk(6, 1)).await.unwrap();
        assert!(!cache.contains(&key(0)));
    }

    #[tokio::test]
    async fn test_full_cache_serves_fetch_uncached() {
        let (dev, cache) = setup(1);
        cache.put_dirty(blk(0, 1), &fill(1, 1), Epoch::new(1)).unwrap();
        dev.submit_write(3, fill(1, 3)).await.unwrap();

        assert_eq!(cache.get_or_fetch(blk(3, 1)).await.unwrap(), fill(1, 3));
        assert!(!cache.contains(&key(3)));
        assert_eq!(cache.resident_bytes(), u64::from(BS));
    }

    #[tokio::test]
    async fn test_rewrite_during_flush_stays_dirty() {
        let (_dev, cache) = setup(4);
        cache.put_dirty(blk(0, 1), &fill(1, 1), Epoch::new(1)).unwrap();
        cache.put_dirty(blk(0, 1), &fill(1, 2), Epoch::new(2)).unwrap();
        assert_eq!(cache.dirty_bytes(), u64::from(BS));

        // Entry now belongs to epoch 2, so an epoch-1 flush skips it
        let stats = cache.flush_dirty(|e| e <= Epoch::new(1)).await.unwrap();
        assert_eq!(stats.blocks, 0);
        assert!(cache.is_dirty(&key(0)));
    }

    #[tokio::test]
    async fn test_flush_error_keeps_entries_dirty() {
        let (dev, cache) = setup(4);
        cache.put_dirty(blk(0, 2), &fill(2, 1), Epoch::new(1)).unwrap();
        dev.fail_writes(true);

        let err = cache.flush_dirty(|_| true).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(cache.is_dirty(&key(0)));
        assert_eq!(cache.pin_count(&key(0)), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_runs_on_spawned_task() {
        let (dev, cache) = setup(8);
        let cache = Arc::new(cache);
        cache.put_dirty(blk(0, 2), &fill(2, 3), Epoch::new(1)).unwrap();
        cache.put_dirty(blk(5, 1), &fill(1, 4), Epoch::new(1)).unwrap();

        let bg = Arc::clone(&cache);
        let stats = tokio::spawn(async move { bg.flush_dirty(|_| true).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, FlushStats { blocks: 3, requests: 2 });
        assert_eq!(dev.submit_read(5, 1).await.unwrap(), fill(1, 4));
        assert_eq!(cache.dirty_bytes(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_flush_releases_pins() {
        let dev = Arc::new(MemDevice::new(BS, 64).with_latency(Duration::from_millis(200)));
        let set = DeviceSet::from_devices(BS, [dev as Arc<dyn BlockDevice>]).unwrap();
        let cache = BlockCache::new(Arc::new(set), 4 * u64::from(BS));
        cache.put_dirty(blk(0, 2), &fill(2, 1), Epoch::new(1)).unwrap();

        let flush = tokio::time::timeout(Duration::from_millis(10), cache.flush_dirty(|_| true));
        assert!(flush.await.is_err());
        assert_eq!(cache.pin_count(&key(0)), 0);
        assert_eq!(cache.pin_count(&key(1)), 0);
        assert!(cache.is_dirty(&key(0)));

        // Once written back and committed the entries can go again
        cache.flush_dirty(|_| true).await.unwrap();
        cache.unpin_epoch(Epoch::new(1));
        cache.put_dirty(blk(2, 4), &fill(4, 2), Epoch::new(2)).unwrap();
        assert!(!cache.contains(&key(0)));
    }

    #[tokio::test]
    async fn test_eviction_follows_access_order() {
        let (_dev, cache) = setup(2);
        cache.get_or_fetch(blk(0, 1)).await.unwrap();
        cache.get_or_fetch(blk(1, 1)).await.unwrap();

        // A hit makes block 0 the most recent
        assert!(cache.get(&key(0)).is_some());
        cache.get_or_fetch(blk(2, 1)).await.unwrap();
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));

        cache.get_or_fetch(blk(3, 1)).await.unwrap();
        assert!(!cache.contains(&key(0)));
        assert!(cache.contains(&key(2)) && cache.contains(&key(3)));
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_racing_eviction_returns_device_data() {
        let (dev, cache) = setup(2);
        for blkno in 0..16u64 {
            dev.submit_write(blkno, fill(1, blkno as u8 + 1)).await.unwrap();
        }
        let cache = Arc::new(cache);

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..500 {
                    assert_eq!(cache.get_or_fetch(blk(3, 1)).await.unwrap(), fill(1, 4));
                }
            })
        };
        let evictor = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for i in 0..500u64 {
                    let blkno = 4 + i % 12;
                    let data = cache.get_or_fetch(blk(blkno, 1)).await.unwrap();
                    assert_eq!(data, fill(1, blkno as u8 + 1));
                    cache.evict();
                    assert!(cache.resident_bytes() <= cache.capacity());
                }
            })
        };
        reader.await.unwrap();
        evictor.await.unwrap();

        assert!(cache.resident_bytes() <= cache.capacity());
        assert!(cache.stats().evictions.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_invalidate_releases_accounting() {
        let (_dev, cache) = setup(4);
        cache.put_dirty(blk(0, 2), &fill(2, 1), Epoch::new(1)).unwrap();
        assert_eq!(cache.invalidate(blk(0, 2)), 2);
        assert_eq!(cache.resident_bytes(), 0);
        assert_eq!(cache.dirty_bytes(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_dirty_rejects_wrong_length() {
        let (_dev, cache) = setup(4);
        let err = cache.put_dirty(blk(0, 2), &fill(1, 1), Epoch::new(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidBlock(_)));
    }
}

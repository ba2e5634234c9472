//! Block allocation
//!
//! This module provides:
//! - Extent arithmetic over block numbers within a region
//! - A bitmap tracking free/used blocks of one region
//! - The multi-region allocator with epoch-tagged pending frees
//!
//! Each region's bitmap sits behind its own mutex, and the critical
//! sections only touch bitmap metadata. Frees never go straight back to
//! the bitmap: they are parked under the epoch that superseded the block
//! and released by [`BlockAllocator::reclaim`] once that epoch commits.

use lsvol_common::{BlockId, Epoch, Error, RegionId, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// A contiguous range of blocks within one region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Starting block number
    pub start: u64,
    /// Number of blocks in the extent
    pub length: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Ending block number (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Try to merge with an adjacent extent
    #[must_use]
    pub const fn try_merge(&self, other: &Self) -> Option<Self> {
        if self.end() == other.start {
            Some(Self::new(self.start, self.length + other.length))
        } else if other.end() == self.start {
            Some(Self::new(other.start, self.length + other.length))
        } else {
            None
        }
    }
}

/// Bitmap for tracking block allocation in one region
///
/// One bit per block: 0 = free, 1 = used. Not internally synchronized;
/// the allocator owns one per region behind a mutex.
pub struct BlockBitmap {
    data: Vec<u8>,
    total_blocks: u64,
    free_blocks: u64,
    /// Where the next-fit search resumes
    search_hint: u64,
}

impl BlockBitmap {
    /// Create a bitmap with every block free
    #[must_use]
    pub fn new(total_blocks: u64) -> Self {
        Self {
            data: vec![0u8; total_blocks.div_ceil(8) as usize],
            total_blocks,
            free_blocks: total_blocks,
            search_hint: 0,
        }
    }

    fn is_set(&self, block: u64) -> bool {
        self.data[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    fn set(&mut self, block: u64) {
        self.data[(block / 8) as usize] |= 1 << (block % 8);
    }

    fn clear(&mut self, block: u64) {
        self.data[(block / 8) as usize] &= !(1 << (block % 8));
    }

    /// Check if a block is used; out-of-range blocks count as used
    #[must_use]
    pub fn is_allocated(&self, block: u64) -> bool {
        block >= self.total_blocks || self.is_set(block)
    }

    /// Check if every block of an extent is used
    #[must_use]
    pub fn is_extent_allocated(&self, extent: &Extent) -> bool {
        extent.end() <= self.total_blocks && (extent.start..extent.end()).all(|b| self.is_set(b))
    }

    /// Check if every block of an extent is free
    #[must_use]
    pub fn is_extent_free(&self, extent: &Extent) -> bool {
        extent.end() <= self.total_blocks && (extent.start..extent.end()).all(|b| !self.is_set(b))
    }

    /// Allocate a contiguous extent with next-fit from the search hint
    pub fn allocate_extent(&mut self, count: u64) -> Option<Extent> {
        if count == 0 || count > self.free_blocks {
            return None;
        }
        let hint = self.search_hint;

        // Search from hint to end, then wrap around to the start
        let extent = self
            .find_free_extent_in_range(hint, self.total_blocks, count)
            .or_else(|| {
                (hint > 0)
                    .then(|| self.find_free_extent_in_range(0, (hint + count).min(self.total_blocks), count))
                    .flatten()
            })?;

        self.mark_used(&extent);
        Some(extent)
    }

    /// Allocate exactly `extent`, which must be entirely free
    pub fn allocate_at(&mut self, extent: &Extent) -> bool {
        if !self.is_extent_free(extent) {
            return false;
        }
        self.mark_used(extent);
        true
    }

    fn find_free_extent_in_range(&self, start: u64, end: u64, count: u64) -> Option<Extent> {
        let mut run_start = start;
        let mut run_len = 0u64;

        for block in start..end.min(self.total_blocks) {
            if self.is_set(block) {
                run_start = block + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= count {
                    return Some(Extent::new(run_start, count));
                }
            }
        }

        None
    }

    fn mark_used(&mut self, extent: &Extent) {
        for block in extent.start..extent.end() {
            self.set(block);
        }
        self.free_blocks -= extent.length;
        self.search_hint = extent.end() % self.total_blocks.max(1);
    }

    /// Return an extent to the free set
    ///
    /// Returns `false` without touching the bitmap if any block of the
    /// extent is out of range or not currently used.
    pub fn free_extent(&mut self, extent: &Extent) -> bool {
        if !self.is_extent_allocated(extent) {
            return false;
        }
        for block in extent.start..extent.end() {
            self.clear(block);
        }
        self.free_blocks += extent.length;
        if extent.start < self.search_hint {
            self.search_hint = extent.start;
        }
        true
    }

    /// All maximal runs of free blocks, in block order
    #[must_use]
    pub fn free_runs(&self) -> Vec<Extent> {
        let mut runs = Vec::new();
        let mut current: Option<Extent> = None;
        for block in 0..self.total_blocks {
            if self.is_set(block) {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
            } else {
                current = match current {
                    Some(run) => run.try_merge(&Extent::new(block, 1)),
                    None => Some(Extent::new(block, 1)),
                };
            }
        }
        runs.extend(current);
        runs
    }

    /// Smallest free run that can hold `count` blocks
    #[must_use]
    pub fn best_fit(&self, count: u64) -> Option<Extent> {
        self.free_runs()
            .into_iter()
            .filter(|run| run.length >= count)
            .min_by_key(|run| run.length)
    }

    #[must_use]
    pub const fn free_count(&self) -> u64 {
        self.free_blocks
    }

    #[must_use]
    pub const fn total_count(&self) -> u64 {
        self.total_blocks
    }
}

/// Placement hints for an allocation
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocHints {
    /// Region to try first; round-robin when unset
    pub preferred_region: Option<RegionId>,
}

struct Region {
    id: RegionId,
    bitmap: Mutex<BlockBitmap>,
}

/// Allocator over a set of regions
pub struct BlockAllocator {
    regions: Vec<Region>,
    /// Frees waiting for their superseding epoch to commit
    pending: Mutex<BTreeMap<Epoch, Vec<BlockId>>>,
    pending_blocks: AtomicU64,
    /// Round-robin cursor for unhinted allocations
    next_region: AtomicUsize,
    allow_split: bool,
}

impl BlockAllocator {
    /// Create an allocator with every block of every region free
    #[must_use]
    pub fn new(regions: &[(RegionId, u64)], allow_split: bool) -> Self {
        Self {
            regions: regions
                .iter()
                .map(|&(id, blocks)| Region {
                    id,
                    bitmap: Mutex::new(BlockBitmap::new(blocks)),
                })
                .collect(),
            pending: Mutex::new(BTreeMap::new()),
            pending_blocks: AtomicU64::new(0),
            next_region: AtomicUsize::new(0),
            allow_split,
        }
    }

    fn region(&self, id: RegionId) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.id == id)
            .ok_or(Error::RegionNotFound(id))
    }

    fn region_order(&self, hints: AllocHints) -> Vec<usize> {
        let n = self.regions.len();
        let first = hints
            .preferred_region
            .and_then(|id| self.regions.iter().position(|r| r.id == id))
            .unwrap_or_else(|| self.next_region.fetch_add(1, Ordering::Relaxed) % n.max(1));
        (0..n).map(|i| (first + i) % n).collect()
    }

    fn out_of_space(&self, requested: u64) -> Error {
        Error::OutOfSpace {
            requested,
            available: self.free_blocks(),
        }
    }

    /// Allocate one contiguous range of `nblks` blocks
    ///
    /// Next-fit within the preferred region, then best-fit over the free
    /// runs of every region.
    pub fn allocate(&self, nblks: u32, hints: AllocHints) -> Result<BlockId> {
        if nblks == 0 {
            return Err(Error::InvalidBlock("zero-length allocation".into()));
        }
        let count = u64::from(nblks);
        let order = self.region_order(hints);

        if let Some(&first) = order.first() {
            let region = &self.regions[first];
            if let Some(extent) = region.bitmap.lock().allocate_extent(count) {
                return Ok(BlockId::new(region.id, extent.start, nblks));
            }
        }

        // Best fit across all regions. The winning run is re-checked under
        // its region lock since it may have been taken in between.
        for _ in 0..order.len().max(1) {
            let best = self
                .regions
                .iter()
                .filter_map(|r| r.bitmap.lock().best_fit(count).map(|run| (r, run)))
                .min_by_key(|(_, run)| run.length);
            let Some((region, run)) = best else {
                break;
            };
            let extent = Extent::new(run.start, count);
            if region.bitmap.lock().allocate_at(&extent) {
                return Ok(BlockId::new(region.id, extent.start, nblks));
            }
        }

        Err(self.out_of_space(count))
    }

    /// Allocate `nblks` blocks, split over several ranges if allowed
    ///
    /// A contiguous range is always tried first. Splitting takes the
    /// largest free runs first and rolls back if the total cannot be met.
    pub fn allocate_extents(&self, nblks: u32, hints: AllocHints) -> Result<Vec<BlockId>> {
        match self.allocate(nblks, hints) {
            Ok(block) => return Ok(vec![block]),
            Err(Error::OutOfSpace { .. }) if self.allow_split => {}
            Err(e) => return Err(e),
        }

        let mut remaining = u64::from(nblks);
        if self.free_blocks() < remaining {
            return Err(self.out_of_space(remaining));
        }

        let mut taken = Vec::new();
        'regions: for idx in self.region_order(hints) {
            let region = &self.regions[idx];
            let mut bitmap = region.bitmap.lock();
            let mut runs = bitmap.free_runs();
            runs.sort_by_key(|run| std::cmp::Reverse(run.length));
            for run in runs {
                let len = run.length.min(remaining).min(u64::from(u32::MAX));
                let extent = Extent::new(run.start, len);
                if bitmap.allocate_at(&extent) {
                    taken.push(BlockId::new(region.id, extent.start, len as u32));
                    remaining -= len;
                    if remaining == 0 {
                        break 'regions;
                    }
                }
            }
        }

        if remaining > 0 {
            for block in taken {
                self.release(block);
            }
            return Err(self.out_of_space(u64::from(nblks)));
        }

        debug!("split allocation of {} blocks into {} ranges", nblks, taken.len());
        Ok(taken)
    }

    /// Park a superseded range until `epoch` commits
    ///
    /// # Panics
    /// Panics if any block of the range is not currently allocated.
    pub fn free(&self, block: BlockId, epoch: Epoch) {
        let allocated = self
            .region(block.region)
            .map(|r| {
                r.bitmap
                    .lock()
                    .is_extent_allocated(&Extent::new(block.offset, u64::from(block.nblks)))
            })
            .unwrap_or(false);
        assert!(allocated, "free of unallocated range {block} in epoch {epoch}");

        self.pending.lock().entry(epoch).or_default().push(block);
        self.pending_blocks
            .fetch_add(u64::from(block.nblks), Ordering::Relaxed);
    }

    /// Return a never-published range to the free set immediately
    ///
    /// Only valid for blocks no mapping has ever pointed at, such as the
    /// target of a write that failed.
    ///
    /// # Panics
    /// Panics if any block of the range is not currently allocated.
    pub fn release(&self, block: BlockId) {
        let freed = self
            .region(block.region)
            .map(|r| {
                r.bitmap
                    .lock()
                    .free_extent(&Extent::new(block.offset, u64::from(block.nblks)))
            })
            .unwrap_or(false);
        assert!(freed, "release of unallocated range {block}");
    }

    /// Release every pending free tagged with an epoch at or before
    /// `committed`; returns the number of blocks reclaimed
    ///
    /// # Panics
    /// Panics if a pending range was released twice.
    pub fn reclaim(&self, committed: Epoch) -> u64 {
        let ready = {
            let mut pending = self.pending.lock();
            let later = pending.split_off(&committed.next());
            std::mem::replace(&mut *pending, later)
        };

        let mut reclaimed = 0u64;
        for block in ready.into_values().flatten() {
            self.release(block);
            reclaimed += u64::from(block.nblks);
        }
        self.pending_blocks.fetch_sub(reclaimed, Ordering::Relaxed);

        if reclaimed > 0 {
            debug!("reclaimed {} blocks through epoch {}", reclaimed, committed);
        }
        reclaimed
    }

    /// Mark a range used while rebuilding state from the metadata log
    pub fn mark_allocated(&self, block: BlockId) -> Result<()> {
        let region = self.region(block.region)?;
        let extent = Extent::new(block.offset, u64::from(block.nblks));
        if region.bitmap.lock().allocate_at(&extent) {
            Ok(())
        } else {
            Err(Error::InvalidBlock(format!(
                "{block} is out of range or already allocated"
            )))
        }
    }

    /// Check if every block of a range is allocated
    #[must_use]
    pub fn is_allocated(&self, block: BlockId) -> bool {
        self.region(block.region).is_ok_and(|r| {
            r.bitmap
                .lock()
                .is_extent_allocated(&Extent::new(block.offset, u64::from(block.nblks)))
        })
    }

    /// Free blocks across all regions, excluding pending frees
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.regions.iter().map(|r| r.bitmap.lock().free_count()).sum()
    }

    /// Blocks waiting for their epoch to commit
    #[must_use]
    pub fn pending_free_blocks(&self) -> u64 {
        self.pending_blocks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.regions.iter().map(|r| r.bitmap.lock().total_count()).sum()
    }

    /// Region ids in construction order
    #[must_use]
    pub fn regions(&self) -> Vec<RegionId> {
        self.regions.iter().map(|r| r.id).collect()
    }
}

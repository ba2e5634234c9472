//! Core type definitions for lsvol
//!
//! This module defines the fundamental identifiers used throughout the
//! engine: physical regions, block ranges, logical block ranges and
//! checkpoint epochs.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a physical region (one region per device)
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("r{_0}")]
pub struct RegionId(pub u32);

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionId({})", self.0)
    }
}

/// Checkpoint epoch number
///
/// Epochs increase monotonically; epoch 0 is the implicit "nothing
/// committed yet" epoch and is never opened for writes.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct Epoch(u64);

impl Epoch {
    /// The epoch before any checkpoint has committed
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The epoch that follows this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Identifies a contiguous range of physical blocks
///
/// Immutable once issued by the allocator. Compared by value and used as
/// the key for mapping entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    /// Region (device) the blocks live on
    pub region: RegionId,
    /// First block number within the region
    pub offset: u64,
    /// Number of blocks
    pub nblks: u32,
}

impl BlockId {
    #[must_use]
    pub const fn new(region: RegionId, offset: u64, nblks: u32) -> Self {
        Self {
            region,
            offset,
            nblks,
        }
    }

    /// One past the last block number
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.nblks as u64
    }

    /// Check if this range contains a block number
    #[must_use]
    pub const fn contains(&self, blkno: u64) -> bool {
        blkno >= self.offset && blkno < self.end()
    }

    /// Check if two ranges share any block
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.region == other.region && self.offset < other.end() && other.offset < self.end()
    }

    /// Sub-range starting `skip` blocks in, `nblks` long
    ///
    /// # Panics
    /// Panics if the sub-range does not lie within this range.
    #[must_use]
    pub fn slice(&self, skip: u32, nblks: u32) -> Self {
        assert!(
            skip + nblks <= self.nblks,
            "slice {skip}+{nblks} outside of {self}"
        );
        Self::new(self.region, self.offset + u64::from(skip), nblks)
    }

    /// Byte offset of the first block on its device
    #[must_use]
    pub const fn byte_offset(&self, block_size: u32) -> u64 {
        self.offset * block_size as u64
    }

    /// Length of the range in bytes
    #[must_use]
    pub const fn byte_len(&self, block_size: u32) -> usize {
        self.nblks as usize * block_size as usize
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.region, self.offset, self.nblks)
    }
}

/// A range of logical block addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LbaRange {
    /// First LBA
    pub lba: u64,
    /// Number of blocks
    pub nblks: u32,
}

impl LbaRange {
    #[must_use]
    pub const fn new(lba: u64, nblks: u32) -> Self {
        Self { lba, nblks }
    }

    /// One past the last LBA
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.lba + self.nblks as u64
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nblks == 0
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.lba < other.end() && other.lba < self.end()
    }

    /// Intersection of two ranges, if any
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = self.lba.max(other.lba);
        let end = self.end().min(other.end());
        (start < end).then(|| Self::new(start, (end - start) as u32))
    }
}

impl fmt::Display for LbaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lba, self.end())
    }
}

/// Direction of a volume I/O request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoDirection {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_slice_and_bounds() {
        let b = BlockId::new(RegionId(2), 100, 10);
        assert_eq!(b.end(), 110);
        assert!(b.contains(100));
        assert!(b.contains(109));
        assert!(!b.contains(110));

        let s = b.slice(4, 3);
        assert_eq!(s, BlockId::new(RegionId(2), 104, 3));
        assert_eq!(s.byte_offset(4096), 104 * 4096);
        assert_eq!(s.byte_len(4096), 3 * 4096);
    }

    #[test]
    #[should_panic]
    fn test_block_id_slice_out_of_range() {
        let b = BlockId::new(RegionId(0), 0, 4);
        let _ = b.slice(2, 3);
    }

    #[test]
    fn test_block_id_overlap_requires_same_region() {
        let a = BlockId::new(RegionId(0), 0, 8);
        let b = BlockId::new(RegionId(0), 7, 2);
        let c = BlockId::new(RegionId(1), 0, 8);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_lba_range_intersect() {
        let a = LbaRange::new(0, 100);
        let b = LbaRange::new(50, 100);
        assert_eq!(a.intersect(&b), Some(LbaRange::new(50, 50)));
        assert_eq!(a.intersect(&LbaRange::new(100, 5)), None);
        assert!(!a.overlaps(&LbaRange::new(100, 5)));
    }

    #[test]
    fn test_epoch_ordering() {
        let e = Epoch::new(7);
        assert_eq!(e.next(), Epoch::new(8));
        assert!(Epoch::ZERO < e);
        assert_eq!(e.to_string(), "7");
    }

    #[test]
    fn test_display() {
        let b = BlockId::new(RegionId(3), 12, 4);
        assert_eq!(b.to_string(), "r3:12+4");
    }
}

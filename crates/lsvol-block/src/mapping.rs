//! LBA mapping index
//!
//! Ordered map from logical block address to the physical range holding
//! its data. Entries never overlap; LBAs with no entry are unwritten.
//!
//! The map is copy-on-write. Entries are grouped into shards by the
//! high bits of their start LBA, and the shard table is published through
//! an [`ArcSwap`]. Readers load the current table without locking. A
//! writer clones the table, copies only the shards it touches and stores
//! the result in one swap, so a concurrent lookup sees either the whole
//! old or the whole new mapping for any sub-range. Writers are serialized
//! by a mutex.
//!
//! Physical blocks cut out of older entries are handed to the allocator as
//! pending frees for the updating epoch, and every change is journaled for
//! the next checkpoint.

use crate::record::{EpochJournal, MetaRecord};
use arc_swap::ArcSwap;
use lsvol_common::{BlockId, Epoch, LbaRange};
use lsvol_storage::BlockAllocator;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Entries fetched per table load during a scan
const SCAN_BATCH: usize = 64;

/// log2 of the LBA span covered by one shard
const SHARD_SHIFT: u32 = 12;

type Shard = BTreeMap<u64, MapEntry>;

/// Shards keyed by `lba >> SHARD_SHIFT`; empty shards are dropped
type ShardTable = BTreeMap<u64, Arc<Shard>>;

const fn shard_of(lba: u64) -> u64 {
    lba >> SHARD_SHIFT
}

/// One mapped LBA range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub lba: u64,
    pub nblks: u32,
    pub block: BlockId,
    /// Epoch that last wrote this range
    pub epoch: Epoch,
}

impl MapEntry {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.lba + self.nblks as u64
    }

    #[must_use]
    pub const fn range(&self) -> LbaRange {
        LbaRange::new(self.lba, self.nblks)
    }

    /// The part of this entry inside `window`, with its block range trimmed
    #[must_use]
    pub fn clip(&self, window: LbaRange) -> Option<Self> {
        self.clip_span(window.lba, window.end())
    }

    /// The part of this entry inside `[start, end)`
    fn clip_span(&self, start: u64, end: u64) -> Option<Self> {
        let lo = self.lba.max(start);
        let hi = self.end().min(end);
        if lo >= hi {
            return None;
        }
        let skip = u32::try_from(lo - self.lba).ok()?;
        let nblks = u32::try_from(hi - lo).ok()?;
        Some(Self {
            lba: lo,
            nblks,
            block: self.block.slice(skip, nblks),
            epoch: self.epoch,
        })
    }
}

/// Piece of a lookup result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Mapped { lba: u64, nblks: u32, block: BlockId },
    Unwritten { lba: u64, nblks: u32 },
}

impl Segment {
    #[must_use]
    pub const fn lba(&self) -> u64 {
        match self {
            Self::Mapped { lba, .. } | Self::Unwritten { lba, .. } => *lba,
        }
    }

    #[must_use]
    pub const fn nblks(&self) -> u32 {
        match self {
            Self::Mapped { nblks, .. } | Self::Unwritten { nblks, .. } => *nblks,
        }
    }
}

/// Entries overlapping `[start, end)` in LBA order, at most `limit`
fn overlapping(table: &ShardTable, start: u64, end: u64, limit: usize) -> Vec<MapEntry> {
    let mut out = Vec::new();
    if start >= end || limit == 0 {
        return out;
    }
    let first = shard_of(start);

    // Only the closest entry starting before `start` can reach into the
    // window; it lives in the first shard or the nearest one below it
    let before = table
        .range(..=first)
        .rev()
        .find_map(|(_, shard)| shard.range(..start).next_back());
    if let Some((_, e)) = before
        && e.end() > start
    {
        out.push(*e);
    }

    for (_, shard) in table.range(first..=shard_of(end - 1)) {
        let room = limit - out.len();
        if room == 0 {
            break;
        }
        out.extend(shard.range(start..end).map(|(_, e)| *e).take(room));
    }
    out
}

fn insert_entry(table: &mut ShardTable, entry: MapEntry) {
    Arc::make_mut(table.entry(shard_of(entry.lba)).or_default()).insert(entry.lba, entry);
}

fn remove_entry(table: &mut ShardTable, lba: u64) {
    let key = shard_of(lba);
    let Some(shard) = table.get_mut(&key) else {
        return;
    };
    let shard = Arc::make_mut(shard);
    shard.remove(&lba);
    if shard.is_empty() {
        table.remove(&key);
    }
}

/// The LBA to block index of a volume
pub struct MappingIndex {
    table: ArcSwap<ShardTable>,
    /// Serializes writers
    update: Mutex<()>,
    allocator: Arc<BlockAllocator>,
    journal: EpochJournal,
    mapped_blocks: AtomicU64,
}

impl MappingIndex {
    #[must_use]
    pub fn new(allocator: Arc<BlockAllocator>) -> Self {
        Self {
            table: ArcSwap::from_pointee(ShardTable::new()),
            update: Mutex::new(()),
            allocator,
            journal: EpochJournal::new(),
            mapped_blocks: AtomicU64::new(0),
        }
    }

    /// Apply `f` to a private copy of the table and publish it
    fn mutate<R>(&self, f: impl FnOnce(&mut ShardTable) -> R) -> R {
        let _writer = self.update.lock();
        let mut table = ShardTable::clone(&self.table.load());
        let out = f(&mut table);
        self.table.store(Arc::new(table));
        out
    }

    /// Resolve `[lba, lba + nblks)` into mapped and unwritten segments
    ///
    /// The segments cover the whole range in order.
    #[must_use]
    pub fn lookup(&self, lba: u64, nblks: u32) -> Vec<Segment> {
        let window = LbaRange::new(lba, nblks);
        let hits = overlapping(&self.table.load(), lba, window.end(), usize::MAX);

        let mut segments = Vec::with_capacity(hits.len() * 2 + 1);
        let mut cursor = lba;
        for hit in hits.iter().filter_map(|e| e.clip(window)) {
            if hit.lba > cursor {
                segments.push(Segment::Unwritten {
                    lba: cursor,
                    nblks: (hit.lba - cursor) as u32,
                });
            }
            segments.push(Segment::Mapped {
                lba: hit.lba,
                nblks: hit.nblks,
                block: hit.block,
            });
            cursor = hit.end();
        }
        if cursor < window.end() {
            segments.push(Segment::Unwritten {
                lba: cursor,
                nblks: (window.end() - cursor) as u32,
            });
        }
        segments
    }

    /// Cut `window` out of `table`, returning the excised block ranges
    fn splice_out(&self, table: &mut ShardTable, window: LbaRange) -> Vec<BlockId> {
        let mut excised = Vec::new();
        for old in overlapping(table, window.lba, window.end(), usize::MAX) {
            remove_entry(table, old.lba);
            let pieces = [
                old.clip_span(old.lba, window.lba),
                old.clip_span(window.end(), old.end()),
            ];
            for piece in pieces.into_iter().flatten() {
                insert_entry(table, piece);
            }
            if let Some(cut) = old.clip(window) {
                excised.push(cut.block);
            }
        }
        let cut: u64 = excised.iter().map(|b| u64::from(b.nblks)).sum();
        self.mapped_blocks.fetch_sub(cut, Ordering::Relaxed);
        excised
    }

    /// Point `range` at `block`, replacing whatever mapped it before
    ///
    /// Superseded block ranges become pending frees for `epoch`; they are
    /// returned for accounting.
    ///
    /// # Panics
    /// Panics if `range` and `block` differ in length.
    pub fn upsert(&self, range: LbaRange, block: BlockId, epoch: Epoch) -> Vec<BlockId> {
        assert_eq!(range.nblks, block.nblks, "mapping {range} to {block}");
        self.upsert_extents(range.lba, &[block], epoch)
    }

    /// Map consecutive LBAs from `lba` onto `blocks` in one splice
    ///
    /// A write satisfied by several extents becomes visible all at once.
    pub fn upsert_extents(&self, lba: u64, blocks: &[BlockId], epoch: Epoch) -> Vec<BlockId> {
        let nblks: u32 = blocks.iter().map(|b| b.nblks).sum();
        self.mutate(|table| {
            let excised = self.splice_out(table, LbaRange::new(lba, nblks));

            let mut pos = lba;
            for &block in blocks {
                insert_entry(
                    table,
                    MapEntry {
                        lba: pos,
                        nblks: block.nblks,
                        block,
                        epoch,
                    },
                );
                self.journal.push(MetaRecord::Alloc { epoch, block });
                self.journal.push(MetaRecord::Map {
                    epoch,
                    lba: pos,
                    nblks: block.nblks,
                    block,
                });
                pos += u64::from(block.nblks);
            }
            self.mapped_blocks
                .fetch_add(u64::from(nblks), Ordering::Relaxed);
            self.release(&excised, epoch);
            excised
        })
    }

    /// Remove every mapping inside `range`
    ///
    /// Returns the block ranges that became pending frees for `epoch`.
    pub fn remove_range(&self, range: LbaRange, epoch: Epoch) -> Vec<BlockId> {
        self.mutate(|table| {
            let excised = self.splice_out(table, range);
            if !excised.is_empty() {
                self.journal.push(MetaRecord::Unmap {
                    epoch,
                    lba: range.lba,
                    nblks: range.nblks,
                });
                self.release(&excised, epoch);
            }
            excised
        })
    }

    fn release(&self, excised: &[BlockId], epoch: Epoch) {
        for block in excised {
            self.allocator.free(*block, epoch);
        }
        self.journal
            .extend(excised.iter().map(|&block| MetaRecord::Free { epoch, block }));
    }

    /// Re-apply a committed record during recovery
    ///
    /// Only the map is touched: the allocator is rebuilt separately and
    /// nothing is journaled again.
    pub fn replay(&self, record: &MetaRecord) {
        self.replay_all([record]);
    }

    /// Re-apply a run of committed records in one table update
    ///
    /// Records other than `Map` and `Unmap` are skipped.
    pub fn replay_all<'a>(&self, records: impl IntoIterator<Item = &'a MetaRecord>) {
        self.mutate(|table| {
            for record in records {
                match *record {
                    MetaRecord::Map {
                        epoch,
                        lba,
                        nblks,
                        block,
                    } => {
                        self.splice_out(table, LbaRange::new(lba, nblks));
                        insert_entry(
                            table,
                            MapEntry {
                                lba,
                                nblks,
                                block,
                                epoch,
                            },
                        );
                        self.mapped_blocks
                            .fetch_add(u64::from(nblks), Ordering::Relaxed);
                    }
                    MetaRecord::Unmap { lba, nblks, .. } => {
                        self.splice_out(table, LbaRange::new(lba, nblks));
                    }
                    MetaRecord::Alloc { .. } | MetaRecord::Free { .. } | MetaRecord::Commit { .. } => {}
                }
            }
        });
    }

    /// Records that rebuild the current map from an empty log
    ///
    /// Entries are grouped by the epoch that wrote them and each group is
    /// closed by a `Commit`, so replay restores their epochs too. `through`
    /// always gets a `Commit`, even with no entries of its own.
    #[must_use]
    pub fn snapshot_records(&self, through: Epoch) -> Vec<MetaRecord> {
        let mut by_epoch: BTreeMap<Epoch, Vec<MetaRecord>> = BTreeMap::new();
        by_epoch.insert(through, Vec::new());
        for entry in self.range_scan(0, u64::MAX) {
            let group = by_epoch.entry(entry.epoch).or_default();
            group.push(MetaRecord::Alloc {
                epoch: entry.epoch,
                block: entry.block,
            });
            group.push(MetaRecord::Map {
                epoch: entry.epoch,
                lba: entry.lba,
                nblks: entry.nblks,
                block: entry.block,
            });
        }
        by_epoch
            .into_iter()
            .flat_map(|(epoch, mut group)| {
                group.push(MetaRecord::Commit { epoch });
                group
            })
            .collect()
    }

    /// Lazy ordered scan of the entries overlapping `[start, end)`
    #[must_use]
    pub fn range_scan(&self, start: u64, end: u64) -> RangeScan<'_> {
        RangeScan {
            index: self,
            cursor: start,
            end,
            buffered: Vec::new(),
        }
    }

    /// Remove and return journaled records of epochs at or before `epoch`
    pub fn take_deltas(&self, epoch: Epoch) -> Vec<MetaRecord> {
        self.journal.take_through(epoch)
    }

    /// Journaled records not yet checkpointed
    #[must_use]
    pub fn pending_deltas(&self) -> usize {
        self.journal.len()
    }

    #[must_use]
    pub fn mapped_blocks(&self) -> u64 {
        self.mapped_blocks.load(Ordering::Relaxed)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().values().map(|shard| shard.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}

/// Cursor over mapping entries, clipped to the scan window
///
/// Each refill loads the current table and copies out a small batch, so
/// updates may interleave with a scan; each yielded entry was current
/// when fetched. The scan can be resumed from [`RangeScan::position`]
/// with [`RangeScan::resume`].
pub struct RangeScan<'a> {
    index: &'a MappingIndex,
    cursor: u64,
    end: u64,
    /// Pending entries in reverse order
    buffered: Vec<MapEntry>,
}

impl<'a> RangeScan<'a> {
    /// Continue a scan of `index` from `position`
    #[must_use]
    pub fn resume(index: &'a MappingIndex, position: u64, end: u64) -> Self {
        index.range_scan(position, end)
    }

    /// First LBA not yet yielded
    #[must_use]
    pub fn position(&self) -> u64 {
        self.buffered.last().map_or(self.cursor, |next| next.lba)
    }

    fn refill(&mut self) {
        if self.cursor >= self.end {
            return;
        }
        let table = self.index.table.load();
        let batch: Vec<MapEntry> = overlapping(&table, self.cursor, self.end, SCAN_BATCH)
            .into_iter()
            .filter_map(|e| e.clip_span(self.cursor, self.end))
            .collect();
        drop(table);

        // An empty batch means nothing is left anywhere in the window
        self.cursor = batch.last().map_or(self.end, MapEntry::end);
        self.buffered = batch;
        self.buffered.reverse();
    }
}

impl Iterator for RangeScan<'_> {
    type Item = MapEntry;

    fn next(&mut self) -> Option<MapEntry> {
        if self.buffered.is_empty() {
            self.refill();
        }
        self.buffered.pop()
    }
}

//! Metadata records and epoch journal
//!
//! Every mapping and allocation change is captured as a [`MetaRecord`]
//! tagged with the epoch it belongs to. Records accumulate in an
//! [`EpochJournal`] until their epoch is checkpointed, at which point they
//! are appended to the log followed by a `Commit` record.
//!
//! On restart, [`plan_replay`] keeps only epochs that reached `Commit` and
//! orders them for application.

use crate::error::{BlockError, BlockResult};
use bytes::Bytes;
use lsvol_common::{BlockId, Epoch, Error};
use lsvol_storage::LogRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A persisted metadata mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaRecord {
    /// LBA range now points at `block`
    Map {
        epoch: Epoch,
        lba: u64,
        nblks: u32,
        block: BlockId,
    },
    /// LBA range no longer maps anywhere
    Unmap { epoch: Epoch, lba: u64, nblks: u32 },
    /// Range became allocated
    Alloc { epoch: Epoch, block: BlockId },
    /// Range was superseded and is free once `epoch` commits
    Free { epoch: Epoch, block: BlockId },
    /// Every record of `epoch` is durable
    Commit { epoch: Epoch },
}

impl MetaRecord {
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        match self {
            Self::Map { epoch, .. }
            | Self::Unmap { epoch, .. }
            | Self::Alloc { epoch, .. }
            | Self::Free { epoch, .. }
            | Self::Commit { epoch } => *epoch,
        }
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Records waiting for their epoch to be checkpointed
#[derive(Default)]
pub struct EpochJournal {
    epochs: Mutex<BTreeMap<Epoch, Vec<MetaRecord>>>,
}

impl EpochJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: MetaRecord) {
        self.epochs
            .lock()
            .entry(record.epoch())
            .or_default()
            .push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = MetaRecord>) {
        let mut epochs = self.epochs.lock();
        for record in records {
            epochs.entry(record.epoch()).or_default().push(record);
        }
    }

    /// Remove and return every record of epochs at or before `epoch`,
    /// in epoch order
    pub fn take_through(&self, epoch: Epoch) -> Vec<MetaRecord> {
        let mut epochs = self.epochs.lock();
        let later = epochs.split_off(&epoch.next());
        std::mem::replace(&mut *epochs, later)
            .into_values()
            .flatten()
            .collect()
    }

    /// Number of records not yet checkpointed
    #[must_use]
    pub fn len(&self) -> usize {
        self.epochs.lock().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What recovery should apply
#[derive(Debug, Default)]
pub struct ReplayPlan {
    /// Committed epochs in ascending order, each with its records in log order
    pub epochs: Vec<(Epoch, Vec<MetaRecord>)>,
    /// Highest committed epoch
    pub last_committed: Epoch,
    /// Highest epoch seen at all, committed or not
    pub last_seen: Epoch,
    /// Records dropped because their epoch never committed
    pub discarded: usize,
}

/// Decode the log and keep only committed epochs
pub fn plan_replay(records: &[LogRecord]) -> BlockResult<ReplayPlan> {
    let mut by_epoch: BTreeMap<Epoch, Vec<MetaRecord>> = BTreeMap::new();
    let mut committed = BTreeSet::new();
    let mut plan = ReplayPlan::default();

    for record in records {
        let meta = MetaRecord::decode(&record.data)
            .map_err(|e| BlockError::Recovery(format!("record at lsn {}: {e}", record.lsn)))?;
        plan.last_seen = plan.last_seen.max(meta.epoch());
        match meta {
            MetaRecord::Commit { epoch } => {
                committed.insert(epoch);
            }
            other => by_epoch.entry(other.epoch()).or_default().push(other),
        }
    }

    for (epoch, records) in by_epoch {
        if committed.contains(&epoch) {
            plan.epochs.push((epoch, records));
        } else {
            plan.discarded += records.len();
        }
    }
    // An epoch may commit with nothing but its Commit record
    for epoch in committed {
        if !plan.epochs.iter().any(|(e, _)| *e == epoch) {
            plan.epochs.push((epoch, Vec::new()));
        }
        plan.last_committed = plan.last_committed.max(epoch);
    }
    plan.epochs.sort_by_key(|(e, _)| *e);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsvol_common::RegionId;

    fn log(records: &[MetaRecord]) -> Vec<LogRecord> {
        records
            .iter()
            .enumerate()
            .map(|(i, r)| LogRecord {
                lsn: i as u64 + 1,
                data: r.encode().unwrap(),
            })
            .collect()
    }

    fn map(epoch: u64, lba: u64) -> MetaRecord {
        MetaRecord::Map {
            epoch: Epoch::new(epoch),
            lba,
            nblks: 1,
            block: BlockId::new(RegionId(0), lba, 1),
        }
    }

    #[test]
    fn test_encode_decode() {
        let rec = map(3, 7);
        assert_eq!(MetaRecord::decode(&rec.encode().unwrap()).unwrap(), rec);
        assert!(MetaRecord::decode(&[0xFF; 3]).is_err());
    }

    #[test]
    fn test_journal_take_through() {
        let journal = EpochJournal::new();
        journal.push(map(2, 0));
        journal.push(map(1, 1));
        journal.push(map(3, 2));

        let taken = journal.take_through(Epoch::new(2));
        assert_eq!(taken, vec![map(1, 1), map(2, 0)]);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_replay_discards_uncommitted_epoch() {
        let records = log(&[
            map(1, 0),
            MetaRecord::Commit {
                epoch: Epoch::new(1),
            },
            map(2, 1),
            map(2, 2),
        ]);

        let plan = plan_replay(&records).unwrap();
        assert_eq!(plan.epochs.len(), 1);
        assert_eq!(plan.epochs[0].0, Epoch::new(1));
        assert_eq!(plan.last_committed, Epoch::new(1));
        assert_eq!(plan.last_seen, Epoch::new(2));
        assert_eq!(plan.discarded, 2);
    }

    #[test]
    fn test_replay_orders_epochs() {
        let records = log(&[
            map(2, 5),
            MetaRecord::Commit {
                epoch: Epoch::new(2),
            },
            MetaRecord::Commit {
                epoch: Epoch::new(1),
            },
            map(1, 4),
        ]);
        let plan = plan_replay(&records).unwrap();
        let epochs: Vec<_> = plan.epochs.iter().map(|(e, _)| e.get()).collect();
        assert_eq!(epochs, vec![1, 2]);
    }

    #[test]
    fn test_replay_rejects_garbage() {
        let records = vec![LogRecord {
            lsn: 1,
            data: Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
        }];
        assert!(matches!(plan_replay(&records), Err(BlockError::Recovery(_))));
    }
}

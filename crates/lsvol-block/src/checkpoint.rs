//! Checkpoint and epoch management
//!
//! Every volume request is admitted into the currently open epoch and
//! holds an [`EpochGuard`] until it completes. A checkpoint closes the
//! open epoch N and immediately opens N+1, so admission never waits on a
//! boundary. It then:
//!
//! 1. waits until every request admitted into N has completed
//! 2. writes back dirty cache entries of epochs up to N and syncs devices
//! 3. appends N's journaled records and a `Commit` to the log
//! 4. marks N committed, reclaims N's pending frees and drops the cache's
//!    epoch pins
//! 5. once enough records piled up since the last compaction, rewrites
//!    the log as a snapshot of the committed mapping
//!
//! Checkpoints are serialized; ongoing I/O is not. A device or log
//! failure while checkpointing is fatal and handled per [`FatalAction`].

use crate::error::{BlockError, BlockResult};
use crate::mapping::MappingIndex;
use crate::record::{MetaRecord, plan_replay};
use lsvol_common::{Epoch, FatalAction};
use lsvol_storage::{BlockAllocator, BlockStore, LogStore};
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Durability state of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    Open,
    Flushing,
    Committed,
}

struct EpochCtx {
    epoch: Epoch,
    outstanding: AtomicUsize,
    drained: Notify,
}

impl EpochCtx {
    fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn wait_drained(self: Arc<Self>) -> impl Future<Output = ()> + Send {
        async move {
            loop {
                // Registered before the check so a concurrent drop cannot be missed
                let notified = self.drained.notified();
                if self.outstanding.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        }
    }
}

/// Admission of one request into an epoch
///
/// The epoch cannot commit while the guard is alive.
pub struct EpochGuard {
    ctx: Arc<EpochCtx>,
}

impl EpochGuard {
    /// Epoch the request was admitted into
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.ctx.epoch
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        if self.ctx.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.ctx.drained.notify_waiters();
        }
    }
}

/// Holds the open epoch steady while a mapping update is tagged with it
pub struct EpochStamp<'a> {
    current: RwLockReadGuard<'a, Arc<EpochCtx>>,
}

impl EpochStamp<'_> {
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.current.epoch
    }
}

/// Checkpoint statistics
#[derive(Debug, Default)]
pub struct CheckpointStats {
    pub checkpoints: AtomicU64,
    pub records_logged: AtomicU64,
    pub blocks_flushed: AtomicU64,
    pub blocks_reclaimed: AtomicU64,
    pub log_compactions: AtomicU64,
    /// Duration of the last checkpoint in microseconds
    pub last_duration_us: AtomicU64,
}

/// Log a fatal error, then abort or hand it back per `action`
pub(crate) fn fatal_policy(action: FatalAction, err: BlockError, during: &str) -> BlockError {
    error!("fatal error during {}: {}", during, err);
    match action {
        FatalAction::Abort => std::process::abort(),
        FatalAction::Halt => err,
    }
}

/// Epoch lifecycle and checkpoint driver for one volume
pub struct CheckpointManager {
    current: RwLock<Arc<EpochCtx>>,
    committed: AtomicU64,
    /// Serializes boundary transitions
    transition: tokio::sync::Mutex<()>,
    store: Arc<BlockStore>,
    mapping: Arc<MappingIndex>,
    log: Arc<dyn LogStore>,
    fatal_action: FatalAction,
    halted: AtomicBool,
    dirty_threshold: u64,
    kick: Notify,
    kick_pending: AtomicBool,
    /// Records appended since the last compaction that trigger the next
    /// one; 0 disables compaction
    compact_after: u64,
    /// Records currently in the log
    log_records: AtomicU64,
    /// Records the log held right after it was last compacted
    compacted_records: AtomicU64,
    stats: CheckpointStats,
}

impl CheckpointManager {
    /// Create a manager whose first open epoch follows `last_seen`
    ///
    /// `committed` is the last epoch known durable. The open epoch starts
    /// after every epoch present in the log, committed or not, so stale
    /// uncommitted records can never be committed by a later run.
    #[must_use]
    pub fn new(
        store: Arc<BlockStore>,
        mapping: Arc<MappingIndex>,
        log: Arc<dyn LogStore>,
        committed: Epoch,
        last_seen: Epoch,
        fatal_action: FatalAction,
        dirty_threshold: u64,
    ) -> Self {
        let open = committed.max(last_seen).next();
        Self {
            current: RwLock::new(Arc::new(EpochCtx::new(open))),
            committed: AtomicU64::new(committed.get()),
            transition: tokio::sync::Mutex::new(()),
            store,
            mapping,
            log,
            fatal_action,
            halted: AtomicBool::new(false),
            dirty_threshold,
            kick: Notify::new(),
            kick_pending: AtomicBool::new(false),
            compact_after: 0,
            log_records: AtomicU64::new(0),
            compacted_records: AtomicU64::new(0),
            stats: CheckpointStats::default(),
        }
    }

    /// Compact the log once `threshold` records were appended since it
    /// was last compacted; `log_records` is what it holds now
    ///
    /// A log that was never compacted counts in full, so a long history
    /// left by an earlier run is folded at the first checkpoint.
    #[must_use]
    pub fn with_log_compaction(mut self, threshold: u64, log_records: u64) -> Self {
        self.compact_after = threshold;
        self.log_records = AtomicU64::new(log_records);
        self
    }

    /// Admit a request into the open epoch
    pub fn enter(&self) -> BlockResult<EpochGuard> {
        if self.is_halted() {
            return Err(BlockError::Halted);
        }
        let current = self.current.read();
        current.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(EpochGuard {
            ctx: Arc::clone(&current),
        })
    }

    /// Pin the open epoch for the duration of a mapping update
    ///
    /// Must not be held across an await.
    pub fn stamp(&self) -> EpochStamp<'_> {
        EpochStamp {
            current: self.current.read(),
        }
    }

    #[must_use]
    pub fn open_epoch(&self) -> Epoch {
        self.current.read().epoch
    }

    #[must_use]
    pub fn committed_epoch(&self) -> Epoch {
        Epoch::new(self.committed.load(Ordering::Acquire))
    }

    /// Durability state of `epoch`
    ///
    /// Epochs past the open one report `Open` as well.
    #[must_use]
    pub fn epoch_state(&self, epoch: Epoch) -> EpochState {
        if epoch <= self.committed_epoch() {
            EpochState::Committed
        } else if epoch < self.open_epoch() {
            EpochState::Flushing
        } else {
            EpochState::Open
        }
    }

    /// Requests admitted into the open epoch and still running
    #[must_use]
    pub fn open_outstanding(&self) -> usize {
        self.current.read().outstanding.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub const fn stats(&self) -> &CheckpointStats {
        &self.stats
    }

    /// Kick the background task if dirty cache data crossed the threshold
    pub fn maybe_trigger(&self) {
        if self.store.cache().dirty_bytes() >= self.dirty_threshold
            && !self.kick_pending.swap(true, Ordering::AcqRel)
        {
            debug!(
                "dirty threshold {} reached, requesting checkpoint",
                self.dirty_threshold
            );
            self.kick.notify_one();
        }
    }

    /// Apply the fatal-error policy to `err` and poison the engine
    fn fatal(&self, err: BlockError, during: &str) -> BlockError {
        let err = fatal_policy(self.fatal_action, err, during);
        self.halted.store(true, Ordering::Release);
        err
    }

    /// Poison the engine after a fatal error outside a checkpoint
    pub fn escalate(&self, err: BlockError, during: &str) -> BlockError {
        if err.is_fatal() {
            self.fatal(err, during)
        } else {
            err
        }
    }

    /// Close the open epoch and wait for it to commit
    ///
    /// Returns the committed epoch.
    pub async fn checkpoint(&self) -> BlockResult<Epoch> {
        let _transition = self.transition.lock().await;
        if self.is_halted() {
            return Err(BlockError::Halted);
        }
        let started = Instant::now();

        let closing = {
            let mut current = self.current.write();
            let next = Arc::new(EpochCtx::new(current.epoch.next()));
            std::mem::replace(&mut *current, next)
        };
        let epoch = closing.epoch;
        debug!("epoch {} flushing", epoch);

        Arc::clone(&closing).wait_drained().await;

        let flushed = self
            .store
            .flush_through(epoch)
            .await
            .map_err(|e| self.fatal(e.into(), "checkpoint flush"))?;

        let mut records = self.mapping.take_deltas(epoch);
        if flushed.blocks > 0 || !records.is_empty() {
            self.store
                .sync()
                .await
                .map_err(|e| self.fatal(e.into(), "device sync"))?;
        }
        if !records.is_empty() {
            records.push(MetaRecord::Commit { epoch });
            let encoded = records
                .iter()
                .map(MetaRecord::encode)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| self.fatal(e.into(), "record encoding"))?;
            self.log
                .append(encoded)
                .await
                .map_err(|e| self.fatal(e.into(), "log append"))?;
            self.log_records
                .fetch_add(records.len() as u64, Ordering::Relaxed);
        }

        self.committed.store(epoch.get(), Ordering::Release);

        let reclaimed = self.store.allocator().reclaim(epoch);
        let unpinned = self.store.cache().unpin_epoch(epoch);

        if self.compaction_due() {
            self.compact_log(epoch)
                .await
                .map_err(|e| self.fatal(e, "log compaction"))?;
        }

        let elapsed = started.elapsed();
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_logged
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.stats
            .blocks_flushed
            .fetch_add(flushed.blocks, Ordering::Relaxed);
        self.stats
            .blocks_reclaimed
            .fetch_add(reclaimed, Ordering::Relaxed);
        self.stats
            .last_duration_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);

        info!(
            "epoch {} committed: {} records, {} blocks flushed, {} reclaimed, {} cache pins released in {:?}",
            epoch,
            records.len(),
            flushed.blocks,
            reclaimed,
            unpinned,
            elapsed
        );
        Ok(epoch)
    }

    fn compaction_due(&self) -> bool {
        let grown = self
            .log_records
            .load(Ordering::Relaxed)
            .saturating_sub(self.compacted_records.load(Ordering::Relaxed));
        self.compact_after > 0 && grown >= self.compact_after
    }

    /// Rewrite the log as the mapping committed through `committed`
    ///
    /// The live index already carries updates of the open epoch, so the
    /// committed state is rebuilt from the log itself. Callers hold the
    /// transition lock, which keeps appends out meanwhile.
    async fn compact_log(&self, committed: Epoch) -> BlockResult<u64> {
        let started = Instant::now();
        let records = self.log.replay().await?;
        let plan = plan_replay(&records)?;

        let scratch = MappingIndex::new(Arc::new(BlockAllocator::new(&[], false)));
        scratch.replay_all(plan.epochs.iter().flat_map(|(_, records)| records));
        let encoded = scratch
            .snapshot_records(committed)
            .iter()
            .map(MetaRecord::encode)
            .collect::<Result<Vec<_>, _>>()?;

        let kept = encoded.len() as u64;
        self.log.rewrite(encoded).await?;
        self.log_records.store(kept, Ordering::Relaxed);
        self.compacted_records.store(kept, Ordering::Relaxed);
        self.stats.log_compactions.fetch_add(1, Ordering::Relaxed);

        info!(
            "metadata log compacted from {} to {} records in {:?}",
            records.len(),
            kept,
            started.elapsed()
        );
        Ok(kept)
    }

    /// Spawn the background task that checkpoints every `interval` and
    /// whenever the dirty threshold is crossed
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = mgr.kick.notified() => {}
                    _ = shutdown.changed() => break,
                }
                mgr.kick_pending.store(false, Ordering::Release);

                match mgr.checkpoint().await {
                    Ok(_) => {}
                    Err(BlockError::Halted) => break,
                    Err(e) => {
                        error!("background checkpoint failed: {}", e);
                        if mgr.is_halted() {
                            break;
                        }
                    }
                }
            }
            debug!("checkpoint task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Segment;
    use lsvol_common::LbaRange;
    use lsvol_storage::{AllocHints, BlockDevice, DeviceSet, MemDevice, MemLogStore};
    use bytes::Bytes;

    const BS: u32 = 512;

    struct Fixture {
        dev: Arc<MemDevice>,
        log: Arc<MemLogStore>,
        store: Arc<BlockStore>,
        mapping: Arc<MappingIndex>,
        mgr: Arc<CheckpointManager>,
    }

    fn fixture(action: FatalAction) -> Fixture {
        fixture_compacting(action, 0)
    }

    fn fixture_compacting(action: FatalAction, compact_after: u64) -> Fixture {
        let dev = Arc::new(MemDevice::new(BS, 256));
        let set = Arc::new(DeviceSet::from_devices(BS, [dev.clone() as Arc<dyn BlockDevice>]).unwrap());
        let store = Arc::new(BlockStore::new(set, 64 * u64::from(BS), false));
        let mapping = Arc::new(MappingIndex::new(Arc::clone(store.allocator())));
        let log = Arc::new(MemLogStore::new());
        let mgr = Arc::new(
            CheckpointManager::new(
                Arc::clone(&store),
                Arc::clone(&mapping),
                log.clone(),
                Epoch::ZERO,
                Epoch::ZERO,
                action,
                u64::MAX,
            )
            .with_log_compaction(compact_after, 0),
        );
        Fixture {
            dev,
            log,
            store,
            mapping,
            mgr,
        }
    }

    async fn write(f: &Fixture, lba: u64, byte: u8) {
        let guard = f.mgr.enter().unwrap();
        let data = Bytes::from(vec![byte; BS as usize]);
        let blocks = f
            .store
            .alloc_and_write(data, guard.epoch(), AllocHints::default())
            .await
            .unwrap()
            .publish();
        let stamp = f.mgr.stamp();
        f.mapping
            .upsert(LbaRange::new(lba, 1), blocks[0], stamp.epoch());
    }

    #[tokio::test]
    async fn test_checkpoint_commits_and_logs() {
        let f = fixture(FatalAction::Halt);
        assert_eq!(f.mgr.open_epoch(), Epoch::new(1));
        write(&f, 0, 1).await;

        let committed = f.mgr.checkpoint().await.unwrap();
        assert_eq!(committed, Epoch::new(1));
        assert_eq!(f.mgr.committed_epoch(), Epoch::new(1));
        assert_eq!(f.mgr.open_epoch(), Epoch::new(2));

        // Alloc, Map, Commit
        assert_eq!(f.log.len(), 3);
        assert_eq!(f.dev.write_count(), 1);
        assert!(f.dev.sync_count() >= 1);
        assert_eq!(f.store.cache().dirty_bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_runs_on_spawned_task() {
        let f = fixture(FatalAction::Halt);
        write(&f, 0, 4).await;
        let guard = f.mgr.enter().unwrap();

        let mgr = Arc::clone(&f.mgr);
        let task = tokio::spawn(async move { mgr.checkpoint().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        drop(guard);
        assert_eq!(task.await.unwrap().unwrap(), Epoch::new(1));
        assert_eq!(f.store.cache().dirty_bytes(), 0);
    }

    #[tokio::test]
    async fn test_superseded_blocks_reclaimed_after_commit() {
        let f = fixture(FatalAction::Halt);
        write(&f, 0, 1).await;
        write(&f, 0, 2).await;
        assert_eq!(f.store.allocator().pending_free_blocks(), 1);

        f.mgr.checkpoint().await.unwrap();
        assert_eq!(f.store.allocator().pending_free_blocks(), 0);
        assert_eq!(f.mgr.stats().blocks_reclaimed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_barrier_waits_for_admitted_requests() {
        let f = fixture(FatalAction::Halt);
        let guard = f.mgr.enter().unwrap();
        assert_eq!(guard.epoch(), Epoch::new(1));

        let mgr = Arc::clone(&f.mgr);
        let ckpt = tokio::spawn(async move { mgr.checkpoint().await });

        // The boundary moves immediately, the commit does not
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.mgr.open_epoch(), Epoch::new(2));
        assert_eq!(f.mgr.committed_epoch(), Epoch::ZERO);
        assert_eq!(f.mgr.epoch_state(Epoch::new(1)), EpochState::Flushing);
        assert_eq!(f.mgr.epoch_state(Epoch::new(2)), EpochState::Open);
        assert!(!ckpt.is_finished());

        // New admissions go to epoch 2 and do not hold up epoch 1
        let late = f.mgr.enter().unwrap();
        assert_eq!(late.epoch(), Epoch::new(2));

        drop(guard);
        assert_eq!(ckpt.await.unwrap().unwrap(), Epoch::new(1));
        assert_eq!(f.mgr.epoch_state(Epoch::new(1)), EpochState::Committed);
        drop(late);
    }

    #[tokio::test]
    async fn test_log_failure_halts() {
        let f = fixture(FatalAction::Halt);
        write(&f, 0, 1).await;
        f.log.fail_appends(true);

        let err = f.mgr.checkpoint().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(f.mgr.is_halted());
        assert_eq!(f.mgr.committed_epoch(), Epoch::ZERO);
        assert!(matches!(f.mgr.enter(), Err(BlockError::Halted)));
        assert!(matches!(f.mgr.checkpoint().await, Err(BlockError::Halted)));
    }

    #[tokio::test]
    async fn test_empty_checkpoint_skips_log() {
        let f = fixture(FatalAction::Halt);
        f.mgr.checkpoint().await.unwrap();
        f.mgr.checkpoint().await.unwrap();
        assert_eq!(f.mgr.committed_epoch(), Epoch::new(2));
        assert!(f.log.is_empty());
        assert_eq!(f.dev.sync_count(), 0);
    }

    fn rebuild_from_log(records: &[lsvol_storage::LogRecord]) -> MappingIndex {
        let plan = plan_replay(records).unwrap();
        let rebuilt = MappingIndex::new(Arc::new(BlockAllocator::new(&[], false)));
        rebuilt.replay_all(plan.epochs.iter().flat_map(|(_, r)| r));
        rebuilt
    }

    #[tokio::test]
    async fn test_log_compacts_to_committed_mapping() {
        let f = fixture_compacting(FatalAction::Halt, 6);

        // Alloc, Map, Commit
        write(&f, 0, 1).await;
        f.mgr.checkpoint().await.unwrap();
        assert_eq!(f.log.len(), 3);
        assert_eq!(f.mgr.stats().log_compactions.load(Ordering::Relaxed), 0);

        // Six more records cross the threshold
        write(&f, 0, 2).await;
        write(&f, 5, 3).await;
        f.mgr.checkpoint().await.unwrap();
        assert_eq!(f.mgr.stats().log_compactions.load(Ordering::Relaxed), 1);

        // One Alloc and Map per entry plus the Commit
        let records = f.log.replay().await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(plan_replay(&records).unwrap().last_committed, Epoch::new(2));
        let rebuilt = rebuild_from_log(&records);
        assert_eq!(rebuilt.lookup(0, 8), f.mapping.lookup(0, 8));

        // Appends continue behind the snapshot
        write(&f, 1, 4).await;
        f.mgr.checkpoint().await.unwrap();
        assert_eq!(f.log.len(), 8);
        assert_eq!(f.mgr.stats().log_compactions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_compaction_skips_open_epoch_updates() {
        let f = fixture_compacting(FatalAction::Halt, 1);
        write(&f, 0, 1).await;

        // Mapped in epoch 2 while epoch 1 is still draining
        let held = f.mgr.enter().unwrap();
        let ckpt = {
            let mgr = Arc::clone(&f.mgr);
            tokio::spawn(async move { mgr.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        write(&f, 3, 9).await;
        drop(held);
        assert_eq!(ckpt.await.unwrap().unwrap(), Epoch::new(1));
        assert_eq!(f.mgr.stats().log_compactions.load(Ordering::Relaxed), 1);

        let rebuilt = rebuild_from_log(&f.log.replay().await.unwrap());
        assert_eq!(rebuilt.len(), 1);
        assert!(matches!(rebuilt.lookup(3, 1)[0], Segment::Unwritten { .. }));
        assert_eq!(f.mapping.len(), 2);
    }

    #[tokio::test]
    async fn test_open_epoch_follows_last_seen() {
        let f = fixture(FatalAction::Halt);
        let mgr = CheckpointManager::new(
            Arc::clone(&f.store),
            Arc::clone(&f.mapping),
            f.log.clone(),
            Epoch::new(4),
            Epoch::new(6),
            FatalAction::Halt,
            u64::MAX,
        );
        assert_eq!(mgr.committed_epoch(), Epoch::new(4));
        assert_eq!(mgr.open_epoch(), Epoch::new(7));
    }

    #[tokio::test]
    async fn test_background_task_checkpoints_on_threshold() {
        let dev = Arc::new(MemDevice::new(BS, 256));
        let set = Arc::new(DeviceSet::from_devices(BS, [dev as Arc<dyn BlockDevice>]).unwrap());
        let store = Arc::new(BlockStore::new(set, 64 * u64::from(BS), false));
        let mapping = Arc::new(MappingIndex::new(Arc::clone(store.allocator())));
        let mgr = Arc::new(CheckpointManager::new(
            Arc::clone(&store),
            mapping,
            Arc::new(MemLogStore::new()),
            Epoch::ZERO,
            Epoch::ZERO,
            FatalAction::Halt,
            u64::from(BS),
        ));
        let (tx, rx) = watch::channel(false);
        let task = mgr.spawn(Duration::from_secs(3600), rx);

        let guard = mgr.enter().unwrap();
        let _kept = store
            .alloc_and_write(Bytes::from(vec![1u8; BS as usize]), guard.epoch(), AllocHints::default())
            .await
            .unwrap()
            .publish();
        drop(guard);
        mgr.maybe_trigger();

        tokio::time::timeout(Duration::from_secs(5), async {
            while mgr.committed_epoch() == Epoch::ZERO {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}

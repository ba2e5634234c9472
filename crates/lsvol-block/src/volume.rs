//! Volume façade
//!
//! A [`Volume`] exposes asynchronous block reads and writes over a set of
//! devices and a metadata log. The engine behind it is built explicitly
//! from an [`EngineConfig`]; there is no process-wide instance.
//!
//! Write path: allocate and write through the block store, then publish
//! the new mapping tagged with the open epoch, then complete.
//! Read path: resolve the range in the mapping index, fan out one
//! sub-read per mapped range, zero-fill unwritten ranges, then complete
//! once the last sub-read lands.

use crate::checkpoint::{CheckpointManager, EpochGuard, fatal_policy};
use crate::error::{BlockError, BlockResult};
use crate::mapping::{MapEntry, MappingIndex, Segment};
use crate::metrics::{MetricsSnapshot, VolumeMetrics};
use crate::record::{MetaRecord, ReplayPlan, plan_replay};
use crate::request::{
    InFlight, IoCompletion, IoHandle, ReadFanout, RequestId, RequestInfo, RequestTable,
};
use bytes::Bytes;
use lsvol_common::{EngineConfig, Epoch, Error, IoDirection, LbaRange};
use lsvol_storage::{AllocHints, BlockAllocator, BlockStore, DeviceSet, LogStore};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Volume lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Closed,
    Open,
    /// A fatal error poisoned the engine
    Halted,
}

/// Space and cache accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub volume_blocks: u64,
    pub mapped_blocks: u64,
    pub free_blocks: u64,
    pub pending_free_blocks: u64,
    pub cache_resident_bytes: u64,
    pub cache_dirty_bytes: u64,
    pub committed_epoch: Epoch,
    pub open_epoch: Epoch,
}

/// Components that exist while the volume is open
struct Engine {
    store: Arc<BlockStore>,
    mapping: Arc<MappingIndex>,
    ckpt: Arc<CheckpointManager>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Admission of one request
struct Admitted {
    engine: Arc<Engine>,
    guard: EpochGuard,
    tracked: InFlight,
    _permit: OwnedSemaphorePermit,
}

/// A log-structured block volume
pub struct Volume {
    config: EngineConfig,
    devices: Arc<DeviceSet>,
    log: Arc<dyn LogStore>,
    engine: RwLock<Option<Arc<Engine>>>,
    admission: Arc<Semaphore>,
    requests: Arc<RequestTable>,
    metrics: Arc<VolumeMetrics>,
}

impl Volume {
    /// Create a closed volume over `devices`, recording metadata in `log`
    pub fn new(
        config: EngineConfig,
        devices: Arc<DeviceSet>,
        log: Arc<dyn LogStore>,
    ) -> BlockResult<Self> {
        config.validate()?;
        if devices.block_size() != config.block_size {
            return Err(Error::Configuration(format!(
                "device block size {} does not match configured {}",
                devices.block_size(),
                config.block_size
            ))
            .into());
        }
        if devices.regions().is_empty() {
            return Err(Error::Configuration("no devices attached".into()).into());
        }
        Ok(Self {
            admission: Arc::new(Semaphore::new(config.max_outstanding_ios)),
            config,
            devices,
            log,
            engine: RwLock::new(None),
            requests: Arc::new(RequestTable::new()),
            metrics: Arc::new(VolumeMetrics::new()),
        })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> VolumeState {
        match &*self.engine.read() {
            None => VolumeState::Closed,
            Some(engine) if engine.ckpt.is_halted() => VolumeState::Halted,
            Some(_) => VolumeState::Open,
        }
    }

    fn engine(&self) -> BlockResult<Arc<Engine>> {
        self.engine.read().clone().ok_or(BlockError::NotOpen)
    }

    /// Recover from the log and start accepting requests
    pub async fn open(&self) -> BlockResult<()> {
        if self.engine.read().is_some() {
            return Err(BlockError::AlreadyOpen);
        }
        let started = Instant::now();
        let store = Arc::new(BlockStore::new(
            Arc::clone(&self.devices),
            self.config.cache_capacity_bytes,
            self.config.allocation_split,
        ));
        let mapping = Arc::new(MappingIndex::new(Arc::clone(store.allocator())));

        let records = self.log.replay().await.map_err(|e| {
            fatal_policy(self.config.fatal_action, e.into(), "metadata log replay")
        })?;
        let plan = plan_replay(&records)?;
        apply_replay(&plan, &mapping, store.allocator())?;

        let ckpt = Arc::new(
            CheckpointManager::new(
                Arc::clone(&store),
                Arc::clone(&mapping),
                Arc::clone(&self.log),
                plan.last_committed,
                plan.last_seen,
                self.config.fatal_action,
                self.config.checkpoint_dirty_threshold,
            )
            .with_log_compaction(self.config.log_compact_records, records.len() as u64),
        );
        let (shutdown, rx) = watch::channel(false);
        let task = ckpt.spawn(self.config.checkpoint_interval, rx);

        let engine = Arc::new(Engine {
            store,
            mapping,
            ckpt,
            shutdown,
            task: Mutex::new(Some(task)),
        });

        {
            let mut slot = self.engine.write();
            if slot.is_some() {
                let _ = engine.shutdown.send(true);
                return Err(BlockError::AlreadyOpen);
            }
            *slot = Some(Arc::clone(&engine));
        }

        info!(
            "volume opened in {:?}: {} committed epochs replayed ({} records discarded), {} blocks mapped, open epoch {}",
            started.elapsed(),
            plan.epochs.len(),
            plan.discarded,
            engine.mapping.mapped_blocks(),
            engine.ckpt.open_epoch()
        );
        Ok(())
    }

    /// Stop accepting requests, wait for those in flight and checkpoint
    pub async fn close(&self) -> BlockResult<()> {
        let engine = self.engine.write().take().ok_or(BlockError::NotOpen)?;
        let _ = engine.shutdown.send(true);
        let task = engine.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("checkpoint task ended abnormally: {}", e);
        }

        let result = engine.ckpt.checkpoint().await.map(|_| ());
        self.metrics.log_summary();
        info!(
            "volume closed, last committed epoch {}",
            engine.ckpt.committed_epoch()
        );
        result
    }

    fn check_range(&self, lba: u64, nblks: u64) -> BlockResult<()> {
        let size = self.config.volume_size_blocks;
        match lba.checked_add(nblks) {
            Some(end) if nblks > 0 && end <= size => Ok(()),
            _ => Err(BlockError::OutOfBounds { lba, nblks, size }),
        }
    }

    async fn admit(&self, direction: IoDirection, lba: u64, nblks: u32) -> BlockResult<Admitted> {
        let engine = self.engine()?;
        let permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|_| BlockError::NotOpen)?;
        let guard = engine.ckpt.enter()?;
        let tracked = self.requests.track(RequestInfo {
            direction,
            lba,
            nblks,
            epoch: guard.epoch(),
            started: Instant::now(),
        });
        Ok(Admitted {
            engine,
            guard,
            tracked,
            _permit: permit,
        })
    }

    /// Write whole blocks at `lba`
    ///
    /// Returns once the data is readable; it is durable after the next
    /// checkpoint commits.
    pub async fn write(&self, lba: u64, data: Bytes) -> BlockResult<()> {
        self.write_request(lba, data, &mut None).await
    }

    async fn write_request(
        &self,
        lba: u64,
        data: Bytes,
        id: &mut Option<RequestId>,
    ) -> BlockResult<()> {
        let started = Instant::now();
        let len = data.len();
        let nblks = whole_blocks(len, self.config.block_size)?;
        self.check_range(lba, u64::from(nblks))?;

        let req = self.admit(IoDirection::Write, lba, nblks).await?;
        *id = Some(req.tracked.id());
        let engine = &req.engine;

        // Dropping this future before publish releases the blocks
        let written = match engine
            .store
            .alloc_and_write(data, req.guard.epoch(), AllocHints::default())
            .await
        {
            Ok(written) => written,
            Err(e) => {
                self.metrics.record_failure();
                return Err(engine.ckpt.escalate(e.into(), "volume write"));
            }
        };
        self.metrics.alloc.record(written.alloc_time);
        self.metrics.io_write.record(written.write_time);

        let map_start = Instant::now();
        {
            let stamp = engine.ckpt.stamp();
            let blocks = written.publish();
            engine.mapping.upsert_extents(lba, &blocks, stamp.epoch());
        }
        self.metrics.map_update.record(map_start.elapsed());

        drop(req.guard);
        engine.ckpt.maybe_trigger();
        self.metrics.record_write(len, started.elapsed());
        Ok(())
    }

    /// Read `nblks` blocks at `lba`; unwritten blocks read as zeroes
    pub async fn read(&self, lba: u64, nblks: u32) -> BlockResult<Bytes> {
        self.read_request(lba, nblks, &mut None).await
    }

    async fn read_request(
        &self,
        lba: u64,
        nblks: u32,
        id: &mut Option<RequestId>,
    ) -> BlockResult<Bytes> {
        let started = Instant::now();
        self.check_range(lba, u64::from(nblks))?;

        let req = self.admit(IoDirection::Read, lba, nblks).await?;
        *id = Some(req.tracked.id());
        let engine = &req.engine;

        let lookup_start = Instant::now();
        let mapped: Vec<_> = engine
            .mapping
            .lookup(lba, nblks)
            .into_iter()
            .filter_map(|seg| match seg {
                Segment::Mapped { lba: at, block, .. } => Some(((at - lba) as u32, block)),
                Segment::Unwritten { .. } => None,
            })
            .collect();
        self.metrics.map_read.record(lookup_start.elapsed());

        let (fanout, done) = ReadFanout::new(nblks, self.config.block_size, mapped.len());
        for (offset, block) in mapped {
            let store = Arc::clone(&engine.store);
            let fanout = Arc::clone(&fanout);
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                let io_start = Instant::now();
                let result = {
                    let _pin = store.cache().pin(block);
                    store.read(block).await
                };
                metrics.io_read.record(io_start.elapsed());
                fanout.complete_part(offset, result.map_err(BlockError::from));
            });
        }

        let result = match done.await {
            Ok(result) => result,
            Err(_) => Err(Error::internal("read fan-out abandoned").into()),
        };
        drop(req.guard);

        match result {
            Ok(data) => {
                self.metrics.record_read(data.len(), started.elapsed());
                Ok(data)
            }
            Err(e) => {
                self.metrics.record_failure();
                Err(engine.ckpt.escalate(e, "volume read"))
            }
        }
    }

    /// Drop the mappings of `[lba, lba + nblks)`
    ///
    /// The freed blocks become reusable once the current epoch commits.
    /// Returns the number of blocks that were mapped.
    pub async fn unmap(&self, lba: u64, nblks: u32) -> BlockResult<u64> {
        self.check_range(lba, u64::from(nblks))?;
        let req = self.admit(IoDirection::Write, lba, nblks).await?;
        let engine = &req.engine;
        let window = LbaRange::new(lba, nblks);

        let mut unmapped = 0;
        {
            let stamp = engine.ckpt.stamp();
            let extents: Vec<MapEntry> = engine.mapping.range_scan(lba, window.end()).collect();
            for entry in extents {
                unmapped += engine
                    .mapping
                    .remove_range(entry.range(), stamp.epoch())
                    .iter()
                    .map(|b| u64::from(b.nblks))
                    .sum::<u64>();
            }
        }
        self.metrics.unmaps.fetch_add(1, Ordering::Relaxed);
        debug!("unmapped {} blocks in {}", unmapped, window);
        Ok(unmapped)
    }

    /// Submit a write, calling `on_complete` from a worker task when done
    pub fn submit_write<F>(self: &Arc<Self>, lba: u64, data: Bytes, on_complete: F) -> IoHandle
    where
        F: FnOnce(&IoCompletion) + Send + 'static,
    {
        // A malformed buffer reports no blocks and fails in the task
        let nblks = whole_blocks(data.len(), self.config.block_size).unwrap_or(0);
        let (tx, handle) = IoHandle::new(IoDirection::Write, lba, nblks);
        let volume = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut id = None;
            let result = volume.write_request(lba, data, &mut id).await;
            let completion = IoCompletion::new(
                id,
                IoDirection::Write,
                lba,
                nblks,
                result.map(|()| Bytes::new()),
                started,
            );
            on_complete(&completion);
            let _ = tx.send(completion);
        });
        handle
    }

    /// Submit a read, calling `on_complete` from a worker task when done
    pub fn submit_read<F>(self: &Arc<Self>, lba: u64, nblks: u32, on_complete: F) -> IoHandle
    where
        F: FnOnce(&IoCompletion) + Send + 'static,
    {
        let (tx, handle) = IoHandle::new(IoDirection::Read, lba, nblks);
        let volume = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut id = None;
            let result = volume.read_request(lba, nblks, &mut id).await;
            let completion =
                IoCompletion::new(id, IoDirection::Read, lba, nblks, result, started);
            on_complete(&completion);
            let _ = tx.send(completion);
        });
        handle
    }

    /// Checkpoint now; returns the committed epoch
    pub async fn flush(&self) -> BlockResult<Epoch> {
        self.engine()?.ckpt.checkpoint().await
    }

    /// Every mapped extent, in LBA order
    pub fn mapped_extents(&self) -> BlockResult<Vec<MapEntry>> {
        let engine = self.engine()?;
        Ok(engine
            .mapping
            .range_scan(0, self.config.volume_size_blocks)
            .collect())
    }

    pub fn usage(&self) -> BlockResult<VolumeUsage> {
        let engine = self.engine()?;
        let allocator = engine.store.allocator();
        let cache = engine.store.cache();
        Ok(VolumeUsage {
            volume_blocks: self.config.volume_size_blocks,
            mapped_blocks: engine.mapping.mapped_blocks(),
            free_blocks: allocator.free_blocks(),
            pending_free_blocks: allocator.pending_free_blocks(),
            cache_resident_bytes: cache.resident_bytes(),
            cache_dirty_bytes: cache.dirty_bytes(),
            committed_epoch: engine.ckpt.committed_epoch(),
            open_epoch: engine.ckpt.open_epoch(),
        })
    }

    /// Requests currently admitted
    #[must_use]
    pub fn outstanding(&self) -> Vec<(RequestId, RequestInfo)> {
        self.requests.snapshot()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Number of whole blocks in a write buffer of `len` bytes
fn whole_blocks(len: usize, block_size: u32) -> BlockResult<u32> {
    let bs = block_size as usize;
    let count = len / bs;
    u32::try_from(count)
        .ok()
        .filter(|n| *n > 0 && len % bs == 0)
        .ok_or(BlockError::InvalidLength {
            len,
            nblks: count as u64,
            block_size,
        })
}

/// Rebuild the mapping and allocator from committed epochs
fn apply_replay(
    plan: &ReplayPlan,
    mapping: &MappingIndex,
    allocator: &BlockAllocator,
) -> BlockResult<()> {
    for (epoch, records) in &plan.epochs {
        mapping.replay_all(records);
        for record in records {
            match *record {
                MetaRecord::Map { .. } | MetaRecord::Unmap { .. } | MetaRecord::Commit { .. } => {}
                MetaRecord::Alloc { block, .. } => {
                    allocator.mark_allocated(block).map_err(|e| {
                        BlockError::Recovery(format!("epoch {epoch}: {e}"))
                    })?;
                }
                MetaRecord::Free { block, .. } => {
                    if !allocator.is_allocated(block) {
                        return Err(BlockError::Recovery(format!(
                            "epoch {epoch}: free of unallocated {block}"
                        )));
                    }
                    allocator.release(block);
                }
            }
        }
        debug!("replayed epoch {} ({} records)", epoch, records.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsvol_common::{FatalAction, RegionId};
    use lsvol_storage::{BlockDevice, MemDevice, MemLogStore};

    const BS: u32 = 512;

    fn config() -> EngineConfig {
        EngineConfig {
            volume_size_blocks: 1024,
            block_size: BS,
            cache_capacity_bytes: 256 * u64::from(BS),
            checkpoint_interval: std::time::Duration::from_secs(3600),
            checkpoint_dirty_threshold: u64::MAX,
            fatal_action: FatalAction::Halt,
            ..EngineConfig::default()
        }
    }

    fn devices() -> Arc<DeviceSet> {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(BS, 2048));
        Arc::new(DeviceSet::from_devices(BS, [dev]).unwrap())
    }

    #[tokio::test]
    async fn test_requests_need_open_volume() {
        let vol = Volume::new(config(), devices(), Arc::new(MemLogStore::new())).unwrap();
        assert_eq!(vol.state(), VolumeState::Closed);
        assert!(matches!(vol.read(0, 1).await, Err(BlockError::NotOpen)));

        vol.open().await.unwrap();
        assert!(matches!(vol.open().await, Err(BlockError::AlreadyOpen)));
        assert_eq!(vol.state(), VolumeState::Open);
        vol.close().await.unwrap();
        assert!(matches!(vol.close().await, Err(BlockError::NotOpen)));
    }

    #[tokio::test]
    async fn test_rejects_mismatched_block_size() {
        let cfg = EngineConfig {
            block_size: 4096,
            ..config()
        };
        assert!(Volume::new(cfg, devices(), Arc::new(MemLogStore::new())).is_err());
    }

    #[tokio::test]
    async fn test_bounds_and_length_checks() {
        let vol = Volume::new(config(), devices(), Arc::new(MemLogStore::new())).unwrap();
        vol.open().await.unwrap();

        let err = vol.read(1020, 8).await.unwrap_err();
        assert!(matches!(err, BlockError::OutOfBounds { lba: 1020, nblks: 8, size: 1024 }));
        let err = vol.write(0, Bytes::from(vec![0u8; 100])).await.unwrap_err();
        assert!(matches!(err, BlockError::InvalidLength { len: 100, .. }));
        assert!(vol.write(0, Bytes::new()).await.is_err());
        assert!(vol.read(0, 0).await.is_err());
        vol.close().await.unwrap();
    }

    #[test]
    fn test_whole_blocks_never_truncates() {
        assert_eq!(whole_blocks(4 * BS as usize, BS).unwrap(), 4);
        assert!(matches!(
            whole_blocks(700, BS),
            Err(BlockError::InvalidLength { len: 700, nblks: 1, .. })
        ));

        // More blocks than a request can address
        let len = (u64::from(u32::MAX) + 2) as usize * BS as usize;
        let err = whole_blocks(len, BS).unwrap_err();
        assert!(matches!(
            err,
            BlockError::InvalidLength { nblks, .. } if nblks == u64::from(u32::MAX) + 2
        ));
    }

    #[tokio::test]
    async fn test_submit_write_reports_malformed_buffer() {
        let vol = Arc::new(Volume::new(config(), devices(), Arc::new(MemLogStore::new())).unwrap());
        vol.open().await.unwrap();

        let completion = vol
            .submit_write(0, Bytes::from(vec![0u8; 700]), |_| {})
            .wait()
            .await;
        assert_eq!(completion.nblks, 0);
        assert!(!completion.is_success());
        assert_eq!(vol.usage().unwrap().free_blocks, 2048);
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmap_frees_after_commit() {
        let vol = Volume::new(config(), devices(), Arc::new(MemLogStore::new())).unwrap();
        vol.open().await.unwrap();
        vol.write(10, Bytes::from(vec![7u8; 4 * BS as usize])).await.unwrap();

        assert_eq!(vol.unmap(8, 4).await.unwrap(), 2);
        let usage = vol.usage().unwrap();
        assert_eq!(usage.mapped_blocks, 2);
        assert_eq!(usage.pending_free_blocks, 2);

        let data = vol.read(10, 4).await.unwrap();
        assert!(data[..2 * BS as usize].iter().all(|&b| b == 0));
        assert!(data[2 * BS as usize..].iter().all(|&b| b == 7));

        vol.flush().await.unwrap();
        let usage = vol.usage().unwrap();
        assert_eq!(usage.pending_free_blocks, 0);
        assert_eq!(usage.free_blocks, 2048 - 2);
        assert_eq!(vol.mapped_extents().unwrap().len(), 1);
        vol.close().await.unwrap();
    }

    #[test]
    fn test_apply_replay_rejects_unknown_free() {
        let allocator = Arc::new(BlockAllocator::new(&[(RegionId(0), 16)], false));
        let mapping = MappingIndex::new(Arc::clone(&allocator));
        let plan = ReplayPlan {
            epochs: vec![(
                Epoch::new(1),
                vec![MetaRecord::Free {
                    epoch: Epoch::new(1),
                    block: lsvol_common::BlockId::new(RegionId(0), 3, 1),
                }],
            )],
            last_committed: Epoch::new(1),
            last_seen: Epoch::new(1),
            discarded: 0,
        };
        assert!(matches!(
            apply_replay(&plan, &mapping, &allocator),
            Err(BlockError::Recovery(_))
        ));
    }
}

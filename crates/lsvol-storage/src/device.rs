//! Physical block devices
//!
//! A [`BlockDevice`] addresses fixed-size blocks by block number and
//! completes every read and write asynchronously. Errors are terminal:
//! nothing at this layer retries. The [`DeviceSet`] binds each region id
//! to the device backing it and tags failures with the region.

use async_trait::async_trait;
use bytes::Bytes;
use lsvol_common::{BlockId, Error, RegionId, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Asynchronous block device
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Block size in bytes
    fn block_size(&self) -> u32;

    /// Capacity in blocks
    fn size_blocks(&self) -> u64;

    /// Read `nblks` blocks starting at block `offset`
    async fn submit_read(&self, offset: u64, nblks: u32) -> io::Result<Bytes>;

    /// Write whole blocks starting at block `offset`
    async fn submit_write(&self, offset: u64, data: Bytes) -> io::Result<()>;

    /// Make every acknowledged write durable
    async fn sync(&self) -> io::Result<()>;
}

fn check_range(dev: &dyn BlockDevice, offset: u64, nblks: u64) -> io::Result<()> {
    if offset + nblks > dev.size_blocks() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "blocks [{offset}, {}) beyond device end {}",
                offset + nblks,
                dev.size_blocks()
            ),
        ));
    }
    Ok(())
}

/// In-memory device with fault injection
///
/// Blocks are stored sparsely; a block never written reads as zeroes.
pub struct MemDevice {
    block_size: u32,
    size_blocks: u64,
    blocks: RwLock<HashMap<u64, Bytes>>,
    latency: Option<Duration>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl MemDevice {
    #[must_use]
    pub fn new(block_size: u32, size_blocks: u64) -> Self {
        Self {
            block_size,
            size_blocks,
            blocks: RwLock::new(HashMap::new()),
            latency: None,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// Delay every completion by `latency`
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make subsequent reads fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes and syncs fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of completed block reads
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of completed block writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    async fn submit_read(&self, offset: u64, nblks: u32) -> io::Result<Bytes> {
        self.delay().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected read failure"));
        }
        check_range(self, offset, u64::from(nblks))?;

        let bs = self.block_size as usize;
        let mut out = vec![0u8; nblks as usize * bs];
        let blocks = self.blocks.read();
        for (i, chunk) in out.chunks_mut(bs).enumerate() {
            if let Some(data) = blocks.get(&(offset + i as u64)) {
                chunk.copy_from_slice(data);
            }
        }
        self.reads.fetch_add(u64::from(nblks), Ordering::Relaxed);
        Ok(Bytes::from(out))
    }

    async fn submit_write(&self, offset: u64, data: Bytes) -> io::Result<()> {
        self.delay().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        let bs = self.block_size as usize;
        if data.len() % bs != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write of {} bytes is not block aligned", data.len()),
            ));
        }
        let nblks = (data.len() / bs) as u64;
        check_range(self, offset, nblks)?;

        let mut blocks = self.blocks.write();
        for i in 0..nblks as usize {
            blocks.insert(offset + i as u64, data.slice(i * bs..(i + 1) * bs));
        }
        self.writes.fetch_add(nblks, Ordering::Relaxed);
        Ok(())
    }

    async fn sync(&self) -> io::Result<()> {
        self.delay().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// File-backed device using positional I/O on the blocking pool
pub struct FileDevice {
    file: Arc<File>,
    path: PathBuf,
    block_size: u32,
    size_blocks: u64,
}

impl FileDevice {
    /// Open (creating and sizing if needed) a device file
    pub fn open(path: impl AsRef<Path>, block_size: u32, size_blocks: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = size_blocks * u64::from(block_size);
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        info!("opened device file {} ({} blocks)", path.display(), size_blocks);

        Ok(Self {
            file: Arc::new(file),
            path,
            block_size,
            size_blocks,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    async fn submit_read(&self, offset: u64, nblks: u32) -> io::Result<Bytes> {
        check_range(self, offset, u64::from(nblks))?;
        let file = Arc::clone(&self.file);
        let pos = offset * u64::from(self.block_size);
        let len = nblks as usize * self.block_size as usize;

        tokio::task::spawn_blocking(move || -> io::Result<Bytes> {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, pos)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn submit_write(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let bs = self.block_size as usize;
        if data.len() % bs != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write of {} bytes is not block aligned", data.len()),
            ));
        }
        check_range(self, offset, (data.len() / bs) as u64)?;
        let file = Arc::clone(&self.file);
        let pos = offset * u64::from(self.block_size);

        tokio::task::spawn_blocking(move || file.write_all_at(&data, pos))
            .await
            .map_err(io::Error::other)?
    }

    async fn sync(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(io::Error::other)?
    }
}

/// The devices backing a volume, one per region
pub struct DeviceSet {
    block_size: u32,
    devices: HashMap<RegionId, Arc<dyn BlockDevice>>,
}

impl DeviceSet {
    /// Create an empty set for devices of `block_size`
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            devices: HashMap::new(),
        }
    }

    /// Attach a device as `region`
    pub fn add(&mut self, region: RegionId, device: Arc<dyn BlockDevice>) -> Result<()> {
        if device.block_size() != self.block_size {
            return Err(Error::Configuration(format!(
                "device for {region} has block size {}, expected {}",
                device.block_size(),
                self.block_size
            )));
        }
        if self.devices.insert(region, device).is_some() {
            return Err(Error::Configuration(format!("{region} attached twice")));
        }
        debug!("attached device as {}", region);
        Ok(())
    }

    /// Build a set from devices numbered from region 0
    pub fn from_devices(
        block_size: u32,
        devices: impl IntoIterator<Item = Arc<dyn BlockDevice>>,
    ) -> Result<Self> {
        let mut set = Self::new(block_size);
        for (i, dev) in devices.into_iter().enumerate() {
            let region = u32::try_from(i)
                .map_err(|_| Error::Configuration("too many devices".into()))?;
            set.add(RegionId(region), dev)?;
        }
        Ok(set)
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// `(region, size_blocks)` pairs sorted by region id
    #[must_use]
    pub fn regions(&self) -> Vec<(RegionId, u64)> {
        let mut regions: Vec<_> = self
            .devices
            .iter()
            .map(|(id, dev)| (*id, dev.size_blocks()))
            .collect();
        regions.sort_unstable();
        regions
    }

    fn device(&self, region: RegionId) -> Result<&Arc<dyn BlockDevice>> {
        self.devices
            .get(&region)
            .ok_or(Error::RegionNotFound(region))
    }

    /// Read the blocks of `block`
    pub async fn read(&self, block: BlockId) -> Result<Bytes> {
        self.device(block.region)?
            .submit_read(block.offset, block.nblks)
            .await
            .map_err(|e| Error::device_io(block.region, block.offset, e))
    }

    /// Write `data` to the blocks starting at `block`
    pub async fn write(&self, region: RegionId, offset: u64, data: Bytes) -> Result<()> {
        self.device(region)?
            .submit_write(offset, data)
            .await
            .map_err(|e| Error::device_io(region, offset, e))
    }

    /// Sync every device
    pub async fn sync_all(&self) -> Result<()> {
        let syncs = self.devices.iter().map(|(region, dev)| async move {
            dev.sync().await.map_err(|e| Error::device_io(*region, 0, e))
        });
        futures::future::try_join_all(syncs).await?;
        Ok(())
    }
}

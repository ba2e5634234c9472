//! Metadata log store
//!
//! Durable, append-only storage for the records that make allocator and
//! mapping state recoverable. A batch handed to [`LogStore::append`] is
//! durable when the call returns. [`LogStore::replay`] yields every intact
//! record in append order. [`LogStore::rewrite`] atomically replaces the
//! whole log with a compacted equivalent; LSNs keep increasing across it.
//!
//! File record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```
//! Replay stops at the first record that is truncated or fails its
//! checksum; that tail is cut off when the file is reopened.

use async_trait::async_trait;
use bytes::Bytes;
use lsvol_common::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

const LOG_MAGIC: u32 = 0x4C53_4D4C; // "LSML"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// A record read back from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log sequence number, starting at 1
    pub lsn: u64,
    pub data: Bytes,
}

impl LogRecord {
    fn encode(lsn: u64, data: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&LOG_MAGIC.to_le_bytes());
        out.extend_from_slice(&lsn.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        let crc = crc32c::crc32c(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
    }

    /// Parse one record; `None` if the bytes do not hold an intact record
    fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let header = buf.get(..RECORD_HEADER_SIZE)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().ok()?);
        if magic != LOG_MAGIC {
            return None;
        }
        let lsn = u64::from_le_bytes(header[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(header[12..16].try_into().ok()?) as usize;

        let body_end = RECORD_HEADER_SIZE + len;
        let stored = u32::from_le_bytes(buf.get(body_end..body_end + 4)?.try_into().ok()?);
        if crc32c::crc32c(&buf[..body_end]) != stored {
            return None;
        }
        let data = Bytes::copy_from_slice(&buf[RECORD_HEADER_SIZE..body_end]);
        Some((Self { lsn, data }, body_end + 4))
    }
}

/// Durable append-only record store
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a batch of records; durable on return. Returns the last LSN.
    async fn append(&self, records: Vec<Bytes>) -> Result<u64>;

    /// Every intact record in append order
    async fn replay(&self) -> Result<Vec<LogRecord>>;

    /// Replace the contents with `records`; durable and atomic on return.
    /// Returns the last LSN.
    async fn rewrite(&self, records: Vec<Bytes>) -> Result<u64>;
}

/// Parse records from the start of `buf`, returning them and the length
/// of the intact prefix
fn scan(buf: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut pos = 0;
    while let Some((record, size)) = LogRecord::decode(&buf[pos..]) {
        records.push(record);
        pos += size;
    }
    (records, pos)
}

struct LogFile {
    file: File,
    next_lsn: u64,
}

/// Encode `records` with consecutive LSNs from `first`
fn encode_batch(first: u64, records: &[Bytes]) -> (Vec<u8>, u64) {
    let mut buf = Vec::new();
    let mut lsn = first;
    for record in records {
        LogRecord::encode(lsn, record, &mut buf);
        lsn += 1;
    }
    (buf, lsn)
}

/// File-backed log store
pub struct FileLogStore {
    path: PathBuf,
    inner: Arc<Mutex<LogFile>>,
}

impl FileLogStore {
    /// Open or create a log file, discarding any torn tail
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::log(format!("failed to open {}: {e}", path.display())))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| Error::log(format!("failed to read {}: {e}", path.display())))?;
        let (records, valid) = scan(&buf);

        if valid < buf.len() {
            warn!(
                "discarding {} trailing bytes of {}",
                buf.len() - valid,
                path.display()
            );
            file.set_len(valid as u64)
                .and_then(|()| file.sync_all())
                .map_err(|e| Error::log(format!("failed to truncate log: {e}")))?;
        }

        let next_lsn = records.last().map_or(1, |r| r.lsn + 1);
        info!(
            "opened metadata log {} ({} records)",
            path.display(),
            records.len()
        );

        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(LogFile { file, next_lsn })),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn append(&self, records: Vec<Bytes>) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut log = inner.lock();
            let (buf, lsn) = encode_batch(log.next_lsn, &records);
            let file = &mut log.file;
            file.write_all(&buf)
                .and_then(|()| file.sync_data())
                .map_err(|e| Error::log(format!("log append failed: {e}")))?;
            log.next_lsn = lsn;
            Ok(lsn - 1)
        })
        .await
        .map_err(|e| Error::internal(format!("log append task failed: {e}")))?
    }

    async fn replay(&self) -> Result<Vec<LogRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogRecord>> {
            let buf = std::fs::read(&path)
                .map_err(|e| Error::log(format!("failed to read {}: {e}", path.display())))?;
            Ok(scan(&buf).0)
        })
        .await
        .map_err(|e| Error::internal(format!("log replay task failed: {e}")))?
    }

    async fn rewrite(&self, records: Vec<Bytes>) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut log = inner.lock();
            let (buf, lsn) = encode_batch(log.next_lsn, &records);

            let mut tmp = path.clone().into_os_string();
            tmp.push(".compact");
            let tmp = PathBuf::from(tmp);
            {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp)
                    .map_err(|e| Error::log(format!("failed to create {}: {e}", tmp.display())))?;
                file.write_all(&buf)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| Error::log(format!("failed to write compacted log: {e}")))?;
            }

            // Atomic rename
            std::fs::rename(&tmp, &path)
                .map_err(|e| Error::log(format!("log rename failed: {e}")))?;
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                File::open(dir)
                    .and_then(|d| d.sync_all())
                    .map_err(|e| Error::log(format!("failed to sync {}: {e}", dir.display())))?;
            }

            // Reopen writer to new file
            log.file = OpenOptions::new()
                .read(true)
                .append(true)
                .open(&path)
                .map_err(|e| Error::log(format!("failed to reopen log: {e}")))?;
            log.next_lsn = lsn;
            Ok(lsn - 1)
        })
        .await
        .map_err(|e| Error::internal(format!("log rewrite task failed: {e}")))?
    }
}

/// In-memory log store
///
/// Share it through an `Arc` to keep its contents across a simulated
/// restart.
#[derive(Default)]
pub struct MemLogStore {
    records: Mutex<Vec<LogRecord>>,
    fail_appends: AtomicBool,
}

impl MemLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn append(&self, records: Vec<Bytes>) -> Result<u64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::log("injected append failure"));
        }
        let mut log = self.records.lock();
        let mut lsn = log.last().map_or(0, |r| r.lsn);
        for data in records {
            lsn += 1;
            log.push(LogRecord { lsn, data });
        }
        Ok(lsn)
    }

    async fn replay(&self) -> Result<Vec<LogRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn rewrite(&self, records: Vec<Bytes>) -> Result<u64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::log("injected rewrite failure"));
        }
        let mut log = self.records.lock();
        let mut lsn = log.last().map_or(0, |r| r.lsn);
        log.clear();
        for data in records {
            lsn += 1;
            log.push(LogRecord { lsn, data });
        }
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(items: &[&'static str]) -> Vec<Bytes> {
        items.iter().map(|s| Bytes::from_static(s.as_bytes())).collect()
    }

    #[tokio::test]
    async fn test_file_log_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.log");

        {
            let log = FileLogStore::open(&path).unwrap();
            assert_eq!(log.append(batch(&["a", "bb"])).await.unwrap(), 2);
            assert_eq!(log.append(batch(&["ccc"])).await.unwrap(), 3);
        }

        let log = FileLogStore::open(&path).unwrap();
        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].lsn, 3);
        assert_eq!(records[2].data, Bytes::from_static(b"ccc"));

        // LSNs continue after reopen
        assert_eq!(log.append(batch(&["d"])).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_file_log_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.log");

        {
            let log = FileLogStore::open(&path).unwrap();
            log.append(batch(&["keep", "torn"])).await.unwrap();
        }
        // Chop the last record in half
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 6).unwrap();
        drop(file);

        let log = FileLogStore::open(&path).unwrap();
        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, Bytes::from_static(b"keep"));

        assert_eq!(log.append(batch(&["next"])).await.unwrap(), 2);
        assert_eq!(log.replay().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_log_rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.log");

        {
            let log = FileLogStore::open(&path).unwrap();
            log.append(batch(&["a", "b", "c"])).await.unwrap();
            assert_eq!(log.rewrite(batch(&["snap"])).await.unwrap(), 4);
            assert_eq!(log.append(batch(&["d"])).await.unwrap(), 5);

            let records = log.replay().await.unwrap();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].data, Bytes::from_static(b"snap"));
        }
        assert!(!dir.path().join("meta.log.compact").exists());

        let log = FileLogStore::open(&path).unwrap();
        let lsns: Vec<_> = log.replay().await.unwrap().iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![4, 5]);
        assert_eq!(log.append(batch(&["e"])).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_mem_log_rewrite() {
        let log = MemLogStore::new();
        log.append(batch(&["x", "y"])).await.unwrap();
        assert_eq!(log.rewrite(batch(&["z"])).await.unwrap(), 3);
        assert_eq!(log.len(), 1);
        assert_eq!(log.replay().await.unwrap()[0].lsn, 3);
    }

    #[test]
    fn test_corrupt_record_stops_scan() {
        let mut buf = Vec::new();
        LogRecord::encode(1, b"first", &mut buf);
        let second = buf.len();
        LogRecord::encode(2, b"second", &mut buf);
        buf[second + RECORD_HEADER_SIZE] ^= 0xFF;

        let (records, valid) = scan(&buf);
        assert_eq!(records.len(), 1);
        assert_eq!(valid, second);
    }

    #[tokio::test]
    async fn test_mem_log_shared_across_restart() {
        let log = Arc::new(MemLogStore::new());
        let store: Arc<dyn LogStore> = log.clone();
        store.append(batch(&["x", "y"])).await.unwrap();
        drop(store);

        assert_eq!(log.replay().await.unwrap().len(), 2);

        log.fail_appends(true);
        assert!(log.append(batch(&["z"])).await.is_err());
        assert_eq!(log.len(), 2);
    }
}

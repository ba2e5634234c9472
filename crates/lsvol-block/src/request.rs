//! Volume request bookkeeping
//!
//! Requests in flight are tracked in a [`RequestTable`] addressed by
//! generation-checked [`RequestId`]s, so a stale id can never alias a
//! newer request that reused the slot. Completion is delivered through an
//! [`IoCompletion`], either to an awaited [`IoHandle`] or to a callback.
//!
//! A read that resolves to several physical ranges fans out into one
//! sub-read per range. The sub-reads share a [`ReadFanout`]; whichever
//! finishes last assembles the buffer and completes the request.

use crate::error::{BlockError, BlockResult};
use bytes::{Bytes, BytesMut};
use lsvol_common::{Epoch, Error, IoDirection};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Completion status of a volume request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    OutOfSpace,
    CacheFull,
    DeviceError,
    Timeout,
    Halted,
    InvalidRequest,
    Failed,
}

impl From<&BlockError> for IoStatus {
    fn from(err: &BlockError) -> Self {
        match err {
            BlockError::OutOfBounds { .. } | BlockError::InvalidLength { .. } => {
                Self::InvalidRequest
            }
            BlockError::Halted => Self::Halted,
            BlockError::Storage(e) => match e {
                Error::OutOfSpace { .. } => Self::OutOfSpace,
                Error::CacheFull { .. } => Self::CacheFull,
                Error::DeviceIo { .. } => Self::DeviceError,
                Error::Timeout => Self::Timeout,
                Error::Halted => Self::Halted,
                Error::InvalidBlock(_) => Self::InvalidRequest,
                _ => Self::Failed,
            },
            BlockError::NotOpen | BlockError::AlreadyOpen | BlockError::Recovery(_) => {
                Self::Failed
            }
        }
    }
}

/// Generation-checked index into a [`RequestTable`]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What is known about a request while it runs
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub direction: IoDirection,
    pub lba: u64,
    pub nblks: u32,
    /// Epoch the request was admitted into
    pub epoch: Epoch,
    pub started: Instant,
}

struct Slot {
    generation: u32,
    info: Option<RequestInfo>,
}

#[derive(Default)]
struct Slab {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// In-flight volume requests
#[derive(Default)]
pub struct RequestTable {
    inner: Mutex<Slab>,
}

impl RequestTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: RequestInfo) -> RequestId {
        let mut slab = self.inner.lock();
        slab.live += 1;
        if let Some(index) = slab.free.pop() {
            let slot = &mut slab.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.info = Some(info);
            return RequestId {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(slab.slots.len()).unwrap_or(u32::MAX);
        slab.slots.push(Slot {
            generation: 0,
            info: Some(info),
        });
        RequestId {
            index,
            generation: 0,
        }
    }

    /// Remove a request; stale ids are ignored
    pub fn remove(&self, id: RequestId) -> Option<RequestInfo> {
        let mut slab = self.inner.lock();
        let slot = slab.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let info = slot.info.take()?;
        slab.free.push(id.index);
        slab.live -= 1;
        Some(info)
    }

    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<RequestInfo> {
        let slab = self.inner.lock();
        slab.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.info.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live request, oldest slot first
    #[must_use]
    pub fn snapshot(&self) -> Vec<(RequestId, RequestInfo)> {
        let slab = self.inner.lock();
        slab.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let info = s.info.clone()?;
                let index = u32::try_from(i).ok()?;
                Some((
                    RequestId {
                        index,
                        generation: s.generation,
                    },
                    info,
                ))
            })
            .collect()
    }

    /// Register a request for the lifetime of the returned guard
    pub fn track(self: &Arc<Self>, info: RequestInfo) -> InFlight {
        let id = self.insert(info);
        InFlight {
            table: Arc::clone(self),
            id,
        }
    }
}

/// Table registration that ends when dropped
pub struct InFlight {
    table: Arc<RequestTable>,
    id: RequestId,
}

impl InFlight {
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// Outcome of a volume request as seen by its submitter
#[derive(Debug, Clone)]
pub struct IoCompletion {
    pub id: Option<RequestId>,
    pub direction: IoDirection,
    pub lba: u64,
    pub nblks: u32,
    pub status: IoStatus,
    /// Data read; empty for writes and failures
    pub data: Bytes,
    pub error: Option<String>,
    pub latency: Duration,
}

impl IoCompletion {
    pub(crate) fn new(
        id: Option<RequestId>,
        direction: IoDirection,
        lba: u64,
        nblks: u32,
        result: BlockResult<Bytes>,
        started: Instant,
    ) -> Self {
        let (status, data, error) = match result {
            Ok(data) => (IoStatus::Success, data, None),
            Err(e) => (IoStatus::from(&e), Bytes::new(), Some(e.to_string())),
        };
        Self {
            id,
            direction,
            lba,
            nblks,
            status,
            data,
            error,
            latency: started.elapsed(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == IoStatus::Success
    }
}

/// Awaitable completion of a submitted request
///
/// Dropping the handle does not cancel the request.
pub struct IoHandle {
    direction: IoDirection,
    lba: u64,
    nblks: u32,
    started: Instant,
    rx: oneshot::Receiver<IoCompletion>,
}

impl IoHandle {
    pub(crate) fn new(
        direction: IoDirection,
        lba: u64,
        nblks: u32,
    ) -> (oneshot::Sender<IoCompletion>, Self) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            direction,
            lba,
            nblks,
            started: Instant::now(),
            rx,
        };
        (tx, handle)
    }

    fn synthetic(&self, status: IoStatus, error: &str) -> IoCompletion {
        IoCompletion {
            id: None,
            direction: self.direction,
            lba: self.lba,
            nblks: self.nblks,
            status,
            data: Bytes::new(),
            error: Some(error.to_string()),
            latency: self.started.elapsed(),
        }
    }

    /// Wait for the request to complete
    pub async fn wait(mut self) -> IoCompletion {
        match (&mut self.rx).await {
            Ok(completion) => completion,
            Err(_) => self.synthetic(IoStatus::Failed, "request dropped without completing"),
        }
    }

    /// Wait at most `dur`
    ///
    /// On expiry a `Timeout` completion is returned while the request
    /// keeps running and still holds back its epoch's checkpoint.
    pub async fn wait_timeout(mut self, dur: Duration) -> IoCompletion {
        match tokio::time::timeout(dur, &mut self.rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => self.synthetic(IoStatus::Failed, "request dropped without completing"),
            Err(_) => self.synthetic(IoStatus::Timeout, "request timed out"),
        }
    }
}

/// Shared state of a read split across several physical ranges
pub struct ReadFanout {
    buf: Mutex<BytesMut>,
    remaining: AtomicUsize,
    failure: Mutex<Option<BlockError>>,
    done: Mutex<Option<oneshot::Sender<BlockResult<Bytes>>>>,
    block_size: usize,
}

impl ReadFanout {
    /// Zero-filled buffer of `nblks` awaiting `parts` sub-reads
    ///
    /// With no parts the receiver resolves immediately.
    pub fn new(
        nblks: u32,
        block_size: u32,
        parts: usize,
    ) -> (Arc<Self>, oneshot::Receiver<BlockResult<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        let len = nblks as usize * block_size as usize;
        let fanout = Arc::new(Self {
            buf: Mutex::new(BytesMut::zeroed(len)),
            remaining: AtomicUsize::new(parts),
            failure: Mutex::new(None),
            done: Mutex::new(Some(tx)),
            block_size: block_size as usize,
        });
        if parts == 0 {
            fanout.finish();
        }
        (fanout, rx)
    }

    /// Sub-reads still outstanding
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Deliver the sub-read placed `offset` blocks into the request
    pub fn complete_part(&self, offset: u32, result: BlockResult<Bytes>) {
        match result {
            Ok(data) => {
                let start = offset as usize * self.block_size;
                let mut buf = self.buf.lock();
                buf[start..start + data.len()].copy_from_slice(&data);
            }
            Err(e) => {
                let mut failure = self.failure.lock();
                if failure.is_none() {
                    *failure = Some(e);
                }
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let result = match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(std::mem::take(&mut *self.buf.lock()).freeze()),
        };
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(result);
        }
    }
}

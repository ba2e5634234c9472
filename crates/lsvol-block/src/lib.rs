//! lsvol Block - Logical volume layer
//!
//! This crate turns the physical layer of `lsvol-storage` into a
//! log-structured block volume.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │        Volume        │  read / write / unmap, completions
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐     ┌───────────────────┐
//! │    MappingIndex      │────▶│ CheckpointManager │  epochs, barrier,
//! │  LBA -> block ranges │     │                   │  commit, reclaim
//! └──────────┬───────────┘     └─────────┬─────────┘
//!            │                           │
//! ┌──────────▼───────────────────────────▼─────────┐
//! │   BlockStore (allocator + cache + devices)     │
//! │   LogStore (metadata records)                  │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Writes never overwrite in place: each write lands in freshly allocated
//! blocks and the mapping is updated afterwards. Superseded blocks are
//! reclaimed only once the epoch that superseded them has committed.

pub mod checkpoint;
pub mod error;
pub mod mapping;
pub mod metrics;
pub mod record;
pub mod request;
pub mod volume;

pub use checkpoint::{CheckpointManager, CheckpointStats, EpochGuard, EpochStamp, EpochState};
pub use error::{BlockError, BlockResult};
pub use mapping::{MapEntry, MappingIndex, RangeScan, Segment};
pub use metrics::{LatencyHistogram, LatencyPercentiles, MetricsSnapshot, VolumeMetrics};
pub use record::{EpochJournal, MetaRecord, ReplayPlan, plan_replay};
pub use request::{IoCompletion, IoHandle, IoStatus, RequestId, RequestInfo, RequestTable};
pub use volume::{Volume, VolumeState, VolumeUsage};

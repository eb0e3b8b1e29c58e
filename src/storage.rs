//! Interfaces consumed from the on-disk storage engine.
//!
//! Flush and compaction are opaque: the engine reports what they would buy
//! and performs them when asked.

use crate::tablet::TabletId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use thiserror::Error;

/// Work the engine could do for a tablet right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Bytes held in memory that a flush would persist.
    pub memtable_bytes: u64,
    /// Highest log index whose effects are persisted in compacted files.
    pub flushed_index: u64,
    pub sst_files: u64,
    pub compaction_input_bytes: u64,
    pub compaction_reclaimable_bytes: u64,
    /// Estimated read-latency improvement of a compaction, unitless.
    pub compaction_perf_improvement: f64,
}

/// Outcome of a flush or compaction as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOpReport {
    pub bytes_written: u64,
    pub bytes_reclaimed: u64,
}

/// Four-way on-disk size breakdown of a tablet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDiskSizeInfo {
    pub consensus_metadata_bytes: u64,
    pub wal_bytes: u64,
    pub sst_bytes: u64,
    pub uncompressed_sst_bytes: u64,
}

impl OnDiskSizeInfo {
    pub fn total_bytes(&self) -> u64 {
        self.consensus_metadata_bytes
            .saturating_add(self.wal_bytes)
            .saturating_add(self.sst_bytes)
    }
}

impl AddAssign for OnDiskSizeInfo {
    fn add_assign(&mut self, other: Self) {
        self.consensus_metadata_bytes = self
            .consensus_metadata_bytes
            .saturating_add(other.consensus_metadata_bytes);
        self.wal_bytes = self.wal_bytes.saturating_add(other.wal_bytes);
        self.sst_bytes = self.sst_bytes.saturating_add(other.sst_bytes);
        self.uncompressed_sst_bytes = self
            .uncompressed_sst_bytes
            .saturating_add(other.uncompressed_sst_bytes);
    }
}

impl fmt::Display for OnDiskSizeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} consensus_metadata={} wal={} sst={} sst_uncompressed={}",
            self.total_bytes(),
            self.consensus_metadata_bytes,
            self.wal_bytes,
            self.sst_bytes,
            self.uncompressed_sst_bytes
        )
    }
}

/// One row of a point-in-time tablet snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub trait StorageEngine: Send + Sync {
    fn stats(&self, tablet: &TabletId) -> Option<StorageStats>;

    fn flush(&self, tablet: &TabletId) -> Result<StorageOpReport, StorageEngineError>;

    fn compact(&self, tablet: &TabletId) -> Result<StorageOpReport, StorageEngineError>;

    /// `None` while the engine cannot estimate (e.g. mid-bootstrap).
    fn disk_size(&self, tablet: &TabletId) -> Option<OnDiskSizeInfo>;

    fn snapshot_rows(&self, tablet: &TabletId) -> Result<Vec<SnapshotRow>, StorageEngineError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageEngineError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("corruption detected in {file}: {detail}")]
    Corruption { file: String, detail: String },
    #[error("tablet {0} has no storage attached")]
    Detached(TabletId),
}

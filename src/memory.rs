//! In-memory implementations of the consensus and storage collaborators,
//! used by tests and by the `retention-sim` binary.

use crate::anchor::AnchorMetadata;
use crate::consensus::{ConsensusError, ConsensusLog, LogEntry, OpId, PeerRole};
use crate::storage::{
    OnDiskSizeInfo, SnapshotRow, StorageEngine, StorageEngineError, StorageOpReport, StorageStats,
};
use crate::tablet::TabletId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Per-entry framing overhead counted towards WAL size.
const ENTRY_OVERHEAD_BYTES: u64 = 16;

#[derive(Debug)]
struct TabletLog {
    role: PeerRole,
    entries: VecDeque<LogEntry>,
    committed: OpId,
    truncated_before: u64,
    metadata: Option<AnchorMetadata>,
}

impl Default for TabletLog {
    fn default() -> Self {
        Self {
            role: PeerRole::Unknown,
            entries: VecDeque::new(),
            committed: OpId::MIN,
            truncated_before: 0,
            metadata: None,
        }
    }
}

fn entry_bytes(entry: &LogEntry) -> u64 {
    entry.payload.len() as u64 + ENTRY_OVERHEAD_BYTES
}

#[derive(Debug, Default)]
pub struct InMemoryConsensus {
    logs: Mutex<HashMap<TabletId, TabletLog>>,
    fail_metadata_writes: AtomicBool,
    metadata_writes: AtomicU64,
}

impl InMemoryConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_role(&self, tablet: &TabletId, role: PeerRole) {
        self.logs.lock().entry(tablet.clone()).or_default().role = role;
    }

    /// Moves the committed position without materialising entries.
    pub fn set_committed(&self, tablet: &TabletId, op_id: OpId) {
        self.logs.lock().entry(tablet.clone()).or_default().committed = op_id;
    }

    /// Appends and commits one entry in `term`.
    pub fn append(&self, tablet: &TabletId, term: u64, payload: Vec<u8>) -> OpId {
        let mut logs = self.logs.lock();
        let log = logs.entry(tablet.clone()).or_default();
        let index = log
            .entries
            .back()
            .map(|entry| entry.op_id.index)
            .unwrap_or(log.committed.index)
            .max(log.committed.index)
            + 1;
        let op_id = OpId::new(term, index);
        log.entries.push_back(LogEntry { op_id, payload });
        log.committed = op_id;
        op_id
    }

    /// Appends `count` entries whose payload is their index rendered as text.
    pub fn append_many(&self, tablet: &TabletId, term: u64, count: usize) -> OpId {
        let mut last = self.committed_or_min(tablet);
        for _ in 0..count {
            let next = last.index + 1;
            last = self.append(tablet, term, format!("row-{next}").into_bytes());
        }
        last
    }

    pub fn fail_metadata_writes(&self, fail: bool) {
        self.fail_metadata_writes.store(fail, Ordering::SeqCst);
    }

    pub fn metadata_writes(&self) -> u64 {
        self.metadata_writes.load(Ordering::SeqCst)
    }

    pub fn truncated_before(&self, tablet: &TabletId) -> u64 {
        self.logs
            .lock()
            .get(tablet)
            .map(|log| log.truncated_before)
            .unwrap_or(0)
    }

    fn committed_or_min(&self, tablet: &TabletId) -> OpId {
        self.logs
            .lock()
            .get(tablet)
            .map(|log| log.committed)
            .unwrap_or(OpId::MIN)
    }
}

impl ConsensusLog for InMemoryConsensus {
    fn role(&self, tablet: &TabletId) -> PeerRole {
        self.logs
            .lock()
            .get(tablet)
            .map(|log| log.role)
            .unwrap_or(PeerRole::Unknown)
    }

    fn committed_op_id(&self, tablet: &TabletId) -> Result<OpId, ConsensusError> {
        Ok(self.committed_or_min(tablet))
    }

    fn read_committed(
        &self,
        tablet: &TabletId,
        after: u64,
        max_entries: usize,
    ) -> Result<Vec<LogEntry>, ConsensusError> {
        let logs = self.logs.lock();
        let Some(log) = logs.get(tablet) else {
            return Ok(Vec::new());
        };
        if after.saturating_add(1) < log.truncated_before {
            return Err(ConsensusError::Truncated {
                requested: after + 1,
                first_retained: log.truncated_before,
            });
        }
        Ok(log
            .entries
            .iter()
            .filter(|entry| entry.op_id.index > after && entry.op_id.index <= log.committed.index)
            .take(max_entries)
            .cloned()
            .collect())
    }

    fn wal_bytes_before(&self, tablet: &TabletId, index: u64) -> u64 {
        self.logs
            .lock()
            .get(tablet)
            .map(|log| {
                log.entries
                    .iter()
                    .filter(|entry| entry.op_id.index < index)
                    .map(entry_bytes)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn truncate_log_before(&self, tablet: &TabletId, index: u64) -> Result<u64, ConsensusError> {
        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(tablet)
            .ok_or_else(|| ConsensusError::UnknownTablet(tablet.clone()))?;
        let mut released = 0;
        while log
            .entries
            .front()
            .is_some_and(|entry| entry.op_id.index < index)
        {
            if let Some(entry) = log.entries.pop_front() {
                released += entry_bytes(&entry);
            }
        }
        log.truncated_before = log.truncated_before.max(index);
        Ok(released)
    }

    fn append_anchor_metadata(
        &self,
        tablet: &TabletId,
        metadata: &AnchorMetadata,
    ) -> Result<(), ConsensusError> {
        if self.fail_metadata_writes.load(Ordering::SeqCst) {
            return Err(ConsensusError::Io("metadata write rejected".into()));
        }
        self.logs.lock().entry(tablet.clone()).or_default().metadata = Some(metadata.clone());
        self.metadata_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_anchor_metadata(
        &self,
        tablet: &TabletId,
    ) -> Result<Option<AnchorMetadata>, ConsensusError> {
        Ok(self
            .logs
            .lock()
            .get(tablet)
            .and_then(|log| log.metadata.clone()))
    }
}

#[derive(Debug, Default)]
struct TabletStore {
    stats: StorageStats,
    disk_size: Option<OnDiskSizeInfo>,
    rows: Vec<SnapshotRow>,
    /// Index that becomes `flushed_index` once the memtable is flushed.
    written_index: u64,
    injected_failures: VecDeque<StorageEngineError>,
    flushes: u64,
    compactions: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tablets: Mutex<HashMap<TabletId, TabletStore>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stats(&self, tablet: &TabletId, stats: StorageStats) {
        self.tablets.lock().entry(tablet.clone()).or_default().stats = stats;
    }

    pub fn update_stats(&self, tablet: &TabletId, update: impl FnOnce(&mut StorageStats)) {
        update(&mut self.tablets.lock().entry(tablet.clone()).or_default().stats);
    }

    pub fn set_disk_size(&self, tablet: &TabletId, size: Option<OnDiskSizeInfo>) {
        self.tablets.lock().entry(tablet.clone()).or_default().disk_size = size;
    }

    pub fn set_rows(&self, tablet: &TabletId, rows: Vec<SnapshotRow>) {
        self.tablets.lock().entry(tablet.clone()).or_default().rows = rows;
    }

    /// Records writes up to `index` in the memtable.
    pub fn record_write(&self, tablet: &TabletId, index: u64, bytes: u64) {
        let mut tablets = self.tablets.lock();
        let store = tablets.entry(tablet.clone()).or_default();
        store.written_index = store.written_index.max(index);
        store.stats.memtable_bytes = store.stats.memtable_bytes.saturating_add(bytes);
    }

    /// The next flush or compaction of `tablet` fails with `error`.
    pub fn inject_failure(&self, tablet: &TabletId, error: StorageEngineError) {
        self.tablets
            .lock()
            .entry(tablet.clone())
            .or_default()
            .injected_failures
            .push_back(error);
    }

    pub fn flush_count(&self, tablet: &TabletId) -> u64 {
        self.tablets.lock().get(tablet).map(|s| s.flushes).unwrap_or(0)
    }

    pub fn compaction_count(&self, tablet: &TabletId) -> u64 {
        self.tablets
            .lock()
            .get(tablet)
            .map(|s| s.compactions)
            .unwrap_or(0)
    }
}

impl StorageEngine for InMemoryStorage {
    fn stats(&self, tablet: &TabletId) -> Option<StorageStats> {
        self.tablets.lock().get(tablet).map(|store| store.stats.clone())
    }

    fn flush(&self, tablet: &TabletId) -> Result<StorageOpReport, StorageEngineError> {
        let mut tablets = self.tablets.lock();
        let store = tablets
            .get_mut(tablet)
            .ok_or_else(|| StorageEngineError::Detached(tablet.clone()))?;
        if let Some(err) = store.injected_failures.pop_front() {
            return Err(err);
        }
        let written = store.stats.memtable_bytes;
        store.stats.memtable_bytes = 0;
        store.stats.flushed_index = store.stats.flushed_index.max(store.written_index);
        store.stats.sst_files += 1;
        store.flushes += 1;
        if let Some(size) = store.disk_size.as_mut() {
            size.sst_bytes = size.sst_bytes.saturating_add(written);
            size.uncompressed_sst_bytes = size.uncompressed_sst_bytes.saturating_add(written * 2);
        }
        Ok(StorageOpReport {
            bytes_written: written,
            bytes_reclaimed: 0,
        })
    }

    fn compact(&self, tablet: &TabletId) -> Result<StorageOpReport, StorageEngineError> {
        let mut tablets = self.tablets.lock();
        let store = tablets
            .get_mut(tablet)
            .ok_or_else(|| StorageEngineError::Detached(tablet.clone()))?;
        if let Some(err) = store.injected_failures.pop_front() {
            return Err(err);
        }
        let reclaimed = store.stats.compaction_reclaimable_bytes;
        let written = store
            .stats
            .compaction_input_bytes
            .saturating_sub(reclaimed);
        store.stats.compaction_input_bytes = 0;
        store.stats.compaction_reclaimable_bytes = 0;
        store.stats.compaction_perf_improvement = 0.0;
        store.stats.sst_files = store.stats.sst_files.min(1);
        store.compactions += 1;
        if let Some(size) = store.disk_size.as_mut() {
            size.sst_bytes = size.sst_bytes.saturating_sub(reclaimed);
        }
        Ok(StorageOpReport {
            bytes_written: written,
            bytes_reclaimed: reclaimed,
        })
    }

    fn disk_size(&self, tablet: &TabletId) -> Option<OnDiskSizeInfo> {
        self.tablets.lock().get(tablet).and_then(|store| store.disk_size)
    }

    fn snapshot_rows(&self, tablet: &TabletId) -> Result<Vec<SnapshotRow>, StorageEngineError> {
        Ok(self
            .tablets
            .lock()
            .get(tablet)
            .map(|store| store.rows.clone())
            .unwrap_or_default())
    }
}

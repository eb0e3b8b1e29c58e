use super::{Checkpoint, StreamId, StreamOptions, StreamState};
use crate::durability::{DurabilityLogError, JsonLinesLog};
use crate::tablet::TabletId;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletCheckpoint {
    pub tablet: TabletId,
    pub checkpoint: Checkpoint,
}

/// Everything needed to rebuild a stream after restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStream {
    pub id: StreamId,
    pub options: StreamOptions,
    pub state: StreamState,
    pub created_at_ms: u64,
    pub checkpoints: Vec<TabletCheckpoint>,
}

impl PersistedStream {
    fn apply_checkpoint(&mut self, tablet: &TabletId, checkpoint: &Checkpoint) {
        match self
            .checkpoints
            .iter_mut()
            .find(|entry| &entry.tablet == tablet)
        {
            Some(entry) => entry.checkpoint = checkpoint.clone(),
            None => self.checkpoints.push(TabletCheckpoint {
                tablet: tablet.clone(),
                checkpoint: checkpoint.clone(),
            }),
        }
    }
}

/// Durable home of stream definitions and checkpoints. Every call returns
/// only once the write is durable.
pub trait CheckpointStore: Send + Sync + fmt::Debug {
    fn record_stream(&self, stream: &PersistedStream) -> Result<(), CheckpointStoreError>;
    fn record_checkpoint(
        &self,
        stream: &StreamId,
        tablet: &TabletId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointStoreError>;
    fn record_state(&self, stream: &StreamId, state: StreamState)
        -> Result<(), CheckpointStoreError>;
    fn load(&self) -> Result<Vec<PersistedStream>, CheckpointStoreError>;
}

#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error(transparent)]
    Log(#[from] DurabilityLogError),
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    #[error("checkpoint store rejected write: {0}")]
    Rejected(String),
}

#[derive(Debug, Default)]
struct StreamTable {
    streams: BTreeMap<StreamId, PersistedStream>,
}

impl StreamTable {
    fn apply(&mut self, entry: StoreEntry) -> Result<(), CheckpointStoreError> {
        match entry {
            StoreEntry::Stream(stream) => {
                self.streams.insert(stream.id.clone(), stream);
            }
            StoreEntry::Checkpoint {
                stream,
                tablet,
                checkpoint,
            } => {
                self.streams
                    .get_mut(&stream)
                    .ok_or(CheckpointStoreError::UnknownStream(stream))?
                    .apply_checkpoint(&tablet, &checkpoint);
            }
            StoreEntry::State { stream, state } => {
                self.streams
                    .get_mut(&stream)
                    .ok_or(CheckpointStoreError::UnknownStream(stream))?
                    .state = state;
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<PersistedStream> {
        self.streams.values().cloned().collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    table: Mutex<StreamTable>,
    fail_writes: AtomicBool,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write(&self, entry: StoreEntry) -> Result<(), CheckpointStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointStoreError::Rejected("writes disabled".into()));
        }
        self.table.lock().apply(entry)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn record_stream(&self, stream: &PersistedStream) -> Result<(), CheckpointStoreError> {
        self.write(StoreEntry::Stream(stream.clone()))
    }

    fn record_checkpoint(
        &self,
        stream: &StreamId,
        tablet: &TabletId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointStoreError> {
        self.write(StoreEntry::Checkpoint {
            stream: stream.clone(),
            tablet: tablet.clone(),
            checkpoint: checkpoint.clone(),
        })
    }

    fn record_state(
        &self,
        stream: &StreamId,
        state: StreamState,
    ) -> Result<(), CheckpointStoreError> {
        self.write(StoreEntry::State {
            stream: stream.clone(),
            state,
        })
    }

    fn load(&self) -> Result<Vec<PersistedStream>, CheckpointStoreError> {
        Ok(self.table.lock().snapshot())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoreEntry {
    Stream(PersistedStream),
    Checkpoint {
        stream: StreamId,
        tablet: TabletId,
        checkpoint: Checkpoint,
    },
    State {
        stream: StreamId,
        state: StreamState,
    },
}

/// Checkpoint store backed by a JSON-lines log with `fdatasync` per write.
/// The full table is rebuilt from the log on open.
pub struct FileCheckpointStore {
    path: PathBuf,
    inner: Mutex<FileStoreInner>,
}

struct FileStoreInner {
    log: JsonLinesLog<StoreEntry>,
    table: StreamTable,
}

impl FileCheckpointStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointStoreError> {
        let path = path.into();
        let mut log = JsonLinesLog::open(&path)?;
        let mut table = StreamTable::default();
        let entries = log.read_all()?;
        let replayed = entries.len();
        for entry in entries {
            if let Err(err) = table.apply(entry) {
                warn!(
                    "event=checkpoint_replay_entry_skipped path={} error={}",
                    path.display(),
                    err
                );
            }
        }
        info!(
            "event=checkpoint_store_opened path={} entries={} streams={}",
            path.display(),
            replayed,
            table.streams.len()
        );
        Ok(Self {
            path,
            inner: Mutex::new(FileStoreInner { log, table }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, entry: StoreEntry) -> Result<(), CheckpointStoreError> {
        let mut inner = self.inner.lock();
        if let StoreEntry::Checkpoint { stream, .. } | StoreEntry::State { stream, .. } = &entry {
            if !inner.table.streams.contains_key(stream) {
                return Err(CheckpointStoreError::UnknownStream(stream.clone()));
            }
        }
        inner.log.append(&entry)?;
        inner.table.apply(entry)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn record_stream(&self, stream: &PersistedStream) -> Result<(), CheckpointStoreError> {
        self.write(StoreEntry::Stream(stream.clone()))
    }

    fn record_checkpoint(
        &self,
        stream: &StreamId,
        tablet: &TabletId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointStoreError> {
        self.write(StoreEntry::Checkpoint {
            stream: stream.clone(),
            tablet: tablet.clone(),
            checkpoint: checkpoint.clone(),
        })
    }

    fn record_state(
        &self,
        stream: &StreamId,
        state: StreamState,
    ) -> Result<(), CheckpointStoreError> {
        self.write(StoreEntry::State {
            stream: stream.clone(),
            state,
        })
    }

    fn load(&self) -> Result<Vec<PersistedStream>, CheckpointStoreError> {
        Ok(self.inner.lock().table.snapshot())
    }
}

impl fmt::Debug for FileCheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCheckpointStore")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OpId;
    use crate::tablet::TabletScope;
    use tempfile::tempdir;

    fn stream(id: &str) -> PersistedStream {
        PersistedStream {
            id: StreamId::new(id),
            options: StreamOptions::new(TabletScope::Namespace("shop".into())),
            state: StreamState::Active,
            created_at_ms: 5,
            checkpoints: vec![TabletCheckpoint {
                tablet: TabletId::new("t1"),
                checkpoint: Checkpoint::new(OpId::new(1, 10), 5),
            }],
        }
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cdc").join("checkpoints.log");
        {
            let store = FileCheckpointStore::open(&path).unwrap();
            store.record_stream(&stream("s1")).unwrap();
            store
                .record_checkpoint(
                    &StreamId::new("s1"),
                    &TabletId::new("t1"),
                    &Checkpoint::new(OpId::new(2, 40), 9),
                )
                .unwrap();
            store
                .record_state(&StreamId::new("s1"), StreamState::Draining)
                .unwrap();
        }
        let store = FileCheckpointStore::open(&path).unwrap();
        let streams = store.load().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].state, StreamState::Draining);
        assert_eq!(streams[0].checkpoints[0].checkpoint.op_id, OpId::new(2, 40));
    }

    #[test]
    fn writes_for_unknown_streams_are_rejected() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoints.log")).unwrap();
        assert!(matches!(
            store.record_state(&StreamId::new("ghost"), StreamState::Deleted),
            Err(CheckpointStoreError::UnknownStream(_))
        ));
    }

    #[test]
    fn in_memory_store_can_refuse_writes() {
        let store = InMemoryCheckpointStore::new();
        store.fail_writes(true);
        assert!(matches!(
            store.record_stream(&stream("s1")),
            Err(CheckpointStoreError::Rejected(_))
        ));
        store.fail_writes(false);
        store.record_stream(&stream("s1")).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }
}

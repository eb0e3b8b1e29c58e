//! Change-data-capture streams: checkpoints per (stream, tablet), the
//! anchors they hold, and the poll/acknowledge protocol.

pub mod checkpoint;
pub mod service;
pub mod store;
pub mod stream;

pub use checkpoint::{
    decode_resume_cursor, encode_resume_cursor, ChangeRecord, Checkpoint, PollResponse, RecordKind,
};
pub use service::{CdcService, StreamStatus, TabletStreamStatus};
pub use store::{
    CheckpointStore, CheckpointStoreError, FileCheckpointStore, InMemoryCheckpointStore,
    PersistedStream, TabletCheckpoint,
};
pub use stream::{
    CheckpointType, RecordFormat, RecordType, SourceType, StreamId, StreamInfo, StreamOptions,
    StreamState,
};

use crate::anchor::AnchorError;
use crate::consensus::{ConsensusError, OpId, PeerRole};
use crate::storage::StorageEngineError;
use crate::tablet::{TabletError, TabletId, TabletState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdcError {
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),
    #[error("stream {stream} is {state}, not ACTIVE")]
    StreamNotActive { stream: StreamId, state: StreamState },
    #[error("tablet {tablet} is not part of stream {stream}")]
    TabletNotInStream { stream: StreamId, tablet: TabletId },
    #[error("tablet {tablet} not ready (state {state})")]
    TabletNotReady { tablet: TabletId, state: TabletState },
    /// The stream is stalled on this tablet until it is recovered or
    /// re-replicated.
    #[error("tablet {0} failed")]
    TabletFailed(TabletId),
    #[error("replica of tablet {tablet} is {role}, not LEADER")]
    NotLeader { tablet: TabletId, role: PeerRole },
    #[error("stale ack for stream {stream} tablet {tablet}: {requested} < checkpoint {current}")]
    StaleAck {
        stream: StreamId,
        tablet: TabletId,
        current: OpId,
        requested: OpId,
    },
    #[error("ack for stream {stream} tablet {tablet} at {requested} beyond committed {committed}")]
    AckBeyondCommitted {
        stream: StreamId,
        tablet: TabletId,
        requested: OpId,
        committed: OpId,
    },
    #[error("stream creation for {scope} failed: {source}")]
    StreamCreateFailed {
        scope: String,
        #[source]
        source: Box<CdcError>,
    },
    #[error("invalid resume cursor {0:?}")]
    InvalidCursor(String),
    #[error("log read aborted: {0}")]
    ReadAborted(String),
    #[error(transparent)]
    Tablet(TabletError),
    #[error(transparent)]
    Anchor(AnchorError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Storage(#[from] StorageEngineError),
    #[error(transparent)]
    Store(#[from] CheckpointStoreError),
}

impl CdcError {
    /// Conditions a consumer should retry (with backoff, or against another
    /// replica for `NotLeader`).
    pub fn is_retryable(&self) -> bool {
        match self {
            CdcError::TabletNotReady { .. }
            | CdcError::TabletFailed(_)
            | CdcError::NotLeader { .. }
            | CdcError::ReadAborted(_) => true,
            CdcError::StreamCreateFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<TabletError> for CdcError {
    fn from(err: TabletError) -> Self {
        match err {
            TabletError::NotReady { tablet, state } => CdcError::TabletNotReady { tablet, state },
            TabletError::Failed(tablet) => CdcError::TabletFailed(tablet),
            TabletError::Consensus(err) => CdcError::Consensus(err),
            other => CdcError::Tablet(other),
        }
    }
}

impl From<AnchorError> for CdcError {
    fn from(err: AnchorError) -> Self {
        match err {
            AnchorError::Tablet(err) => CdcError::from(err),
            other => CdcError::Anchor(other),
        }
    }
}

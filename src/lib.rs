//! Log retention and change-capture coordination for Raft-replicated tablets.
//!
//! A tablet server hosts many tablets. Each one keeps a replicated log that
//! is truncated by background maintenance once the storage engine has
//! persisted its effects, unless a consumer such as a CDC stream still holds
//! an anchor on it. [`RetentionContext`] wires the pieces together.

pub mod anchor;
pub mod cdc;
pub mod config;
pub mod consensus;
pub mod context;
pub mod durability;
pub mod maintenance;
pub mod memory;
pub mod status;
pub mod storage;
pub mod tablet;
pub mod telemetry;
pub mod util;

pub use anchor::{AnchorError, LogAnchor, LogAnchorRegistry, TruncationDecision};
pub use cdc::{
    CdcError, CdcService, ChangeRecord, Checkpoint, CheckpointStore, CheckpointStoreError,
    CheckpointType, FileCheckpointStore, InMemoryCheckpointStore, PollResponse, RecordKind,
    RecordType, StreamId, StreamInfo, StreamOptions, StreamState, StreamStatus,
};
pub use config::{CdcConfig, ConfigError, MaintenanceConfig, RetentionConfig};
pub use consensus::{ConsensusError, ConsensusLog, LogEntry, OpId, PeerRole};
pub use context::RetentionContext;
pub use maintenance::{
    MaintenanceError, MaintenanceManager, MaintenanceManagerStatus, MaintenanceOp,
    MaintenanceOpKind,
};
pub use memory::{InMemoryConsensus, InMemoryStorage};
pub use status::{TableSummaries, TableSummary, TabletDetails, TabletStatusAggregator};
pub use storage::{OnDiskSizeInfo, SnapshotRow, StorageEngine, StorageEngineError, StorageStats};
pub use tablet::{
    TableId, TabletDescriptor, TabletError, TabletId, TabletManager, TabletScope, TabletState,
};
pub use telemetry::{MetricsSnapshot, SharedMetricsRegistry};
pub use util::{Clock, ManualClock, RetentionError, SharedClock, SystemClock};

//! Background maintenance: flush, compaction and log GC under a bounded
//! concurrency budget, with log GC admitted through the anchor registry.

pub mod op;
pub mod scheduler;
pub mod status;

pub use op::{MaintenanceOp, MaintenanceOpKind, OpEnv, OpEstimate, OpReport};
pub use scheduler::{AdmittedOp, MaintenanceManager};
pub use status::{
    CompletedOp, CompletedOpStatus, MaintenanceManagerStatus, OpOutcome, RegisteredOpStatus,
    RunningOpStatus,
};

use crate::anchor::AnchorError;
use crate::consensus::ConsensusError;
use crate::storage::StorageEngineError;
use crate::tablet::TabletId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpFailureCause {
    #[error(transparent)]
    Storage(#[from] StorageEngineError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MaintenanceError {
    /// Isolated to the one op; siblings keep running.
    #[error("maintenance op {op} on tablet {tablet} failed: {source}")]
    MaintenanceOpFailed {
        op: String,
        tablet: TabletId,
        #[source]
        source: OpFailureCause,
    },
    #[error("log gc on tablet {tablet} would truncate to {target} past anchor floor {floor}")]
    FloorViolated {
        tablet: TabletId,
        target: u64,
        floor: u64,
    },
    #[error(transparent)]
    Anchor(#[from] AnchorError),
}

//! Tablet identity, lifecycle state machine and the local tablet arena.

pub mod lifecycle;
pub mod manager;

pub use lifecycle::{TabletLifecycle, TabletState};
pub use manager::{
    PartitionBounds, TabletDescriptor, TabletManager, TabletPeerSnapshot, TabletResolver,
    TabletScope,
};

use crate::consensus::ConsensusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletId(String);

impl TabletId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabletId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(String);

impl TableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TabletError {
    #[error("tablet {0} not found")]
    NotFound(TabletId),
    #[error("tablet {0} already registered")]
    AlreadyRegistered(TabletId),
    #[error("tablet {tablet} not ready (state {state})")]
    NotReady { tablet: TabletId, state: TabletState },
    #[error("tablet {0} failed; streams against it are stalled")]
    Failed(TabletId),
    #[error("illegal transition for tablet {tablet}: {from} -> {to}")]
    IllegalTransition {
        tablet: TabletId,
        from: TabletState,
        to: TabletState,
    },
    #[error("no tablets match scope {0}")]
    EmptyScope(String),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

impl TabletError {
    /// Not-ready and failed tablets may recover (restart, re-bootstrap, new
    /// replica); everything else is a caller or state error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TabletError::NotReady { .. } | TabletError::Failed(_))
    }
}

//! Interfaces consumed from the consensus layer.
//!
//! Leader election and log replication are a black box here; the crate only
//! needs the local replica's role, the committed position, committed entries
//! and a place to persist anchor metadata next to the consensus metadata.

use crate::anchor::AnchorMetadata;
use crate::tablet::TabletId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Position of an entry in a tablet's replicated log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.term.cmp(&other.term))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Leader,
    Follower,
    Learner,
    Unknown,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Leader => "LEADER",
            PeerRole::Follower => "FOLLOWER",
            PeerRole::Learner => "LEARNER",
            PeerRole::Unknown => "UNKNOWN_ROLE",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed write as read back from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op_id: OpId,
    pub payload: Vec<u8>,
}

pub trait ConsensusLog: Send + Sync {
    fn role(&self, tablet: &TabletId) -> PeerRole;

    fn committed_op_id(&self, tablet: &TabletId) -> Result<OpId, ConsensusError>;

    /// Committed entries with `index > after`, in log order, at most
    /// `max_entries` of them.
    fn read_committed(
        &self,
        tablet: &TabletId,
        after: u64,
        max_entries: usize,
    ) -> Result<Vec<LogEntry>, ConsensusError>;

    /// Bytes of WAL holding entries below `index`.
    fn wal_bytes_before(&self, tablet: &TabletId, index: u64) -> u64;

    /// Discards entries below `index`; returns the number of bytes released.
    fn truncate_log_before(&self, tablet: &TabletId, index: u64) -> Result<u64, ConsensusError>;

    fn append_anchor_metadata(
        &self,
        tablet: &TabletId,
        metadata: &AnchorMetadata,
    ) -> Result<(), ConsensusError>;

    fn load_anchor_metadata(
        &self,
        tablet: &TabletId,
    ) -> Result<Option<AnchorMetadata>, ConsensusError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("tablet {0} unknown to consensus")]
    UnknownTablet(TabletId),
    #[error("log entries below {requested} already truncated (first retained {first_retained})")]
    Truncated { requested: u64, first_retained: u64 },
    #[error("consensus I/O error: {0}")]
    Io(String),
}

use crate::tablet::{TabletId, TabletScope};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 16 random bytes, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointType {
    /// The consumer acknowledges progress.
    Explicit,
    /// Progress advances as soon as a poll hands records to the transport.
    Implicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Change,
    /// One snapshot of the tablet before its change records.
    All,
}

/// Serialization selector, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFormat(pub String);

impl Default for RecordFormat {
    fn default() -> Self {
        Self("proto".into())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    #[default]
    Cdcsdk,
    Xcluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub checkpoint_type: CheckpointType,
    pub record_type: RecordType,
    pub record_format: RecordFormat,
    #[serde(default)]
    pub source_type: SourceType,
    pub scope: TabletScope,
}

impl StreamOptions {
    pub fn new(scope: TabletScope) -> Self {
        Self {
            checkpoint_type: CheckpointType::Explicit,
            record_type: RecordType::Change,
            record_format: RecordFormat::default(),
            source_type: SourceType::default(),
            scope,
        }
    }

    pub fn with_checkpoint_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    pub fn with_record_type(mut self, record_type: RecordType) -> Self {
        self.record_type = record_type;
        self
    }

    pub fn with_record_format(mut self, format: impl Into<String>) -> Self {
        self.record_format = RecordFormat(format.into());
        self
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Created,
    Active,
    Draining,
    Deleted,
}

impl StreamState {
    pub fn label(&self) -> &'static str {
        match self {
            StreamState::Created => "CREATED",
            StreamState::Active => "ACTIVE",
            StreamState::Draining => "DRAINING",
            StreamState::Deleted => "DELETED",
        }
    }

    pub fn is_deleting(&self) -> bool {
        matches!(self, StreamState::Draining | StreamState::Deleted)
    }

    pub fn can_transition_to(&self, next: StreamState) -> bool {
        matches!(
            (self, next),
            (StreamState::Created, StreamState::Active)
                | (StreamState::Created, StreamState::Draining)
                | (StreamState::Active, StreamState::Draining)
                | (StreamState::Draining, StreamState::Deleted)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Listing entry for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub state: StreamState,
    pub options: StreamOptions,
    pub tablets: Vec<TabletId>,
    pub created_at_ms: u64,
    pub last_active_ms: u64,
}

use super::CdcError;
use crate::consensus::OpId;
use crate::tablet::TabletId;
use serde::{Deserialize, Serialize};

/// Last acknowledged position of one stream on one tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub op_id: OpId,
    /// Set once a full snapshot (record type `All`) has been acknowledged.
    #[serde(default)]
    pub snapshot_done: bool,
    pub updated_at_ms: u64,
}

impl Checkpoint {
    pub fn new(op_id: OpId, now_ms: u64) -> Self {
        Self {
            op_id,
            snapshot_done: false,
            updated_at_ms: now_ms,
        }
    }

    pub fn resume_cursor(&self) -> String {
        encode_resume_cursor(self.op_id)
    }
}

/// Opaque to consumers: big-endian term then index, hex encoded.
pub fn encode_resume_cursor(op_id: OpId) -> String {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&op_id.term.to_be_bytes());
    bytes[8..].copy_from_slice(&op_id.index.to_be_bytes());
    hex::encode(bytes)
}

pub fn decode_resume_cursor(cursor: &str) -> Result<OpId, CdcError> {
    let bytes = hex::decode(cursor).map_err(|_| CdcError::InvalidCursor(cursor.to_string()))?;
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| CdcError::InvalidCursor(cursor.to_string()))?;
    let mut term = [0u8; 8];
    let mut index = [0u8; 8];
    term.copy_from_slice(&bytes[..8]);
    index.copy_from_slice(&bytes[8..]);
    Ok(OpId::new(u64::from_be_bytes(term), u64::from_be_bytes(index)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Snapshot,
    Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: RecordKind,
    /// For snapshot rows, the checkpoint the snapshot was taken from.
    pub op_id: OpId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollResponse {
    pub tablet: TabletId,
    pub records: Vec<ChangeRecord>,
    /// Position to acknowledge once `records` are processed.
    pub checkpoint: OpId,
    pub resume_cursor: String,
    pub committed: OpId,
}

impl PollResponse {
    pub fn change_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.kind == RecordKind::Change)
            .count()
    }
}

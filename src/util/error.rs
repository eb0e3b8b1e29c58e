use crate::anchor::AnchorError;
use crate::cdc::{CdcError, CheckpointStoreError};
use crate::config::ConfigError;
use crate::consensus::ConsensusError;
use crate::durability::DurabilityLogError;
use crate::maintenance::MaintenanceError;
use crate::tablet::TabletError;
use crate::telemetry::TelemetryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Any error the crate can surface, for callers that do not care which
/// component raised it.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error(transparent)]
    Tablet(#[from] TabletError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),
    #[error(transparent)]
    Cdc(#[from] CdcError),
    #[error(transparent)]
    CheckpointStore(#[from] CheckpointStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DurabilityLog(#[from] DurabilityLogError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl RetentionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RetentionError::Tablet(err) => err.is_retryable(),
            RetentionError::Cdc(err) => err.is_retryable(),
            RetentionError::Anchor(AnchorError::Tablet(err)) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for RetentionError {
    fn from(err: serde_json::Error) -> Self {
        RetentionError::Serialization(SerializationError::from(err))
    }
}

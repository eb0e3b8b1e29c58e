use super::{MaintenanceOpKind, OpEstimate};
use crate::tablet::TabletId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OpOutcome {
    Succeeded,
    Failed(String),
}

impl OpOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OpOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedOp {
    pub name: String,
    pub tablet: TabletId,
    pub kind: MaintenanceOpKind,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub outcome: OpOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredOpStatus {
    pub name: String,
    pub tablet: TabletId,
    pub kind: MaintenanceOpKind,
    #[serde(flatten)]
    pub estimate: OpEstimate,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningOpStatus {
    pub name: String,
    pub tablet: TabletId,
    pub kind: MaintenanceOpKind,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedOpStatus {
    #[serde(flatten)]
    pub op: CompletedOp,
    pub time_since_start_ms: u64,
}

/// Point-in-time dump of the scheduler: idle candidates by descending
/// score, ops in flight, and the most recent completions (newest first).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceManagerStatus {
    pub registered_ops: Vec<RegisteredOpStatus>,
    pub running_ops: Vec<RunningOpStatus>,
    pub completed_ops: Vec<CompletedOpStatus>,
}

impl MaintenanceManagerStatus {
    pub fn for_tablet(&self, tablet: &TabletId) -> MaintenanceManagerStatus {
        MaintenanceManagerStatus {
            registered_ops: self
                .registered_ops
                .iter()
                .filter(|op| &op.tablet == tablet)
                .cloned()
                .collect(),
            running_ops: self
                .running_ops
                .iter()
                .filter(|op| &op.tablet == tablet)
                .cloned()
                .collect(),
            completed_ops: self
                .completed_ops
                .iter()
                .filter(|op| &op.op.tablet == tablet)
                .cloned()
                .collect(),
        }
    }
}

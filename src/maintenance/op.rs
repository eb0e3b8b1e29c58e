use super::{MaintenanceError, OpFailureCause};
use crate::anchor::LogAnchorRegistry;
use crate::consensus::ConsensusLog;
use crate::storage::{StorageEngine, StorageStats};
use crate::tablet::TabletId;
use log::error;
use serde::Serialize;
use std::fmt;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MaintenanceOpKind {
    Flush,
    Compact,
    LogGc,
}

impl MaintenanceOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceOpKind::Flush => "flush",
            MaintenanceOpKind::Compact => "compact",
            MaintenanceOpKind::LogGc => "log_gc",
        }
    }
}

impl fmt::Display for MaintenanceOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs the scorer sees for one candidate; also what the status dump
/// reports for registered ops.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpEstimate {
    pub runnable: bool,
    pub ram_anchored_bytes: u64,
    pub logs_retained_bytes: u64,
    pub perf_improvement: f64,
}

/// A unit of background work against one tablet. Built fresh every cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceOp {
    Flush {
        tablet: TabletId,
        memtable_bytes: u64,
        logs_retained_bytes: u64,
    },
    Compact {
        tablet: TabletId,
        input_bytes: u64,
        reclaimable_bytes: u64,
        perf_improvement: f64,
    },
    /// `candidate` is the safely flushed index; `target` is the truncation
    /// point, clamped to the anchor floor while a candidate and the reserved
    /// point once admitted.
    LogGc {
        tablet: TabletId,
        candidate: u64,
        target: u64,
        last_truncation: u64,
        prunable_bytes: u64,
    },
}

/// Collaborators an op needs while running.
pub struct OpEnv<'a> {
    pub storage: &'a dyn StorageEngine,
    pub consensus: &'a dyn ConsensusLog,
    pub anchors: &'a LogAnchorRegistry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpReport {
    pub bytes_written: u64,
    pub bytes_reclaimed: u64,
}

impl MaintenanceOp {
    /// Candidates for one ready tablet, runnable or not.
    pub fn candidates(
        tablet: &TabletId,
        stats: &StorageStats,
        consensus: &dyn ConsensusLog,
        committed_index: u64,
        floor: Option<u64>,
        last_truncation: u64,
    ) -> Vec<MaintenanceOp> {
        let unflushed_wal = consensus
            .wal_bytes_before(tablet, committed_index.saturating_add(1))
            .saturating_sub(consensus.wal_bytes_before(tablet, stats.flushed_index));
        let gc_target = floor.map_or(stats.flushed_index, |floor| floor.min(stats.flushed_index));
        vec![
            MaintenanceOp::Flush {
                tablet: tablet.clone(),
                memtable_bytes: stats.memtable_bytes,
                logs_retained_bytes: unflushed_wal,
            },
            MaintenanceOp::Compact {
                tablet: tablet.clone(),
                input_bytes: stats.compaction_input_bytes,
                reclaimable_bytes: stats.compaction_reclaimable_bytes,
                perf_improvement: stats.compaction_perf_improvement,
            },
            MaintenanceOp::LogGc {
                tablet: tablet.clone(),
                candidate: stats.flushed_index,
                target: gc_target,
                last_truncation,
                prunable_bytes: consensus.wal_bytes_before(tablet, gc_target),
            },
        ]
    }

    pub fn kind(&self) -> MaintenanceOpKind {
        match self {
            MaintenanceOp::Flush { .. } => MaintenanceOpKind::Flush,
            MaintenanceOp::Compact { .. } => MaintenanceOpKind::Compact,
            MaintenanceOp::LogGc { .. } => MaintenanceOpKind::LogGc,
        }
    }

    pub fn tablet(&self) -> &TabletId {
        match self {
            MaintenanceOp::Flush { tablet, .. }
            | MaintenanceOp::Compact { tablet, .. }
            | MaintenanceOp::LogGc { tablet, .. } => tablet,
        }
    }

    /// A log-gc candidate that only the anchor floor keeps from running.
    pub fn is_floor_blocked(&self) -> bool {
        match self {
            MaintenanceOp::LogGc {
                candidate,
                target,
                last_truncation,
                ..
            } => target <= last_truncation && candidate > last_truncation,
            _ => false,
        }
    }

    pub fn name(&self) -> String {
        format!("{}({})", self.kind(), self.tablet())
    }

    pub fn estimate(&self) -> OpEstimate {
        match self {
            MaintenanceOp::Flush {
                memtable_bytes,
                logs_retained_bytes,
                ..
            } => OpEstimate {
                runnable: *memtable_bytes > 0,
                ram_anchored_bytes: *memtable_bytes,
                logs_retained_bytes: *logs_retained_bytes,
                perf_improvement: 0.0,
            },
            MaintenanceOp::Compact {
                input_bytes,
                perf_improvement,
                ..
            } => OpEstimate {
                runnable: *input_bytes > 0,
                ram_anchored_bytes: 0,
                logs_retained_bytes: 0,
                perf_improvement: *perf_improvement,
            },
            MaintenanceOp::LogGc {
                target,
                last_truncation,
                prunable_bytes,
                ..
            } => OpEstimate {
                runnable: *target > *last_truncation,
                ram_anchored_bytes: 0,
                logs_retained_bytes: *prunable_bytes,
                perf_improvement: 0.0,
            },
        }
    }

    /// Benefit over cost, both in bytes: `benefit / (1 + cost / 1 MiB)`.
    /// Non-runnable ops score zero.
    pub fn score(&self) -> f64 {
        if !self.estimate().runnable {
            return 0.0;
        }
        let (benefit, cost) = match self {
            MaintenanceOp::Flush {
                memtable_bytes,
                logs_retained_bytes,
                ..
            } => (
                memtable_bytes.saturating_add(*logs_retained_bytes) as f64,
                *memtable_bytes as f64,
            ),
            MaintenanceOp::Compact {
                input_bytes,
                reclaimable_bytes,
                perf_improvement,
                ..
            } => (
                *reclaimable_bytes as f64 + perf_improvement.max(0.0) * MIB,
                *input_bytes as f64,
            ),
            MaintenanceOp::LogGc { prunable_bytes, .. } => (*prunable_bytes as f64, 0.0),
        };
        benefit / (1.0 + cost / MIB)
    }

    /// Performs the I/O. Called outside every registry and scheduler lock.
    pub fn run(&self, env: &OpEnv<'_>) -> Result<OpReport, MaintenanceError> {
        let tablet = self.tablet();
        match self {
            MaintenanceOp::Flush { .. } => {
                let report = env.storage.flush(tablet).map_err(|err| self.failed(err))?;
                Ok(OpReport {
                    bytes_written: report.bytes_written,
                    bytes_reclaimed: report.bytes_reclaimed,
                })
            }
            MaintenanceOp::Compact { .. } => {
                let report = env.storage.compact(tablet).map_err(|err| self.failed(err))?;
                Ok(OpReport {
                    bytes_written: report.bytes_written,
                    bytes_reclaimed: report.bytes_reclaimed,
                })
            }
            MaintenanceOp::LogGc { target, .. } => {
                if let Some(floor) = env.anchors.effective_floor(tablet) {
                    if floor < *target {
                        error!(
                            "event=log_gc_floor_violation tablet={} target={} floor={}",
                            tablet, target, floor
                        );
                        return Err(MaintenanceError::FloorViolated {
                            tablet: tablet.clone(),
                            target: *target,
                            floor,
                        });
                    }
                }
                let released = env
                    .consensus
                    .truncate_log_before(tablet, *target)
                    .map_err(|err| self.failed(err))?;
                Ok(OpReport {
                    bytes_written: 0,
                    bytes_reclaimed: released,
                })
            }
        }
    }

    fn failed(&self, cause: impl Into<OpFailureCause>) -> MaintenanceError {
        MaintenanceError::MaintenanceOpFailed {
            op: self.name(),
            tablet: self.tablet().clone(),
            source: cause.into(),
        }
    }
}

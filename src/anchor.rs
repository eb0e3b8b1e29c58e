//! Log anchor registry: per-tablet "do not discard before index N"
//! constraints, and the admission point for log truncation.
//!
//! Each tablet has its own lock. Every mutation and every truncation
//! admission for a tablet happens under that lock and is written through to
//! the consensus metadata before the lock is released, so a floor read by
//! the scheduler is never staler than the last completed mutation.

use crate::consensus::ConsensusError;
use crate::tablet::{TabletError, TabletId, TabletManager};
use crate::util::clock::SharedClock;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAnchor {
    pub owner: String,
    /// Lowest log index this owner still needs.
    pub min_index: u64,
    pub reason: String,
    pub registered_at_ms: u64,
}

/// Persisted form of a tablet's anchors, stored alongside consensus metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorMetadata {
    pub anchors: Vec<LogAnchor>,
    /// Entries below this index have been (or are being) discarded.
    pub truncated_before: u64,
}

#[derive(Debug, Default)]
struct TabletAnchors {
    anchors: BTreeMap<String, LogAnchor>,
    truncated_before: u64,
}

impl TabletAnchors {
    fn floor(&self) -> Option<u64> {
        self.anchors.values().map(|anchor| anchor.min_index).min()
    }

    fn metadata(&self) -> AnchorMetadata {
        AnchorMetadata {
            anchors: self.anchors.values().cloned().collect(),
            truncated_before: self.truncated_before,
        }
    }
}

/// Result of asking to truncate a tablet's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncationDecision {
    /// Truncation below `target` is admitted; `target` is already recorded
    /// so no anchor can be registered beneath it.
    Admitted {
        target: u64,
        floor: Option<u64>,
        previous: u64,
    },
    /// Clamped target does not advance past the last truncation point.
    Skipped {
        candidate: u64,
        clamped: u64,
        floor: Option<u64>,
        last_truncation: u64,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnchorError {
    #[error(transparent)]
    Tablet(#[from] TabletError),
    #[error("invalid anchor for tablet {tablet} owner {owner}: index {min_index} {detail} {bound}")]
    InvalidAnchor {
        tablet: TabletId,
        owner: String,
        min_index: u64,
        detail: &'static str,
        bound: u64,
    },
    #[error("anchor regression for tablet {tablet} owner {owner}: {previous} -> {requested}")]
    AnchorRegression {
        tablet: TabletId,
        owner: String,
        previous: u64,
        requested: u64,
    },
    #[error("no anchor for owner {owner} on tablet {tablet}")]
    NotFound { tablet: TabletId, owner: String },
    #[error("failed to persist anchors for tablet {tablet}: {source}")]
    Persist {
        tablet: TabletId,
        #[source]
        source: ConsensusError,
    },
}

pub struct LogAnchorRegistry {
    tablets: Arc<TabletManager>,
    clock: SharedClock,
    slots: RwLock<HashMap<TabletId, Arc<Mutex<TabletAnchors>>>>,
}

impl LogAnchorRegistry {
    pub fn new(tablets: Arc<TabletManager>, clock: SharedClock) -> Self {
        Self {
            tablets,
            clock,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or replaces `owner`'s anchor. The tablet must be ready and
    /// `min_index` must already be committed.
    pub fn register_anchor(
        &self,
        tablet: &TabletId,
        owner: &str,
        min_index: u64,
        reason: &str,
    ) -> Result<(), AnchorError> {
        self.tablets.ensure_ready(tablet)?;
        let committed = self.tablets.committed_op_id(tablet)?.index;
        if min_index > committed {
            error!(
                "event=anchor_rejected tablet={} owner={} min_index={} committed={}",
                tablet, owner, min_index, committed
            );
            return Err(AnchorError::InvalidAnchor {
                tablet: tablet.clone(),
                owner: owner.to_string(),
                min_index,
                detail: "exceeds committed index",
                bound: committed,
            });
        }
        let slot = self.slot(tablet);
        let mut anchors = slot.lock();
        if min_index < anchors.truncated_before {
            error!(
                "event=anchor_rejected tablet={} owner={} min_index={} truncated_before={}",
                tablet, owner, min_index, anchors.truncated_before
            );
            return Err(AnchorError::InvalidAnchor {
                tablet: tablet.clone(),
                owner: owner.to_string(),
                min_index,
                detail: "is below truncation point",
                bound: anchors.truncated_before,
            });
        }
        let previous = anchors.anchors.insert(
            owner.to_string(),
            LogAnchor {
                owner: owner.to_string(),
                min_index,
                reason: reason.to_string(),
                registered_at_ms: self.clock.now_ms(),
            },
        );
        if let Err(err) = self.persist(tablet, &anchors) {
            match previous {
                Some(previous) => anchors.anchors.insert(owner.to_string(), previous),
                None => anchors.anchors.remove(owner),
            };
            return Err(err);
        }
        info!(
            "event=anchor_registered tablet={} owner={} min_index={} reason={} floor={:?}",
            tablet,
            owner,
            min_index,
            reason,
            anchors.floor()
        );
        Ok(())
    }

    /// Raises `owner`'s anchor. Lowering it is a contract violation and is
    /// reported, never clamped.
    pub fn update_anchor(
        &self,
        tablet: &TabletId,
        owner: &str,
        new_min_index: u64,
    ) -> Result<(), AnchorError> {
        let slot = self
            .existing_slot(tablet)
            .ok_or_else(|| AnchorError::NotFound {
                tablet: tablet.clone(),
                owner: owner.to_string(),
            })?;
        let committed = self.tablets.committed_op_id(tablet)?.index;
        let mut anchors = slot.lock();
        let previous = match anchors.anchors.get(owner) {
            Some(anchor) => anchor.min_index,
            None => {
                return Err(AnchorError::NotFound {
                    tablet: tablet.clone(),
                    owner: owner.to_string(),
                })
            }
        };
        if new_min_index < previous {
            error!(
                "event=anchor_regression tablet={} owner={} previous={} requested={}",
                tablet, owner, previous, new_min_index
            );
            return Err(AnchorError::AnchorRegression {
                tablet: tablet.clone(),
                owner: owner.to_string(),
                previous,
                requested: new_min_index,
            });
        }
        if new_min_index == previous {
            return Ok(());
        }
        if new_min_index > committed {
            return Err(AnchorError::InvalidAnchor {
                tablet: tablet.clone(),
                owner: owner.to_string(),
                min_index: new_min_index,
                detail: "exceeds committed index",
                bound: committed,
            });
        }
        if let Some(anchor) = anchors.anchors.get_mut(owner) {
            anchor.min_index = new_min_index;
        }
        if let Err(err) = self.persist(tablet, &anchors) {
            if let Some(anchor) = anchors.anchors.get_mut(owner) {
                anchor.min_index = previous;
            }
            return Err(err);
        }
        debug!(
            "event=anchor_updated tablet={} owner={} min_index={} floor={:?}",
            tablet,
            owner,
            new_min_index,
            anchors.floor()
        );
        Ok(())
    }

    /// Idempotent; returns whether an anchor was actually removed.
    pub fn release_anchor(&self, tablet: &TabletId, owner: &str) -> Result<bool, AnchorError> {
        let Some(slot) = self.existing_slot(tablet) else {
            return Ok(false);
        };
        let mut anchors = slot.lock();
        let Some(removed) = anchors.anchors.remove(owner) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(tablet, &anchors) {
            anchors.anchors.insert(owner.to_string(), removed);
            return Err(err);
        }
        info!(
            "event=anchor_released tablet={} owner={} floor={:?}",
            tablet,
            owner,
            anchors.floor()
        );
        Ok(true)
    }

    /// Minimum over all anchors of the tablet; `None` when unconstrained.
    pub fn effective_floor(&self, tablet: &TabletId) -> Option<u64> {
        self.existing_slot(tablet)
            .and_then(|slot| slot.lock().floor())
    }

    pub fn anchors(&self, tablet: &TabletId) -> Vec<LogAnchor> {
        self.existing_slot(tablet)
            .map(|slot| slot.lock().anchors.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_truncation(&self, tablet: &TabletId) -> u64 {
        self.existing_slot(tablet)
            .map(|slot| slot.lock().truncated_before)
            .unwrap_or(0)
    }

    /// Atomically reads the floor, clamps `candidate` to it and records the
    /// admitted truncation point.
    pub fn reserve_truncation(
        &self,
        tablet: &TabletId,
        candidate: u64,
    ) -> Result<TruncationDecision, AnchorError> {
        let slot = self.slot(tablet);
        let mut anchors = slot.lock();
        let floor = anchors.floor();
        let clamped = floor.map_or(candidate, |floor| candidate.min(floor));
        let previous = anchors.truncated_before;
        if clamped <= previous {
            return Ok(TruncationDecision::Skipped {
                candidate,
                clamped,
                floor,
                last_truncation: previous,
            });
        }
        anchors.truncated_before = clamped;
        if let Err(err) = self.persist(tablet, &anchors) {
            anchors.truncated_before = previous;
            return Err(err);
        }
        info!(
            "event=log_gc_admitted tablet={} candidate={} target={} floor={:?} previous={}",
            tablet, candidate, clamped, floor, previous
        );
        Ok(TruncationDecision::Admitted {
            target: clamped,
            floor,
            previous,
        })
    }

    /// Reloads a tablet's anchors from consensus metadata after restart.
    pub fn restore(&self, tablet: &TabletId) -> Result<usize, AnchorError> {
        let metadata = self
            .tablets
            .consensus()
            .load_anchor_metadata(tablet)
            .map_err(|source| AnchorError::Persist {
                tablet: tablet.clone(),
                source,
            })?;
        let Some(metadata) = metadata else {
            return Ok(0);
        };
        let restored = metadata.anchors.len();
        let slot = self.slot(tablet);
        let mut anchors = slot.lock();
        anchors.truncated_before = metadata.truncated_before;
        anchors.anchors = metadata
            .anchors
            .into_iter()
            .map(|anchor| (anchor.owner.clone(), anchor))
            .collect();
        info!(
            "event=anchors_restored tablet={} count={} floor={:?} truncated_before={}",
            tablet,
            restored,
            anchors.floor(),
            anchors.truncated_before
        );
        Ok(restored)
    }

    /// Drops all state for a tablet that left this node.
    pub fn forget_tablet(&self, tablet: &TabletId) -> usize {
        self.slots
            .write()
            .remove(tablet)
            .map(|slot| slot.lock().anchors.len())
            .unwrap_or(0)
    }

    fn slot(&self, tablet: &TabletId) -> Arc<Mutex<TabletAnchors>> {
        if let Some(slot) = self.existing_slot(tablet) {
            return slot;
        }
        self.slots
            .write()
            .entry(tablet.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, tablet: &TabletId) -> Option<Arc<Mutex<TabletAnchors>>> {
        self.slots.read().get(tablet).cloned()
    }

    fn persist(&self, tablet: &TabletId, anchors: &TabletAnchors) -> Result<(), AnchorError> {
        self.tablets
            .consensus()
            .append_anchor_metadata(tablet, &anchors.metadata())
            .map_err(|source| {
                error!(
                    "event=anchor_persist_failed tablet={} error={}",
                    tablet, source
                );
                AnchorError::Persist {
                    tablet: tablet.clone(),
                    source,
                }
            })
    }
}

impl std::fmt::Debug for LogAnchorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAnchorRegistry")
            .field("tablets", &self.slots.read().len())
            .finish()
    }
}

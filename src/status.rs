//! Read-only projections for observability and admin tooling.
//!
//! Nothing here is authoritative; every call recomputes from the tablet
//! arena, the anchor registry and the maintenance manager.

use crate::anchor::{LogAnchor, LogAnchorRegistry};
use crate::consensus::{OpId, PeerRole};
use crate::maintenance::{MaintenanceManager, MaintenanceManagerStatus};
use crate::storage::OnDiskSizeInfo;
use crate::tablet::{
    TableId, TabletDescriptor, TabletError, TabletId, TabletManager, TabletPeerSnapshot,
    TabletState,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Size totals over a group of tablets. `incomplete` when at least one
/// tablet had no estimate; rendered with a trailing `*`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskSizeSummary {
    #[serde(flatten)]
    pub size: OnDiskSizeInfo,
    pub total_bytes: u64,
    pub incomplete: bool,
}

impl DiskSizeSummary {
    fn add(&mut self, size: Option<OnDiskSizeInfo>) {
        match size {
            Some(size) => {
                self.size += size;
                self.total_bytes = self.size.total_bytes();
            }
            None => self.incomplete = true,
        }
    }
}

impl fmt::Display for DiskSizeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.size)?;
        if self.incomplete {
            f.write_str("*")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub table_id: TableId,
    pub namespace_name: String,
    pub table_name: String,
    pub state: String,
    pub hidden: bool,
    pub tablet_count: usize,
    pub sst_files: u64,
    pub disk_size: DiskSizeSummary,
    /// Role label to number of tablets.
    pub roles: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSummaries {
    pub tables: Vec<TableSummary>,
    /// Some tablet did not report its size; totals are lower bounds.
    pub has_incomplete_sizes: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabletDetails {
    pub descriptor: TabletDescriptor,
    pub state: String,
    pub role: PeerRole,
    pub committed: Option<OpId>,
    pub last_status: String,
    pub partition: String,
    pub sst_files: u64,
    pub disk_size: DiskSizeSummary,
    pub anchor_floor: Option<u64>,
    pub anchors: Vec<LogAnchor>,
    pub last_truncation: u64,
    pub degraded: bool,
    pub recent_failures: usize,
    pub maintenance: MaintenanceManagerStatus,
}

/// Role as shown on status pages: a bootstrapping replica with no role yet
/// is copying data, so it is listed as a learner.
fn display_role(snapshot: &TabletPeerSnapshot) -> PeerRole {
    match (snapshot.state, snapshot.role) {
        (TabletState::Bootstrapping, PeerRole::Unknown) => PeerRole::Learner,
        (_, role) => role,
    }
}

pub struct TabletStatusAggregator {
    tablets: Arc<TabletManager>,
    anchors: Arc<LogAnchorRegistry>,
    maintenance: Arc<MaintenanceManager>,
}

impl TabletStatusAggregator {
    pub fn new(
        tablets: Arc<TabletManager>,
        anchors: Arc<LogAnchorRegistry>,
        maintenance: Arc<MaintenanceManager>,
    ) -> Self {
        Self {
            tablets,
            anchors,
            maintenance,
        }
    }

    /// Bootstrapping and running tablets grouped by (table, state label).
    pub fn table_summaries(&self) -> TableSummaries {
        let mut groups: BTreeMap<(TableId, &'static str), TableSummary> = BTreeMap::new();
        for snapshot in self.tablets.snapshots() {
            if !matches!(
                snapshot.state,
                TabletState::Bootstrapping | TabletState::Running
            ) {
                continue;
            }
            let descriptor = &snapshot.descriptor;
            let label = snapshot.state.label();
            let summary = groups
                .entry((descriptor.table_id.clone(), label))
                .or_insert_with(|| TableSummary {
                    table_id: descriptor.table_id.clone(),
                    namespace_name: descriptor.namespace_name.clone(),
                    table_name: descriptor.table_name.clone(),
                    state: label.to_string(),
                    hidden: descriptor.hidden,
                    tablet_count: 0,
                    sst_files: 0,
                    disk_size: DiskSizeSummary::default(),
                    roles: BTreeMap::new(),
                });
            summary.tablet_count += 1;
            summary.sst_files = summary.sst_files.saturating_add(snapshot.sst_files);
            summary.disk_size.add(snapshot.disk_size);
            *summary
                .roles
                .entry(display_role(&snapshot).as_str().to_string())
                .or_default() += 1;
        }
        let tables: Vec<TableSummary> = groups.into_values().collect();
        let has_incomplete_sizes = tables.iter().any(|table| table.disk_size.incomplete);
        TableSummaries {
            tables,
            has_incomplete_sizes,
        }
    }

    pub fn tablet_details(&self, tablet: &TabletId) -> Result<TabletDetails, TabletError> {
        let snapshot = self.tablets.snapshot(tablet)?;
        let mut disk_size = DiskSizeSummary::default();
        disk_size.add(snapshot.disk_size);
        Ok(TabletDetails {
            state: snapshot.state.label().to_string(),
            role: display_role(&snapshot),
            committed: snapshot.committed,
            partition: snapshot.descriptor.partition.to_string(),
            last_status: snapshot.last_status.clone(),
            sst_files: snapshot.sst_files,
            disk_size,
            anchor_floor: self.anchors.effective_floor(tablet),
            anchors: self.anchors.anchors(tablet),
            last_truncation: self.anchors.last_truncation(tablet),
            degraded: self.maintenance.is_degraded(tablet),
            recent_failures: self.maintenance.recent_failures(tablet),
            maintenance: self.maintenance.maintenance_manager_status().for_tablet(tablet),
            descriptor: snapshot.descriptor,
        })
    }

    /// Tablets in `Failed`, sorted.
    pub fn health_check(&self) -> Vec<TabletId> {
        self.tablets
            .snapshots()
            .into_iter()
            .filter(|snapshot| snapshot.state == TabletState::Failed)
            .map(|snapshot| snapshot.descriptor.tablet_id)
            .collect()
    }

    pub fn maintenance_manager_status(&self) -> MaintenanceManagerStatus {
        self.maintenance.maintenance_manager_status()
    }
}

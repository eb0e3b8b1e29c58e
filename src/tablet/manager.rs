use super::{TableId, TabletError, TabletId, TabletLifecycle, TabletState};
use crate::consensus::{ConsensusLog, OpId, PeerRole};
use crate::storage::OnDiskSizeInfo;
use crate::util::clock::SharedClock;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Half-open key range `[start_key, end_key)`; empty bounds are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBounds {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl fmt::Display for PartitionBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = if self.start_key.is_empty() {
            "<start>".to_string()
        } else {
            format!("0x{}", hex::encode(&self.start_key))
        };
        let end = if self.end_key.is_empty() {
            "<end>".to_string()
        } else {
            format!("0x{}", hex::encode(&self.end_key))
        };
        write!(f, "[{start}, {end})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletDescriptor {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub namespace_name: String,
    pub table_name: String,
    pub partition: PartitionBounds,
    #[serde(default)]
    pub hidden: bool,
}

impl TabletDescriptor {
    pub fn new(
        tablet_id: impl Into<String>,
        table_id: impl Into<String>,
        namespace_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            tablet_id: TabletId::new(tablet_id),
            table_id: TableId::new(table_id),
            namespace_name: namespace_name.into(),
            table_name: table_name.into(),
            partition: PartitionBounds::default(),
            hidden: false,
        }
    }
}

/// What a stream (or any other consumer) wants to cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletScope {
    Namespace(String),
    Tables(Vec<TableId>),
}

impl fmt::Display for TabletScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabletScope::Namespace(name) => write!(f, "namespace:{name}"),
            TabletScope::Tables(tables) => {
                let ids: Vec<&str> = tables.iter().map(TableId::as_str).collect();
                write!(f, "tables:{}", ids.join(","))
            }
        }
    }
}

/// Table/namespace metadata lookup.
pub trait TabletResolver: Send + Sync {
    fn resolve_tablets_for_scope(&self, scope: &TabletScope) -> Result<Vec<TabletId>, TabletError>;
}

#[derive(Debug)]
struct TabletRecord {
    descriptor: TabletDescriptor,
    lifecycle: TabletLifecycle,
    disk_size: Option<OnDiskSizeInfo>,
    sst_files: u64,
}

/// Point-in-time copy of a tablet record plus its consensus view.
#[derive(Debug, Clone, Serialize)]
pub struct TabletPeerSnapshot {
    pub descriptor: TabletDescriptor,
    pub state: TabletState,
    pub role: PeerRole,
    pub committed: Option<OpId>,
    pub last_status: String,
    pub disk_size: Option<OnDiskSizeInfo>,
    pub sst_files: u64,
}

/// Arena of tablet records keyed by tablet id. Other components hold ids,
/// never references into the arena.
pub struct TabletManager {
    consensus: Arc<dyn ConsensusLog>,
    clock: SharedClock,
    tablets: RwLock<HashMap<TabletId, Arc<Mutex<TabletRecord>>>>,
}

impl TabletManager {
    pub fn new(consensus: Arc<dyn ConsensusLog>, clock: SharedClock) -> Self {
        Self {
            consensus,
            clock,
            tablets: RwLock::new(HashMap::new()),
        }
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusLog> {
        &self.consensus
    }

    pub fn register_tablet(&self, descriptor: TabletDescriptor) -> Result<(), TabletError> {
        let mut tablets = self.tablets.write();
        if tablets.contains_key(&descriptor.tablet_id) {
            return Err(TabletError::AlreadyRegistered(descriptor.tablet_id));
        }
        info!(
            "event=tablet_registered tablet={} table={} namespace={}",
            descriptor.tablet_id, descriptor.table_id, descriptor.namespace_name
        );
        let id = descriptor.tablet_id.clone();
        let record = TabletRecord {
            descriptor,
            lifecycle: TabletLifecycle::new(self.clock.now_ms()),
            disk_size: None,
            sst_files: 0,
        };
        tablets.insert(id, Arc::new(Mutex::new(record)));
        Ok(())
    }

    /// Permanent removal (drop, split or merge completion).
    pub fn remove_tablet(&self, tablet: &TabletId) -> Result<TabletDescriptor, TabletError> {
        let record = self
            .tablets
            .write()
            .remove(tablet)
            .ok_or_else(|| TabletError::NotFound(tablet.clone()))?;
        info!("event=tablet_removed tablet={}", tablet);
        let descriptor = record.lock().descriptor.clone();
        Ok(descriptor)
    }

    pub fn transition(&self, tablet: &TabletId, next: TabletState) -> Result<(), TabletError> {
        let record = self.record(tablet)?;
        let mut record = record.lock();
        let previous = record
            .lifecycle
            .transition(tablet, next, self.clock.now_ms())?;
        if next == TabletState::Failed {
            warn!(
                "event=tablet_state_change tablet={} from={} to={}",
                tablet, previous, next
            );
        } else {
            info!(
                "event=tablet_state_change tablet={} from={} to={}",
                tablet, previous, next
            );
        }
        Ok(())
    }

    pub fn set_last_status(&self, tablet: &TabletId, status: impl Into<String>) -> Result<(), TabletError> {
        self.record(tablet)?.lock().lifecycle.set_last_status(status);
        Ok(())
    }

    pub fn current_state(&self, tablet: &TabletId) -> Result<TabletState, TabletError> {
        Ok(self.record(tablet)?.lock().lifecycle.state())
    }

    pub fn role(&self, tablet: &TabletId) -> PeerRole {
        if self.tablets.read().contains_key(tablet) {
            self.consensus.role(tablet)
        } else {
            PeerRole::Unknown
        }
    }

    pub fn is_ready(&self, tablet: &TabletId) -> bool {
        matches!(self.current_state(tablet), Ok(TabletState::Running))
    }

    /// Gate for every read or anchor against a tablet. Fails fast instead of
    /// waiting; callers retry with backoff.
    pub fn ensure_ready(&self, tablet: &TabletId) -> Result<(), TabletError> {
        match self.current_state(tablet)? {
            TabletState::Running => Ok(()),
            TabletState::Failed => Err(TabletError::Failed(tablet.clone())),
            state => Err(TabletError::NotReady {
                tablet: tablet.clone(),
                state,
            }),
        }
    }

    pub fn committed_op_id(&self, tablet: &TabletId) -> Result<OpId, TabletError> {
        if !self.tablets.read().contains_key(tablet) {
            return Err(TabletError::NotFound(tablet.clone()));
        }
        Ok(self.consensus.committed_op_id(tablet)?)
    }

    pub fn record_disk_size(
        &self,
        tablet: &TabletId,
        disk_size: Option<OnDiskSizeInfo>,
        sst_files: u64,
    ) -> Result<(), TabletError> {
        let record = self.record(tablet)?;
        let mut record = record.lock();
        record.disk_size = disk_size;
        record.sst_files = sst_files;
        Ok(())
    }

    pub fn descriptor(&self, tablet: &TabletId) -> Result<TabletDescriptor, TabletError> {
        Ok(self.record(tablet)?.lock().descriptor.clone())
    }

    pub fn contains(&self, tablet: &TabletId) -> bool {
        self.tablets.read().contains_key(tablet)
    }

    /// All hosted tablet ids, sorted.
    pub fn tablet_ids(&self) -> Vec<TabletId> {
        let mut ids: Vec<TabletId> = self.tablets.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn ready_tablet_ids(&self) -> Vec<TabletId> {
        self.tablet_ids()
            .into_iter()
            .filter(|id| self.is_ready(id))
            .collect()
    }

    pub fn snapshot(&self, tablet: &TabletId) -> Result<TabletPeerSnapshot, TabletError> {
        let record = self.record(tablet)?;
        let (descriptor, state, last_status, disk_size, sst_files) = {
            let record = record.lock();
            (
                record.descriptor.clone(),
                record.lifecycle.state(),
                record.lifecycle.last_status().to_string(),
                record.disk_size,
                record.sst_files,
            )
        };
        let committed = self.consensus.committed_op_id(tablet).ok();
        Ok(TabletPeerSnapshot {
            descriptor,
            state,
            role: self.consensus.role(tablet),
            committed,
            last_status,
            disk_size,
            sst_files,
        })
    }

    /// Snapshots of every hosted tablet, sorted by tablet id.
    pub fn snapshots(&self) -> Vec<TabletPeerSnapshot> {
        self.tablet_ids()
            .iter()
            .filter_map(|id| self.snapshot(id).ok())
            .collect()
    }

    fn record(&self, tablet: &TabletId) -> Result<Arc<Mutex<TabletRecord>>, TabletError> {
        self.tablets
            .read()
            .get(tablet)
            .cloned()
            .ok_or_else(|| TabletError::NotFound(tablet.clone()))
    }
}

impl TabletResolver for TabletManager {
    fn resolve_tablets_for_scope(&self, scope: &TabletScope) -> Result<Vec<TabletId>, TabletError> {
        let tablets = self.tablets.read();
        let mut resolved: Vec<TabletId> = tablets
            .iter()
            .filter(|(_, record)| {
                let record = record.lock();
                let descriptor = &record.descriptor;
                match scope {
                    TabletScope::Namespace(name) => &descriptor.namespace_name == name,
                    TabletScope::Tables(tables) => tables.contains(&descriptor.table_id),
                }
            })
            .map(|(id, _)| id.clone())
            .collect();
        if resolved.is_empty() {
            return Err(TabletError::EmptyScope(scope.to_string()));
        }
        resolved.sort();
        Ok(resolved)
    }
}

impl fmt::Debug for TabletManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabletManager")
            .field("tablets", &self.tablets.read().len())
            .finish()
    }
}

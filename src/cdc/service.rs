use super::checkpoint::{decode_resume_cursor, encode_resume_cursor};
use super::store::{CheckpointStore, PersistedStream, TabletCheckpoint};
use super::{
    CdcError, ChangeRecord, Checkpoint, CheckpointType, PollResponse, RecordKind, RecordType,
    StreamId, StreamInfo, StreamOptions, StreamState,
};
use crate::anchor::{AnchorError, LogAnchorRegistry};
use crate::config::CdcConfig;
use crate::consensus::{OpId, PeerRole};
use crate::storage::StorageEngine;
use crate::tablet::{TabletId, TabletManager, TabletResolver, TabletState};
use crate::telemetry::SharedMetricsRegistry;
use crate::util::clock::SharedClock;
use crate::util::retry::{retry_async, RetryPolicy};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const ANCHOR_REASON: &str = "cdc-stream";

struct StreamEntry {
    id: StreamId,
    options: StreamOptions,
    created_at_ms: u64,
    state: Mutex<StreamState>,
    last_active_ms: AtomicU64,
    /// One lock per (stream, tablet); taken before the tablet's anchor lock.
    checkpoints: BTreeMap<TabletId, Mutex<Checkpoint>>,
}

impl StreamEntry {
    fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Applies `next` if the state machine allows it from the current state.
    fn transition(&self, next: StreamState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    fn ensure_active(&self) -> Result<(), CdcError> {
        match self.state() {
            StreamState::Active => Ok(()),
            state => Err(CdcError::StreamNotActive {
                stream: self.id.clone(),
                state,
            }),
        }
    }

    fn slot(&self, tablet: &TabletId) -> Result<&Mutex<Checkpoint>, CdcError> {
        self.checkpoints
            .get(tablet)
            .ok_or_else(|| CdcError::TabletNotInStream {
                stream: self.id.clone(),
                tablet: tablet.clone(),
            })
    }

    fn tablets(&self) -> Vec<TabletId> {
        self.checkpoints.keys().cloned().collect()
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            state: self.state(),
            options: self.options.clone(),
            tablets: self.tablets(),
            created_at_ms: self.created_at_ms,
            last_active_ms: self.last_active_ms.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabletStreamStatus {
    pub tablet: TabletId,
    pub checkpoint: Checkpoint,
    pub resume_cursor: String,
    /// The tablet failed or left this node; polls cannot make progress.
    pub stalled: bool,
    pub tablet_state: Option<TabletState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub id: StreamId,
    pub state: StreamState,
    pub last_active_ms: u64,
    pub tablets: Vec<TabletStreamStatus>,
}

/// Stream registry and the poll/acknowledge protocol.
///
/// Each (stream, tablet) checkpoint has its own lock; log reads happen with
/// no lock held. Deletion flips the stream to `Draining` and queues anchor
/// release for [`drain_pending_releases`](Self::drain_pending_releases).
pub struct CdcService {
    config: CdcConfig,
    tablets: Arc<TabletManager>,
    resolver: Arc<dyn TabletResolver>,
    anchors: Arc<LogAnchorRegistry>,
    storage: Arc<dyn StorageEngine>,
    store: Arc<dyn CheckpointStore>,
    clock: SharedClock,
    metrics: SharedMetricsRegistry,
    streams: RwLock<HashMap<StreamId, Arc<StreamEntry>>>,
    pending_releases: Mutex<VecDeque<StreamId>>,
}

impl CdcService {
    pub fn new(
        config: CdcConfig,
        tablets: Arc<TabletManager>,
        anchors: Arc<LogAnchorRegistry>,
        storage: Arc<dyn StorageEngine>,
        store: Arc<dyn CheckpointStore>,
        clock: SharedClock,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        let resolver: Arc<dyn TabletResolver> = tablets.clone();
        metrics.set_gauge("cdc.active_streams", 0);
        Self {
            config,
            tablets,
            resolver,
            anchors,
            storage,
            store,
            clock,
            metrics,
            streams: RwLock::new(HashMap::new()),
            pending_releases: Mutex::new(VecDeque::new()),
        }
    }

    /// Replaces the default resolver (locally hosted tablets).
    pub fn with_resolver(mut self, resolver: Arc<dyn TabletResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Rebuilds streams from the checkpoint store. Streams that were
    /// draining get their anchor release queued again. Anchors themselves
    /// come back through [`LogAnchorRegistry::restore`].
    pub fn restore(&self) -> Result<usize, CdcError> {
        let persisted = self.store.load()?;
        let now = self.clock.now_ms();
        let mut streams = self.streams.write();
        let mut pending = self.pending_releases.lock();
        for stream in &persisted {
            let state = match stream.state {
                StreamState::Created => StreamState::Draining,
                state => state,
            };
            if state == StreamState::Draining {
                pending.push_back(stream.id.clone());
            }
            let entry = StreamEntry {
                id: stream.id.clone(),
                options: stream.options.clone(),
                created_at_ms: stream.created_at_ms,
                state: Mutex::new(state),
                last_active_ms: AtomicU64::new(now),
                checkpoints: stream
                    .checkpoints
                    .iter()
                    .map(|saved| (saved.tablet.clone(), Mutex::new(saved.checkpoint.clone())))
                    .collect(),
            };
            streams.insert(stream.id.clone(), Arc::new(entry));
        }
        drop(pending);
        drop(streams);
        self.update_active_gauge();
        info!(
            "event=cdc_streams_restored count={} pending_release={}",
            persisted.len(),
            self.pending_releases.lock().len()
        );
        Ok(persisted.len())
    }

    /// Resolves the scope and anchors every tablet at its committed
    /// position. Any failure releases the anchors already taken.
    pub fn create_stream(&self, options: StreamOptions) -> Result<StreamId, CdcError> {
        let scope = options.scope.to_string();
        let fail = |source: CdcError| {
            warn!(
                "event=cdc_stream_create_failed scope={} error={}",
                scope, source
            );
            CdcError::StreamCreateFailed {
                scope: scope.clone(),
                source: Box::new(source),
            }
        };
        let tablets = self
            .resolver
            .resolve_tablets_for_scope(&options.scope)
            .map_err(|err| fail(err.into()))?;
        let id = StreamId::generate();
        let now = self.clock.now_ms();
        let mut anchored: Vec<TabletId> = Vec::with_capacity(tablets.len());
        let mut checkpoints = Vec::with_capacity(tablets.len());
        for tablet in &tablets {
            let result = self
                .tablets
                .ensure_ready(tablet)
                .map_err(CdcError::from)
                .and_then(|_| self.tablets.committed_op_id(tablet).map_err(CdcError::from))
                .and_then(|committed| {
                    self.anchors
                        .register_anchor(tablet, id.as_str(), committed.index, ANCHOR_REASON)
                        .map(|_| committed)
                        .map_err(CdcError::from)
                });
            match result {
                Ok(committed) => {
                    anchored.push(tablet.clone());
                    checkpoints.push(TabletCheckpoint {
                        tablet: tablet.clone(),
                        checkpoint: Checkpoint::new(committed, now),
                    });
                }
                Err(err) => {
                    self.rollback_anchors(&id, &anchored);
                    return Err(fail(err));
                }
            }
        }
        let persisted = PersistedStream {
            id: id.clone(),
            options: options.clone(),
            state: StreamState::Active,
            created_at_ms: now,
            checkpoints: checkpoints.clone(),
        };
        if let Err(err) = self.store.record_stream(&persisted) {
            self.rollback_anchors(&id, &anchored);
            return Err(fail(err.into()));
        }
        let entry = StreamEntry {
            id: id.clone(),
            options,
            created_at_ms: now,
            state: Mutex::new(StreamState::Created),
            last_active_ms: AtomicU64::new(now),
            checkpoints: checkpoints
                .into_iter()
                .map(|entry| (entry.tablet, Mutex::new(entry.checkpoint)))
                .collect(),
        };
        entry.transition(StreamState::Active);
        self.streams.write().insert(id.clone(), Arc::new(entry));
        self.update_active_gauge();
        info!(
            "event=cdc_stream_created stream={} scope={} tablets={}",
            id,
            scope,
            tablets.len()
        );
        Ok(id)
    }

    fn rollback_anchors(&self, stream: &StreamId, tablets: &[TabletId]) {
        for tablet in tablets {
            if let Err(err) = self.anchors.release_anchor(tablet, stream.as_str()) {
                error!(
                    "event=cdc_stream_rollback_failed stream={} tablet={} error={}",
                    stream, tablet, err
                );
            }
        }
    }

    /// Committed records after the stored checkpoint, in log order, capped
    /// at `max_records_per_poll`. IMPLICIT streams advance their checkpoint
    /// and anchor before this returns.
    pub async fn poll(&self, stream: &StreamId, tablet: &TabletId) -> Result<PollResponse, CdcError> {
        let entry = self.stream(stream)?;
        entry.ensure_active()?;
        let slot = entry.slot(tablet)?;
        self.tablets.ensure_ready(tablet).map_err(|err| {
            debug!(
                "event=cdc_poll_rejected stream={} tablet={} error={}",
                stream, tablet, err
            );
            CdcError::from(err)
        })?;
        let role = self.tablets.role(tablet);
        if role != PeerRole::Leader {
            debug!(
                "event=cdc_poll_not_leader stream={} tablet={} role={}",
                stream, tablet, role
            );
            return Err(CdcError::NotLeader {
                tablet: tablet.clone(),
                role,
            });
        }
        let checkpoint = slot.lock().clone();
        let want_snapshot =
            entry.options.record_type == RecordType::All && !checkpoint.snapshot_done;

        let consensus = Arc::clone(self.tablets.consensus());
        let storage = Arc::clone(&self.storage);
        let read_tablet = tablet.clone();
        let after = checkpoint.op_id.index;
        let max_records = self.config.max_records_per_poll;
        let (committed, entries, snapshot_rows) = tokio::task::spawn_blocking(move || {
            let committed = consensus.committed_op_id(&read_tablet)?;
            let entries = consensus.read_committed(&read_tablet, after, max_records)?;
            let rows = if want_snapshot {
                storage.snapshot_rows(&read_tablet)?
            } else {
                Vec::new()
            };
            Ok::<_, CdcError>((committed, entries, rows))
        })
        .await
        .map_err(|err| CdcError::ReadAborted(err.to_string()))?
        .map_err(|err| {
            if let CdcError::Consensus(inner) = &err {
                error!(
                    "event=cdc_read_below_anchor stream={} tablet={} after={} error={}",
                    stream, tablet, after, inner
                );
            }
            err
        })?;

        let mut records: Vec<ChangeRecord> = snapshot_rows
            .into_iter()
            .map(|row| ChangeRecord {
                kind: RecordKind::Snapshot,
                op_id: checkpoint.op_id,
                key: row.key,
                payload: row.value,
            })
            .collect();
        let mut position = checkpoint.op_id;
        for log_entry in entries {
            position = log_entry.op_id;
            records.push(ChangeRecord {
                kind: RecordKind::Change,
                op_id: log_entry.op_id,
                key: Vec::new(),
                payload: log_entry.payload,
            });
        }

        entry
            .last_active_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);
        self.metrics.inc_counter("cdc.polls", 1);
        self.metrics
            .inc_counter("cdc.records_delivered", records.len() as u64);

        if entry.options.checkpoint_type == CheckpointType::Implicit && !records.is_empty() {
            self.advance(&entry, tablet, position, want_snapshot)?;
        }
        debug!(
            "event=cdc_poll stream={} tablet={} records={} position={} committed={}",
            stream,
            tablet,
            records.len(),
            position,
            committed
        );
        Ok(PollResponse {
            tablet: tablet.clone(),
            records,
            checkpoint: position,
            resume_cursor: encode_resume_cursor(position),
            committed,
        })
    }

    /// [`poll`](Self::poll) retried while the tablet is not yet ready.
    pub async fn poll_with_retry(
        &self,
        stream: &StreamId,
        tablet: &TabletId,
        policy: &RetryPolicy,
    ) -> Result<PollResponse, CdcError> {
        retry_async(
            policy,
            "cdc_poll",
            |err: &CdcError| matches!(err, CdcError::TabletNotReady { .. }),
            || self.poll(stream, tablet),
        )
        .await
    }

    /// Moves the checkpoint to `position`. Lower than the checkpoint is a
    /// `StaleAck`; equal is a no-op. The checkpoint is persisted before the
    /// anchor moves, so a crash in between only retains extra log.
    pub fn acknowledge(
        &self,
        stream: &StreamId,
        tablet: &TabletId,
        position: OpId,
    ) -> Result<Checkpoint, CdcError> {
        let entry = self.stream(stream)?;
        entry.ensure_active()?;
        entry.slot(tablet)?;
        self.tablets.ensure_ready(tablet)?;
        let committed = self.tablets.committed_op_id(tablet)?;
        if position.index > committed.index {
            warn!(
                "event=cdc_ack_beyond_committed stream={} tablet={} requested={} committed={}",
                stream, tablet, position, committed
            );
            return Err(CdcError::AckBeyondCommitted {
                stream: stream.clone(),
                tablet: tablet.clone(),
                requested: position,
                committed,
            });
        }
        let checkpoint = self.advance(&entry, tablet, position, true)?;
        self.metrics.inc_counter("cdc.acks", 1);
        Ok(checkpoint)
    }

    /// [`acknowledge`](Self::acknowledge) with a resume cursor from a poll.
    pub fn acknowledge_cursor(
        &self,
        stream: &StreamId,
        tablet: &TabletId,
        cursor: &str,
    ) -> Result<Checkpoint, CdcError> {
        let position = decode_resume_cursor(cursor)?;
        self.acknowledge(stream, tablet, position)
    }

    fn advance(
        &self,
        entry: &StreamEntry,
        tablet: &TabletId,
        position: OpId,
        snapshot_delivered: bool,
    ) -> Result<Checkpoint, CdcError> {
        let slot = entry.slot(tablet)?;
        let mut checkpoint = slot.lock();
        if position.index < checkpoint.op_id.index {
            warn!(
                "event=cdc_stale_ack stream={} tablet={} current={} requested={}",
                entry.id, tablet, checkpoint.op_id, position
            );
            return Err(CdcError::StaleAck {
                stream: entry.id.clone(),
                tablet: tablet.clone(),
                current: checkpoint.op_id,
                requested: position,
            });
        }
        let snapshot_done = checkpoint.snapshot_done
            || (snapshot_delivered && entry.options.record_type == RecordType::All);
        if position.index == checkpoint.op_id.index && snapshot_done == checkpoint.snapshot_done {
            return Ok(checkpoint.clone());
        }
        let next = Checkpoint {
            op_id: position,
            snapshot_done,
            updated_at_ms: self.clock.now_ms(),
        };
        self.store.record_checkpoint(&entry.id, tablet, &next)?;
        let moved = position.index > checkpoint.op_id.index;
        *checkpoint = next.clone();
        if moved {
            match self
                .anchors
                .update_anchor(tablet, entry.id.as_str(), position.index)
            {
                Ok(()) => {}
                Err(AnchorError::NotFound { .. }) if entry.state().is_deleting() => {
                    debug!(
                        "event=cdc_anchor_already_released stream={} tablet={}",
                        entry.id, tablet
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        debug!(
            "event=cdc_checkpoint_advanced stream={} tablet={} position={} snapshot_done={}",
            entry.id, tablet, position, snapshot_done
        );
        Ok(next)
    }

    /// Flips the stream to `Draining` and queues its anchor release.
    /// Idempotent; in-flight polls and acks finish against the state they
    /// started with.
    pub fn delete_stream(&self, stream: &StreamId) -> Result<(), CdcError> {
        let entry = self.stream(stream)?;
        if !entry.transition(StreamState::Draining) {
            debug!(
                "event=cdc_stream_delete_ignored stream={} state={}",
                stream,
                entry.state()
            );
            return Ok(());
        }
        if let Err(err) = self.store.record_state(stream, StreamState::Draining) {
            warn!(
                "event=cdc_stream_state_persist_failed stream={} state=DRAINING error={}",
                stream, err
            );
        }
        self.pending_releases.lock().push_back(stream.clone());
        self.update_active_gauge();
        info!("event=cdc_stream_draining stream={}", stream);
        Ok(())
    }

    /// Releases the anchors of every draining stream and marks it
    /// `Deleted`. Streams whose release fails stay queued.
    pub fn drain_pending_releases(&self) -> usize {
        let queued: Vec<StreamId> = self.pending_releases.lock().drain(..).collect();
        let mut completed = 0;
        let mut retry = Vec::new();
        for stream in queued {
            let Some(entry) = self.streams.read().get(&stream).cloned() else {
                continue;
            };
            let mut released_all = true;
            for tablet in entry.tablets() {
                if let Err(err) = self.anchors.release_anchor(&tablet, stream.as_str()) {
                    released_all = false;
                    warn!(
                        "event=cdc_anchor_release_failed stream={} tablet={} error={}",
                        stream, tablet, err
                    );
                }
            }
            if !released_all {
                retry.push(stream);
                continue;
            }
            if !entry.transition(StreamState::Deleted) {
                warn!(
                    "event=cdc_stream_release_skipped stream={} state={}",
                    stream,
                    entry.state()
                );
                continue;
            }
            if let Err(err) = self.store.record_state(&stream, StreamState::Deleted) {
                warn!(
                    "event=cdc_stream_state_persist_failed stream={} state=DELETED error={}",
                    stream, err
                );
            }
            info!("event=cdc_stream_deleted stream={}", stream);
            completed += 1;
        }
        if !retry.is_empty() {
            self.pending_releases.lock().extend(retry);
        }
        completed
    }

    /// Releases stream anchors on `tablet` whose owner is unknown or already
    /// deleted. Anchors reloaded from consensus metadata can outlive their
    /// stream when the release ran before the tablet was hosted, or when the
    /// stream record never reached the store. Runs before the tablet is
    /// ready, so no stream can be anchoring it concurrently.
    pub fn release_orphaned_anchors(&self, tablet: &TabletId) -> usize {
        let orphans: Vec<String> = {
            let streams = self.streams.read();
            self.anchors
                .anchors(tablet)
                .into_iter()
                .filter(|anchor| anchor.reason == ANCHOR_REASON)
                .filter(|anchor| {
                    streams
                        .get(&StreamId::new(anchor.owner.as_str()))
                        .map_or(true, |entry| entry.state() == StreamState::Deleted)
                })
                .map(|anchor| anchor.owner)
                .collect()
        };
        let mut released = 0;
        for owner in orphans {
            match self.anchors.release_anchor(tablet, &owner) {
                Ok(true) => {
                    info!(
                        "event=cdc_orphan_anchor_released tablet={} stream={}",
                        tablet, owner
                    );
                    released += 1;
                }
                Ok(false) => {}
                Err(err) => warn!(
                    "event=cdc_orphan_anchor_release_failed tablet={} stream={} error={}",
                    tablet, owner, err
                ),
            }
        }
        released
    }

    /// Deletes every active stream with no successful poll within the
    /// inactivity timeout.
    pub fn expire_inactive(&self) -> Vec<StreamId> {
        let now = self.clock.now_ms();
        let timeout = self.config.stream_inactivity_timeout_ms;
        let idle: Vec<StreamId> = self
            .streams
            .read()
            .values()
            .filter(|entry| entry.state() == StreamState::Active)
            .filter(|entry| {
                now.saturating_sub(entry.last_active_ms.load(Ordering::SeqCst)) > timeout
            })
            .map(|entry| entry.id.clone())
            .collect();
        let mut expired = Vec::with_capacity(idle.len());
        for stream in idle {
            if self.delete_stream(&stream).is_ok() {
                info!(
                    "event=cdc_stream_expired stream={} inactivity_timeout_ms={}",
                    stream, timeout
                );
                self.metrics.inc_counter("cdc.streams_expired", 1);
                expired.push(stream);
            }
        }
        expired
    }

    /// Expiry and release sweep, once per `expiry_sweep_interval_ms`, until
    /// `shutdown` flips to true. A final release pass runs on the way out.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                self.expire_inactive();
                self.drain_pending_releases();
            }
            self.drain_pending_releases();
            info!("event=cdc_sweeper_stopped");
        })
    }

    pub fn list_streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .streams
            .read()
            .values()
            .map(|entry| entry.info())
            .collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        streams
    }

    pub fn get_checkpoint(&self, stream: &StreamId, tablet: &TabletId) -> Result<Checkpoint, CdcError> {
        let entry = self.stream(stream)?;
        let checkpoint = entry.slot(tablet)?.lock().clone();
        Ok(checkpoint)
    }

    pub fn stream_status(&self, stream: &StreamId) -> Result<StreamStatus, CdcError> {
        let entry = self.stream(stream)?;
        let tablets = entry
            .checkpoints
            .iter()
            .map(|(tablet, slot)| {
                let checkpoint = slot.lock().clone();
                let tablet_state = self.tablets.current_state(tablet).ok();
                TabletStreamStatus {
                    tablet: tablet.clone(),
                    resume_cursor: checkpoint.resume_cursor(),
                    checkpoint,
                    stalled: matches!(tablet_state, None | Some(TabletState::Failed)),
                    tablet_state,
                }
            })
            .collect();
        Ok(StreamStatus {
            id: entry.id.clone(),
            state: entry.state(),
            last_active_ms: entry.last_active_ms.load(Ordering::SeqCst),
            tablets,
        })
    }

    /// Streams reading from `tablet`, with their state.
    pub fn streams_for_tablet(&self, tablet: &TabletId) -> Vec<(StreamId, StreamState)> {
        let mut streams: Vec<(StreamId, StreamState)> = self
            .streams
            .read()
            .values()
            .filter(|entry| entry.checkpoints.contains_key(tablet))
            .map(|entry| (entry.id.clone(), entry.state()))
            .collect();
        streams.sort_by(|a, b| a.0.cmp(&b.0));
        streams
    }

    pub fn pending_release_count(&self) -> usize {
        self.pending_releases.lock().len()
    }

    fn stream(&self, stream: &StreamId) -> Result<Arc<StreamEntry>, CdcError> {
        self.streams
            .read()
            .get(stream)
            .cloned()
            .ok_or_else(|| CdcError::StreamNotFound(stream.clone()))
    }

    fn update_active_gauge(&self) {
        let active = self
            .streams
            .read()
            .values()
            .filter(|entry| entry.state() == StreamState::Active)
            .count();
        self.metrics.set_gauge("cdc.active_streams", active as u64);
    }
}

impl fmt::Debug for CdcService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdcService")
            .field("streams", &self.streams.read().len())
            .field("pending_releases", &self.pending_releases.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::InMemoryCheckpointStore;
    use crate::memory::{InMemoryConsensus, InMemoryStorage};
    use crate::storage::SnapshotRow;
    use crate::tablet::{TabletDescriptor, TabletScope};
    use crate::util::clock::ManualClock;
    use std::time::Duration;

    struct Fixture {
        consensus: Arc<InMemoryConsensus>,
        storage: Arc<InMemoryStorage>,
        tablets: Arc<TabletManager>,
        anchors: Arc<LogAnchorRegistry>,
        store: Arc<InMemoryCheckpointStore>,
        clock: Arc<ManualClock>,
        service: CdcService,
    }

    fn fixture() -> Fixture {
        let consensus = Arc::new(InMemoryConsensus::new());
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let tablets = Arc::new(TabletManager::new(consensus.clone(), clock.clone()));
        let anchors = Arc::new(LogAnchorRegistry::new(tablets.clone(), clock.clone()));
        let store = Arc::new(InMemoryCheckpointStore::new());
        let service = CdcService::new(
            CdcConfig::default(),
            tablets.clone(),
            anchors.clone(),
            storage.clone(),
            store.clone(),
            clock.clone(),
            SharedMetricsRegistry::new("retention"),
        );
        Fixture {
            consensus,
            storage,
            tablets,
            anchors,
            store,
            clock,
            service,
        }
    }

    impl Fixture {
        fn leader(&self, id: &str, table: &str, entries: usize) -> TabletId {
            let tablet = TabletId::new(id);
            self.tablets
                .register_tablet(TabletDescriptor::new(id, table, "shop", table))
                .unwrap();
            self.tablets
                .transition(&tablet, TabletState::Bootstrapping)
                .unwrap();
            self.tablets.transition(&tablet, TabletState::Running).unwrap();
            self.consensus.set_role(&tablet, PeerRole::Leader);
            self.consensus.append_many(&tablet, 1, entries);
            tablet
        }

        fn stream_on(&self, table: &str, checkpoint_type: CheckpointType) -> StreamId {
            self.service
                .create_stream(
                    StreamOptions::new(TabletScope::Tables(vec![table.into()]))
                        .with_checkpoint_type(checkpoint_type),
                )
                .unwrap()
        }
    }

    #[tokio::test]
    async fn explicit_stream_requires_ack_to_move() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 10);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        assert_eq!(fx.anchors.effective_floor(&tablet), Some(10));

        fx.consensus.append_many(&tablet, 1, 5);
        let response = fx.service.poll(&stream, &tablet).await.unwrap();
        assert_eq!(response.change_count(), 5);
        assert_eq!(response.checkpoint.index, 15);
        assert_eq!(
            fx.service.get_checkpoint(&stream, &tablet).unwrap().op_id.index,
            10
        );

        let acked = fx
            .service
            .acknowledge_cursor(&stream, &tablet, &response.resume_cursor)
            .unwrap();
        assert_eq!(acked.op_id.index, 15);
        assert_eq!(fx.anchors.effective_floor(&tablet), Some(15));
    }

    #[tokio::test]
    async fn stale_and_equal_acks() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 20);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        let writes = fx.consensus.metadata_writes();
        fx.service
            .acknowledge(&stream, &tablet, OpId::new(1, 20))
            .unwrap();
        assert_eq!(fx.consensus.metadata_writes(), writes);
        assert!(matches!(
            fx.service.acknowledge(&stream, &tablet, OpId::new(1, 12)),
            Err(CdcError::StaleAck { .. })
        ));
        assert!(matches!(
            fx.service.acknowledge(&stream, &tablet, OpId::new(1, 21)),
            Err(CdcError::AckBeyondCommitted { .. })
        ));
        assert_eq!(
            fx.service.get_checkpoint(&stream, &tablet).unwrap().op_id.index,
            20
        );
    }

    #[tokio::test]
    async fn followers_answer_not_leader() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 3);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        fx.consensus.set_role(&tablet, PeerRole::Follower);
        let err = fx.service.poll(&stream, &tablet).await.unwrap_err();
        assert!(matches!(err, CdcError::NotLeader { role: PeerRole::Follower, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failed_tablet_stalls_stream() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 3);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        fx.tablets.transition(&tablet, TabletState::Failed).unwrap();
        let err = fx.service.poll(&stream, &tablet).await.unwrap_err();
        assert!(matches!(err, CdcError::TabletFailed(_)));
        assert!(err.is_retryable());
        let status = fx.service.stream_status(&stream).unwrap();
        assert!(status.tablets[0].stalled);
    }

    #[test]
    fn create_rolls_back_when_a_tablet_is_not_ready() {
        let fx = fixture();
        let ready = fx.leader("t1", "orders", 5);
        fx.tablets
            .register_tablet(TabletDescriptor::new("t2", "orders", "shop", "orders"))
            .unwrap();
        let err = fx
            .service
            .create_stream(StreamOptions::new(TabletScope::Tables(vec!["orders".into()])))
            .unwrap_err();
        match err {
            CdcError::StreamCreateFailed { source, .. } => {
                assert!(matches!(*source, CdcError::TabletNotReady { .. }))
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(fx.anchors.effective_floor(&ready), None);
        assert!(fx.service.list_streams().is_empty());
    }

    #[test]
    fn create_rolls_back_when_store_rejects() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 5);
        fx.store.fail_writes(true);
        assert!(matches!(
            fx.service
                .create_stream(StreamOptions::new(TabletScope::Tables(vec!["orders".into()]))),
            Err(CdcError::StreamCreateFailed { .. })
        ));
        assert!(fx.anchors.anchors(&tablet).is_empty());
    }

    #[tokio::test]
    async fn all_record_type_delivers_snapshot_until_acked() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 4);
        fx.storage.set_rows(
            &tablet,
            vec![SnapshotRow {
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
            }],
        );
        let stream = fx
            .service
            .create_stream(
                StreamOptions::new(TabletScope::Tables(vec!["orders".into()]))
                    .with_record_type(RecordType::All),
            )
            .unwrap();
        let first = fx.service.poll(&stream, &tablet).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].kind, RecordKind::Snapshot);
        let checkpoint = fx
            .service
            .acknowledge(&stream, &tablet, first.checkpoint)
            .unwrap();
        assert!(checkpoint.snapshot_done);
        let second = fx.service.poll(&stream, &tablet).await.unwrap();
        assert!(second.records.is_empty());
    }

    #[tokio::test]
    async fn deletion_drains_then_releases() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 5);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        fx.service.delete_stream(&stream).unwrap();
        fx.service.delete_stream(&stream).unwrap();
        assert!(matches!(
            fx.service.poll(&stream, &tablet).await,
            Err(CdcError::StreamNotActive {
                state: StreamState::Draining,
                ..
            })
        ));
        assert_eq!(fx.anchors.effective_floor(&tablet), Some(5));
        assert_eq!(fx.service.drain_pending_releases(), 1);
        assert_eq!(fx.anchors.effective_floor(&tablet), None);
        assert_eq!(fx.service.list_streams()[0].state, StreamState::Deleted);
        assert_eq!(fx.service.pending_release_count(), 0);
    }

    #[test]
    fn idle_streams_expire() {
        let fx = fixture();
        fx.leader("t1", "orders", 5);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        fx.clock.advance(Duration::from_millis(
            CdcConfig::default().stream_inactivity_timeout_ms,
        ));
        assert!(fx.service.expire_inactive().is_empty());
        fx.clock.advance(Duration::from_millis(1));
        assert_eq!(fx.service.expire_inactive(), vec![stream.clone()]);
        fx.service.drain_pending_releases();
        assert_eq!(
            fx.service.stream_status(&stream).unwrap().state,
            StreamState::Deleted
        );
    }

    #[test]
    fn restore_rebuilds_streams_and_requeues_draining() {
        let fx = fixture();
        fx.leader("t1", "orders", 5);
        let kept = fx.stream_on("orders", CheckpointType::Explicit);
        let draining = fx.stream_on("orders", CheckpointType::Implicit);
        fx.service.delete_stream(&draining).unwrap();

        let restarted = CdcService::new(
            CdcConfig::default(),
            fx.tablets.clone(),
            fx.anchors.clone(),
            fx.storage.clone(),
            fx.store.clone(),
            fx.clock.clone(),
            SharedMetricsRegistry::new("retention"),
        );
        assert_eq!(restarted.restore().unwrap(), 2);
        assert_eq!(restarted.pending_release_count(), 1);
        assert_eq!(
            restarted.stream_status(&kept).unwrap().state,
            StreamState::Active
        );
        assert_eq!(restarted.drain_pending_releases(), 1);
    }

    #[tokio::test]
    async fn acknowledge_requires_a_ready_tablet() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 10);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        fx.consensus.append_many(&tablet, 1, 5);
        fx.tablets.transition(&tablet, TabletState::Failed).unwrap();
        assert!(matches!(
            fx.service.acknowledge(&stream, &tablet, OpId::new(1, 15)),
            Err(CdcError::TabletFailed(_))
        ));

        // Reopened replica, still bootstrapping.
        fx.tablets.remove_tablet(&tablet).unwrap();
        fx.tablets
            .register_tablet(TabletDescriptor::new("t1", "orders", "shop", "orders"))
            .unwrap();
        fx.tablets
            .transition(&tablet, TabletState::Bootstrapping)
            .unwrap();
        assert!(matches!(
            fx.service.acknowledge(&stream, &tablet, OpId::new(1, 15)),
            Err(CdcError::TabletNotReady {
                state: TabletState::Bootstrapping,
                ..
            })
        ));
        assert_eq!(
            fx.service.get_checkpoint(&stream, &tablet).unwrap().op_id.index,
            10
        );
        assert_eq!(fx.anchors.effective_floor(&tablet), Some(10));
    }

    #[test]
    fn deleted_streams_stay_deleted() {
        let fx = fixture();
        fx.leader("t1", "orders", 5);
        let stream = fx.stream_on("orders", CheckpointType::Explicit);
        fx.service.delete_stream(&stream).unwrap();
        assert_eq!(fx.service.drain_pending_releases(), 1);

        fx.service.delete_stream(&stream).unwrap();
        assert_eq!(fx.service.pending_release_count(), 0);
        assert_eq!(
            fx.service.stream_status(&stream).unwrap().state,
            StreamState::Deleted
        );
        assert!(!StreamState::Deleted.can_transition_to(StreamState::Draining));
    }

    struct PinnedResolver(Vec<TabletId>);

    impl TabletResolver for PinnedResolver {
        fn resolve_tablets_for_scope(
            &self,
            _scope: &TabletScope,
        ) -> Result<Vec<TabletId>, crate::tablet::TabletError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn custom_resolver_decides_stream_membership() {
        let fx = fixture();
        let pinned = fx.leader("t1", "orders", 5);
        let other = fx.leader("t2", "orders", 7);
        let service = CdcService::new(
            CdcConfig::default(),
            fx.tablets.clone(),
            fx.anchors.clone(),
            fx.storage.clone(),
            fx.store.clone(),
            fx.clock.clone(),
            SharedMetricsRegistry::new("retention"),
        )
        .with_resolver(Arc::new(PinnedResolver(vec![pinned.clone()])));

        let stream = service
            .create_stream(StreamOptions::new(TabletScope::Namespace("anything".into())))
            .unwrap();
        assert_eq!(service.list_streams()[0].tablets, vec![pinned.clone()]);
        assert_eq!(fx.anchors.effective_floor(&pinned), Some(5));
        assert_eq!(fx.anchors.effective_floor(&other), None);
        assert!(matches!(
            service.acknowledge(&stream, &other, OpId::new(1, 7)),
            Err(CdcError::TabletNotInStream { .. })
        ));
    }

    #[test]
    fn orphaned_stream_anchors_are_released() {
        let fx = fixture();
        let tablet = fx.leader("t1", "orders", 8);
        let live = fx.stream_on("orders", CheckpointType::Explicit);
        let gone = fx.stream_on("orders", CheckpointType::Explicit);
        fx.service.delete_stream(&gone).unwrap();
        // Drained while the anchor slot was away, then reloaded.
        *fx.service.stream(&gone).unwrap().state.lock() = StreamState::Deleted;
        fx.anchors
            .register_anchor(&tablet, "never-recorded", 6, ANCHOR_REASON)
            .unwrap();
        fx.anchors
            .register_anchor(&tablet, "bootstrap-peer", 2, "bootstrap")
            .unwrap();

        assert_eq!(fx.service.release_orphaned_anchors(&tablet), 2);
        let mut owners: Vec<String> = fx
            .anchors
            .anchors(&tablet)
            .into_iter()
            .map(|anchor| anchor.owner)
            .collect();
        owners.sort();
        let mut expected = vec!["bootstrap-peer".to_string(), live.as_str().to_string()];
        expected.sort();
        assert_eq!(owners, expected);
        assert_eq!(fx.service.release_orphaned_anchors(&tablet), 0);
    }
}

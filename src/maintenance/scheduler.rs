use super::status::{
    CompletedOp, CompletedOpStatus, MaintenanceManagerStatus, OpOutcome, RegisteredOpStatus,
    RunningOpStatus,
};
use super::{MaintenanceError, MaintenanceOp, MaintenanceOpKind, OpEnv, OpReport};
use crate::anchor::{LogAnchorRegistry, TruncationDecision};
use crate::config::MaintenanceConfig;
use crate::storage::StorageEngine;
use crate::tablet::{TabletId, TabletManager};
use crate::telemetry::SharedMetricsRegistry;
use crate::util::clock::SharedClock;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const OP_DURATION_HISTOGRAM_MAX_MS: u64 = 600_000;

type OpKey = (TabletId, MaintenanceOpKind);

#[derive(Debug, Clone)]
struct RunningOp {
    name: String,
    started_at_ms: u64,
}

/// An op that holds a concurrency slot and must be handed to
/// [`MaintenanceManager::execute`].
#[derive(Debug)]
pub struct AdmittedOp {
    pub op: MaintenanceOp,
    pub score: f64,
    started: Instant,
    started_at_ms: u64,
}

/// Runs flush, compaction and log GC across every ready tablet.
///
/// Admission (slot accounting and the anchor floor consultation) is
/// serialised; the op I/O itself runs with no lock held.
pub struct MaintenanceManager {
    config: MaintenanceConfig,
    tablets: Arc<TabletManager>,
    anchors: Arc<LogAnchorRegistry>,
    storage: Arc<dyn StorageEngine>,
    clock: SharedClock,
    metrics: SharedMetricsRegistry,
    running: Mutex<HashMap<OpKey, RunningOp>>,
    completed: Mutex<VecDeque<CompletedOp>>,
    failures: Mutex<HashMap<TabletId, VecDeque<u64>>>,
    work: Notify,
}

impl MaintenanceManager {
    pub fn new(
        config: MaintenanceConfig,
        tablets: Arc<TabletManager>,
        anchors: Arc<LogAnchorRegistry>,
        storage: Arc<dyn StorageEngine>,
        clock: SharedClock,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        metrics.register_histogram("maintenance.op_duration_ms", OP_DURATION_HISTOGRAM_MAX_MS);
        metrics.set_gauge("maintenance.running_ops", 0);
        Self {
            config,
            tablets,
            anchors,
            storage,
            clock,
            metrics,
            running: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            failures: Mutex::new(HashMap::new()),
            work: Notify::new(),
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Wakes the background loop ahead of its next tick.
    pub fn signal_work(&self) {
        self.work.notify_one();
    }

    /// Every candidate op across ready tablets, highest score first.
    pub fn collect_candidates(&self) -> Vec<MaintenanceOp> {
        let consensus = self.tablets.consensus();
        let mut candidates = Vec::new();
        for tablet in self.tablets.ready_tablet_ids() {
            let Some(stats) = self.storage.stats(&tablet) else {
                continue;
            };
            let committed = match self.tablets.committed_op_id(&tablet) {
                Ok(op_id) => op_id.index,
                Err(err) => {
                    debug!(
                        "event=maintenance_candidate_skipped tablet={} error={}",
                        tablet, err
                    );
                    continue;
                }
            };
            candidates.extend(MaintenanceOp::candidates(
                &tablet,
                &stats,
                consensus.as_ref(),
                committed,
                self.anchors.effective_floor(&tablet),
                self.anchors.last_truncation(&tablet),
            ));
        }
        candidates.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then_with(|| b.kind().cmp(&a.kind()))
                .then_with(|| a.tablet().cmp(b.tablet()))
        });
        candidates
    }

    /// Picks this cycle's ops and reserves their slots. Log GC is admitted
    /// only through the registry, which clamps the target to the floor and
    /// records it before the slot is taken.
    pub fn admit(&self) -> Vec<AdmittedOp> {
        let candidates = self.collect_candidates();
        let max_ops = self.config.max_concurrent_ops;
        let non_gc_cap = max_ops.saturating_sub(self.config.effective_reserved_slots());
        let mut running = self.running.lock();
        let mut non_gc_running = running
            .keys()
            .filter(|(_, kind)| *kind != MaintenanceOpKind::LogGc)
            .count();
        let mut admitted = Vec::new();
        for candidate in candidates {
            if candidate.is_floor_blocked() {
                self.metrics.inc_counter("maintenance.log_gc_skipped", 1);
                debug!(
                    "event=log_gc_skipped tablet={} reason=anchor_floor",
                    candidate.tablet()
                );
                continue;
            }
            let score = candidate.score();
            if !candidate.estimate().runnable || score <= self.config.min_score {
                continue;
            }
            if running.len() >= max_ops {
                break;
            }
            let key = (candidate.tablet().clone(), candidate.kind());
            if running.contains_key(&key) {
                continue;
            }
            let is_gc = candidate.kind() == MaintenanceOpKind::LogGc;
            if !is_gc && non_gc_running >= non_gc_cap {
                continue;
            }
            let op = if is_gc {
                match self.reserve_log_gc(candidate) {
                    Some(op) => op,
                    None => continue,
                }
            } else {
                candidate
            };
            let started_at_ms = self.clock.now_ms();
            running.insert(
                key,
                RunningOp {
                    name: op.name(),
                    started_at_ms,
                },
            );
            if !is_gc {
                non_gc_running += 1;
            }
            self.metrics.inc_counter("maintenance.ops_admitted", 1);
            debug!(
                "event=maintenance_op_admitted op={} score={:.1} running={}",
                op.name(),
                score,
                running.len()
            );
            admitted.push(AdmittedOp {
                op,
                score,
                started: Instant::now(),
                started_at_ms,
            });
        }
        self.metrics
            .set_gauge("maintenance.running_ops", running.len() as u64);
        admitted
    }

    fn reserve_log_gc(&self, candidate: MaintenanceOp) -> Option<MaintenanceOp> {
        let (tablet, flushed, prunable_bytes) = match candidate {
            MaintenanceOp::LogGc {
                tablet,
                candidate,
                prunable_bytes,
                ..
            } => (tablet, candidate, prunable_bytes),
            other => return Some(other),
        };
        match self.anchors.reserve_truncation(&tablet, flushed) {
            Ok(TruncationDecision::Admitted {
                target, previous, ..
            }) => Some(MaintenanceOp::LogGc {
                tablet,
                candidate: flushed,
                target,
                last_truncation: previous,
                prunable_bytes,
            }),
            Ok(TruncationDecision::Skipped {
                clamped,
                last_truncation,
                ..
            }) => {
                self.metrics.inc_counter("maintenance.log_gc_skipped", 1);
                debug!(
                    "event=log_gc_skipped tablet={} clamped={} last_truncation={}",
                    tablet, clamped, last_truncation
                );
                None
            }
            Err(err) => {
                error!(
                    "event=log_gc_reservation_failed tablet={} error={}",
                    tablet, err
                );
                None
            }
        }
    }

    /// Runs an admitted op on the calling thread and records its completion.
    pub fn execute(&self, admitted: AdmittedOp) -> Result<OpReport, MaintenanceError> {
        let env = OpEnv {
            storage: self.storage.as_ref(),
            consensus: self.tablets.consensus().as_ref(),
            anchors: self.anchors.as_ref(),
        };
        let result = admitted.op.run(&env);
        self.complete(&admitted, &result);
        result
    }

    /// Admits and runs one cycle's ops sequentially on the calling thread.
    pub fn run_cycle_inline(&self) -> Vec<Result<OpReport, MaintenanceError>> {
        self.admit()
            .into_iter()
            .map(|admitted| self.execute(admitted))
            .collect()
    }

    /// Admits one cycle's ops and runs each on the blocking pool. A failing
    /// op never affects its siblings.
    pub fn run_cycle(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.admit()
            .into_iter()
            .map(|admitted| {
                let manager = Arc::clone(self);
                tokio::task::spawn_blocking(move || {
                    let _ = manager.execute(admitted);
                })
            })
            .collect()
    }

    /// Scheduling loop: one cycle per polling interval or per
    /// [`signal_work`](Self::signal_work), until `shutdown` flips to true.
    /// In-flight ops are awaited before the task finishes.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.polling_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
            info!(
                "event=maintenance_loop_started interval_ms={} max_ops={}",
                self.config.polling_interval_ms, self.config.max_concurrent_ops
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.work.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                in_flight.retain(|handle| !handle.is_finished());
                in_flight.extend(self.run_cycle());
            }
            for handle in in_flight {
                let _ = handle.await;
            }
            info!("event=maintenance_loop_stopped");
        })
    }

    fn complete(&self, admitted: &AdmittedOp, result: &Result<OpReport, MaintenanceError>) {
        let op = &admitted.op;
        let tablet = op.tablet();
        let duration_ms = admitted.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        {
            let mut running = self.running.lock();
            running.remove(&(tablet.clone(), op.kind()));
            self.metrics
                .set_gauge("maintenance.running_ops", running.len() as u64);
        }
        if let Err(err) = self
            .metrics
            .observe_histogram("maintenance.op_duration_ms", duration_ms)
        {
            warn!("event=maintenance_metrics_error error={}", err);
        }
        let outcome = match result {
            Ok(report) => {
                info!(
                    "event=maintenance_op_completed op={} duration_ms={} bytes_written={} bytes_reclaimed={}",
                    op.name(),
                    duration_ms,
                    report.bytes_written,
                    report.bytes_reclaimed
                );
                OpOutcome::Succeeded
            }
            Err(err) => {
                warn!(
                    "event=maintenance_op_failed op={} duration_ms={} error={}",
                    op.name(),
                    duration_ms,
                    err
                );
                self.metrics.inc_counter("maintenance.ops_failed", 1);
                self.record_failure(tablet);
                OpOutcome::Failed(err.to_string())
            }
        };
        {
            let mut completed = self.completed.lock();
            completed.push_back(CompletedOp {
                name: op.name(),
                tablet: tablet.clone(),
                kind: op.kind(),
                started_at_ms: admitted.started_at_ms,
                duration_ms,
                outcome,
            });
            while completed.len() > self.config.completed_ops_history {
                completed.pop_front();
            }
        }
        self.refresh_disk_size(tablet);
    }

    /// Copies the engine's size estimate into the tablet record, with the
    /// WAL component taken from the consensus log.
    pub fn refresh_disk_size(&self, tablet: &TabletId) {
        let consensus = self.tablets.consensus();
        let disk_size = self.storage.disk_size(tablet).map(|mut size| {
            size.wal_bytes = consensus.wal_bytes_before(tablet, u64::MAX);
            size
        });
        let sst_files = self
            .storage
            .stats(tablet)
            .map(|stats| stats.sst_files)
            .unwrap_or(0);
        if let Err(err) = self.tablets.record_disk_size(tablet, disk_size, sst_files) {
            debug!("event=disk_size_refresh_skipped tablet={} error={}", tablet, err);
        }
    }

    fn record_failure(&self, tablet: &TabletId) {
        let now = self.clock.now_ms();
        let mut failures = self.failures.lock();
        let window = failures.entry(tablet.clone()).or_default();
        window.push_back(now);
        self.prune_window(window, now);
        if window.len() == self.config.failure_threshold {
            warn!(
                "event=tablet_degraded tablet={} failures={} window_ms={}",
                tablet,
                window.len(),
                self.config.failure_window_ms
            );
        }
    }

    fn prune_window(&self, window: &mut VecDeque<u64>, now: u64) {
        let horizon = now.saturating_sub(self.config.failure_window_ms);
        while window.front().is_some_and(|at| *at < horizon) {
            window.pop_front();
        }
    }

    /// Failures of `tablet`'s ops within the configured window.
    pub fn recent_failures(&self, tablet: &TabletId) -> usize {
        let now = self.clock.now_ms();
        let mut failures = self.failures.lock();
        match failures.get_mut(tablet) {
            Some(window) => {
                self.prune_window(window, now);
                window.len()
            }
            None => 0,
        }
    }

    /// At least `failure_threshold` failures within the window. Reported
    /// only; the tablet's lifecycle state is untouched.
    pub fn is_degraded(&self, tablet: &TabletId) -> bool {
        self.config.failure_threshold > 0
            && self.recent_failures(tablet) >= self.config.failure_threshold
    }

    pub fn forget_tablet(&self, tablet: &TabletId) {
        self.failures.lock().remove(tablet);
    }

    pub fn running_ops(&self) -> Vec<RunningOpStatus> {
        let mut ops: Vec<RunningOpStatus> = self
            .running
            .lock()
            .iter()
            .map(|((tablet, kind), op)| RunningOpStatus {
                name: op.name.clone(),
                tablet: tablet.clone(),
                kind: *kind,
                started_at_ms: op.started_at_ms,
            })
            .collect();
        ops.sort_by(|a, b| a.name.cmp(&b.name));
        ops
    }

    pub fn maintenance_manager_status(&self) -> MaintenanceManagerStatus {
        let now = self.clock.now_ms();
        let registered_ops = self
            .collect_candidates()
            .into_iter()
            .map(|op| RegisteredOpStatus {
                name: op.name(),
                tablet: op.tablet().clone(),
                kind: op.kind(),
                score: op.score(),
                estimate: op.estimate(),
            })
            .collect();
        let completed_ops = self
            .completed
            .lock()
            .iter()
            .rev()
            .map(|op| CompletedOpStatus {
                op: op.clone(),
                time_since_start_ms: now.saturating_sub(op.started_at_ms),
            })
            .collect();
        MaintenanceManagerStatus {
            registered_ops,
            running_ops: self.running_ops(),
            completed_ops,
        }
    }
}

impl fmt::Debug for MaintenanceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceManager")
            .field("config", &self.config)
            .field("running", &self.running.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusLog;
    use crate::memory::{InMemoryConsensus, InMemoryStorage};
    use crate::storage::{StorageEngineError, StorageStats};
    use crate::tablet::{TabletDescriptor, TabletState};
    use crate::util::clock::ManualClock;
    use std::time::Duration;

    struct Fixture {
        consensus: Arc<InMemoryConsensus>,
        storage: Arc<InMemoryStorage>,
        tablets: Arc<TabletManager>,
        anchors: Arc<LogAnchorRegistry>,
        clock: Arc<ManualClock>,
        metrics: SharedMetricsRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let consensus = Arc::new(InMemoryConsensus::new());
            let storage = Arc::new(InMemoryStorage::new());
            let clock = Arc::new(ManualClock::new(1_000));
            let tablets = Arc::new(TabletManager::new(consensus.clone(), clock.clone()));
            let anchors = Arc::new(LogAnchorRegistry::new(tablets.clone(), clock.clone()));
            Self {
                consensus,
                storage,
                tablets,
                anchors,
                clock,
                metrics: SharedMetricsRegistry::new("retention"),
            }
        }

        fn running_tablet(&self, id: &str, entries: usize) -> TabletId {
            let tablet = TabletId::new(id);
            self.tablets
                .register_tablet(TabletDescriptor::new(id, "tbl", "db", "orders"))
                .unwrap();
            self.tablets.transition(&tablet, TabletState::Bootstrapping).unwrap();
            self.tablets.transition(&tablet, TabletState::Running).unwrap();
            self.consensus.append_many(&tablet, 1, entries);
            self.storage.set_stats(&tablet, StorageStats::default());
            tablet
        }

        fn manager(&self, config: MaintenanceConfig) -> MaintenanceManager {
            MaintenanceManager::new(
                config,
                self.tablets.clone(),
                self.anchors.clone(),
                self.storage.clone(),
                self.clock.clone(),
                self.metrics.clone(),
            )
        }
    }

    #[test]
    fn log_gc_truncates_to_flushed_index_without_anchors() {
        let fx = Fixture::new();
        let tablet = fx.running_tablet("t1", 100);
        fx.storage.update_stats(&tablet, |stats| stats.flushed_index = 60);
        let manager = fx.manager(MaintenanceConfig::default());
        let results = manager.run_cycle_inline();
        assert_eq!(results.len(), 1);
        assert_eq!(fx.consensus.truncated_before(&tablet), 60);
        assert_eq!(fx.anchors.last_truncation(&tablet), 60);
    }

    #[test]
    fn log_gc_is_clamped_to_anchor_floor_and_then_skipped() {
        let fx = Fixture::new();
        let tablet = fx.running_tablet("t1", 100);
        fx.storage.update_stats(&tablet, |stats| stats.flushed_index = 90);
        fx.anchors.register_anchor(&tablet, "s1", 40, "cdc-stream").unwrap();
        let manager = fx.manager(MaintenanceConfig::default());
        manager.run_cycle_inline();
        assert_eq!(fx.consensus.truncated_before(&tablet), 40);

        assert!(manager.run_cycle_inline().is_empty());
        let snapshot = fx.metrics.snapshot();
        assert_eq!(snapshot.counter("retention.maintenance.log_gc_skipped"), 1);
        assert_eq!(snapshot.counter("retention.maintenance.ops_failed"), 0);
    }

    #[test]
    fn reserved_slot_keeps_log_gc_runnable_under_compaction_pressure() {
        let fx = Fixture::new();
        let config = MaintenanceConfig {
            max_concurrent_ops: 2,
            reserved_log_gc_slots: 1,
            ..MaintenanceConfig::default()
        };
        let manager = fx.manager(config);
        for id in ["a", "b", "c"] {
            let tablet = fx.running_tablet(id, 10);
            fx.storage.update_stats(&tablet, |stats| {
                stats.compaction_input_bytes = 1 << 20;
                stats.compaction_reclaimable_bytes = 512 << 20;
            });
        }
        let gc_tablet = fx.running_tablet("d", 50);
        fx.storage.update_stats(&gc_tablet, |stats| stats.flushed_index = 20);

        let admitted = manager.admit();
        let kinds: Vec<MaintenanceOpKind> = admitted.iter().map(|op| op.op.kind()).collect();
        assert_eq!(kinds.len(), 2);
        assert_eq!(
            kinds.iter().filter(|k| **k == MaintenanceOpKind::Compact).count(),
            1
        );
        assert!(kinds.contains(&MaintenanceOpKind::LogGc));
        for op in admitted {
            manager.execute(op).unwrap();
        }
        assert!(manager.running_ops().is_empty());
    }

    #[test]
    fn failures_are_isolated_and_mark_tablet_degraded() {
        let fx = Fixture::new();
        let bad = fx.running_tablet("bad", 10);
        let good = fx.running_tablet("good", 10);
        let config = MaintenanceConfig {
            failure_threshold: 2,
            failure_window_ms: 60_000,
            ..MaintenanceConfig::default()
        };
        let manager = fx.manager(config);
        for _ in 0..2 {
            fx.storage.record_write(&bad, 5, 4096);
            fx.storage.record_write(&good, 5, 4096);
            fx.storage
                .inject_failure(&bad, StorageEngineError::Io("disk full".into()));
            let results = manager.run_cycle_inline();
            assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        }
        assert!(manager.is_degraded(&bad));
        assert!(!manager.is_degraded(&good));
        assert_eq!(fx.tablets.current_state(&bad).unwrap(), TabletState::Running);
        assert_eq!(fx.storage.flush_count(&good), 2);

        fx.clock.advance(Duration::from_millis(60_001));
        assert!(!manager.is_degraded(&bad));
    }

    #[test]
    fn status_reports_candidates_and_bounded_history() {
        let fx = Fixture::new();
        let tablet = fx.running_tablet("t1", 10);
        let config = MaintenanceConfig {
            completed_ops_history: 1,
            ..MaintenanceConfig::default()
        };
        let manager = fx.manager(config);
        fx.storage.record_write(&tablet, 10, 2048);
        manager.run_cycle_inline();
        fx.storage.update_stats(&tablet, |stats| stats.compaction_input_bytes = 100);
        manager.run_cycle_inline();

        fx.clock.advance(Duration::from_millis(25));
        let status = manager.maintenance_manager_status();
        assert_eq!(status.completed_ops.len(), 1);
        assert!(status.completed_ops[0].op.outcome.is_success());
        assert_eq!(status.completed_ops[0].time_since_start_ms, 25);
        assert_eq!(status.registered_ops.len(), 3);
        assert!(status.running_ops.is_empty());
    }

    #[test]
    fn completion_refreshes_disk_size() {
        let fx = Fixture::new();
        let tablet = fx.running_tablet("t1", 10);
        fx.storage.set_disk_size(
            &tablet,
            Some(crate::storage::OnDiskSizeInfo {
                consensus_metadata_bytes: 10,
                ..Default::default()
            }),
        );
        fx.storage.record_write(&tablet, 10, 1024);
        let manager = fx.manager(MaintenanceConfig::default());
        manager.run_cycle_inline();
        let snapshot = fx.tablets.snapshot(&tablet).unwrap();
        let size = snapshot.disk_size.unwrap();
        assert_eq!(size.sst_bytes, 1024);
        assert_eq!(size.wal_bytes, fx.consensus.wal_bytes_before(&tablet, u64::MAX));
        assert_eq!(snapshot.sst_files, 1);
    }

    #[tokio::test]
    async fn background_loop_runs_until_shutdown() {
        let fx = Fixture::new();
        let tablet = fx.running_tablet("t1", 10);
        fx.storage.record_write(&tablet, 10, 1024);
        let manager = Arc::new(fx.manager(MaintenanceConfig {
            polling_interval_ms: 5,
            ..MaintenanceConfig::default()
        }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = manager.clone().spawn(shutdown_rx);
        manager.signal_work();
        for _ in 0..200 {
            if fx.storage.flush_count(&tablet) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(fx.storage.flush_count(&tablet), 1);
        assert!(manager.running_ops().is_empty());
    }
}

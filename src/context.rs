//! Explicitly constructed wiring of every component on one tablet server.

use crate::anchor::LogAnchorRegistry;
use crate::cdc::{
    CdcService, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
use crate::config::RetentionConfig;
use crate::consensus::ConsensusLog;
use crate::maintenance::MaintenanceManager;
use crate::status::TabletStatusAggregator;
use crate::storage::StorageEngine;
use crate::tablet::{TabletDescriptor, TabletError, TabletId, TabletManager};
use crate::telemetry::SharedMetricsRegistry;
use crate::util::clock::SharedClock;
use crate::util::error::RetentionError;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const METRICS_NAMESPACE: &str = "retention";

/// Owns the tablet arena, anchor registry, maintenance manager, CDC service
/// and status aggregator. Build one per server (or per test); background
/// loops run between [`start`](Self::start) and [`shutdown`](Self::shutdown).
pub struct RetentionContext {
    config: RetentionConfig,
    metrics: SharedMetricsRegistry,
    tablets: Arc<TabletManager>,
    anchors: Arc<LogAnchorRegistry>,
    maintenance: Arc<MaintenanceManager>,
    cdc: Arc<CdcService>,
    status: TabletStatusAggregator,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RetentionContext {
    /// Wires the components and replays persisted streams. Tablets that
    /// are already registered get their anchors restored too.
    pub fn new(
        config: RetentionConfig,
        consensus: Arc<dyn ConsensusLog>,
        storage: Arc<dyn StorageEngine>,
        clock: SharedClock,
    ) -> Result<Self, RetentionError> {
        config.validate()?;
        let store: Arc<dyn CheckpointStore> = match &config.cdc.checkpoint_log_path {
            Some(path) => Arc::new(FileCheckpointStore::open(path)?),
            None => Arc::new(InMemoryCheckpointStore::new()),
        };
        let metrics = SharedMetricsRegistry::new(METRICS_NAMESPACE);
        let tablets = Arc::new(TabletManager::new(consensus, clock.clone()));
        let anchors = Arc::new(LogAnchorRegistry::new(tablets.clone(), clock.clone()));
        let maintenance = Arc::new(MaintenanceManager::new(
            config.maintenance.clone(),
            tablets.clone(),
            anchors.clone(),
            storage.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let cdc = Arc::new(CdcService::new(
            config.cdc.clone(),
            tablets.clone(),
            anchors.clone(),
            storage,
            store,
            clock,
            metrics.clone(),
        ));
        cdc.restore()?;
        let status =
            TabletStatusAggregator::new(tablets.clone(), anchors.clone(), maintenance.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            metrics,
            tablets,
            anchors,
            maintenance,
            cdc,
            status,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Registers a tablet hosted here and reloads any anchors persisted for
    /// it in the consensus metadata.
    pub fn add_tablet(&self, descriptor: TabletDescriptor) -> Result<(), RetentionError> {
        let tablet = descriptor.tablet_id.clone();
        self.tablets.register_tablet(descriptor)?;
        let restored = self.anchors.restore(&tablet)?;
        if restored > 0 {
            info!(
                "event=tablet_anchors_reloaded tablet={} anchors={}",
                tablet, restored
            );
        }
        self.cdc.release_orphaned_anchors(&tablet);
        Ok(())
    }

    /// Permanent removal: the tablet record, its anchors and its failure
    /// history all go.
    pub fn remove_tablet(&self, tablet: &TabletId) -> Result<TabletDescriptor, TabletError> {
        let descriptor = self.tablets.remove_tablet(tablet)?;
        let dropped = self.anchors.forget_tablet(tablet);
        self.maintenance.forget_tablet(tablet);
        info!(
            "event=tablet_forgotten tablet={} anchors_dropped={}",
            tablet, dropped
        );
        Ok(descriptor)
    }

    /// Spawns the maintenance loop and the CDC expiry/release sweeper.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            warn!("event=retention_context_already_started");
            return;
        }
        self.tasks.push(
            self.maintenance
                .clone()
                .spawn(self.shutdown_tx.subscribe()),
        );
        self.tasks
            .push(self.cdc.clone().spawn_sweeper(self.shutdown_tx.subscribe()));
        info!("event=retention_context_started tasks={}", self.tasks.len());
    }

    /// Stops the background loops and waits for in-flight maintenance ops.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!("event=retention_task_join_failed error={}", err);
            }
        }
        info!("event=retention_context_stopped");
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetricsRegistry {
        &self.metrics
    }

    pub fn tablets(&self) -> &Arc<TabletManager> {
        &self.tablets
    }

    pub fn anchors(&self) -> &Arc<LogAnchorRegistry> {
        &self.anchors
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceManager> {
        &self.maintenance
    }

    pub fn cdc(&self) -> &Arc<CdcService> {
        &self.cdc
    }

    pub fn status(&self) -> &TabletStatusAggregator {
        &self.status
    }
}

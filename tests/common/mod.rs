#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use tablet_retention::{
    InMemoryConsensus, InMemoryStorage, ManualClock, PeerRole, RetentionConfig, RetentionContext,
    TabletDescriptor, TabletId, TabletState,
};

pub const START_MS: u64 = 1_000_000;

/// A context over in-memory consensus and storage with a manual clock.
/// The collaborators outlive the context so a test can rebuild it to
/// simulate a restart.
pub struct Harness {
    pub consensus: Arc<InMemoryConsensus>,
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<ManualClock>,
    pub context: RetentionContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RetentionConfig::default())
    }

    pub fn with_config(config: RetentionConfig) -> Self {
        let consensus = Arc::new(InMemoryConsensus::new());
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(START_MS));
        let context = RetentionContext::new(
            config,
            consensus.clone(),
            storage.clone(),
            clock.clone(),
        )
        .expect("context");
        Self {
            consensus,
            storage,
            clock,
            context,
        }
    }

    /// Same collaborators, fresh context: everything held only in memory
    /// by the previous context is gone.
    pub fn restart(self, config: RetentionConfig) -> Self {
        let Harness {
            consensus,
            storage,
            clock,
            context,
        } = self;
        drop(context);
        let context = RetentionContext::new(
            config,
            consensus.clone(),
            storage.clone(),
            clock.clone(),
        )
        .expect("context after restart");
        Self {
            consensus,
            storage,
            clock,
            context,
        }
    }

    /// Registers a tablet of table `table` in namespace `shop`.
    pub fn add_tablet(&self, id: &str, table: &str) -> TabletId {
        self.context
            .add_tablet(TabletDescriptor::new(id, table, "shop", table))
            .expect("add tablet");
        TabletId::new(id)
    }

    pub fn move_to(&self, tablet: &TabletId, states: &[TabletState]) {
        for state in states {
            self.context
                .tablets()
                .transition(tablet, *state)
                .expect("transition");
        }
    }

    /// A running tablet led by this node with `entries` committed entries.
    pub fn leader_tablet(&self, id: &str, table: &str, entries: usize) -> TabletId {
        let tablet = self.add_tablet(id, table);
        self.move_to(&tablet, &[TabletState::Bootstrapping, TabletState::Running]);
        self.consensus.set_role(&tablet, PeerRole::Leader);
        if entries > 0 {
            self.consensus.append_many(&tablet, 1, entries);
        }
        tablet
    }

    /// Appends `count` entries and records them as unflushed writes.
    pub fn write(&self, tablet: &TabletId, count: usize) -> u64 {
        let last = self.consensus.append_many(tablet, 1, count);
        self.storage
            .record_write(tablet, last.index, (count as u64) * 64);
        last.index
    }
}

pub fn config_with_checkpoint_log(path: &Path) -> RetentionConfig {
    let mut config = RetentionConfig::default();
    config.cdc.checkpoint_log_path = Some(path.to_path_buf());
    config
}

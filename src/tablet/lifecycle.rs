use super::{TabletError, TabletId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a tablet replica on this node.
///
/// `NotStarted -> Bootstrapping -> Running -> {Failed, Stopped}`. A tablet
/// may also fail or be stopped straight out of bootstrap, and a tablet that
/// never started may be stopped (removed before open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TabletState {
    NotStarted,
    Bootstrapping,
    Running,
    Failed,
    Stopped,
}

impl TabletState {
    pub fn label(&self) -> &'static str {
        match self {
            TabletState::NotStarted => "NOT_STARTED",
            TabletState::Bootstrapping => "BOOTSTRAPPING",
            TabletState::Running => "RUNNING",
            TabletState::Failed => "FAILED",
            TabletState::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TabletState::Failed | TabletState::Stopped)
    }

    pub fn can_transition_to(&self, next: TabletState) -> bool {
        use TabletState::*;
        matches!(
            (self, next),
            (NotStarted, Bootstrapping)
                | (NotStarted, Stopped)
                | (Bootstrapping, Running)
                | (Bootstrapping, Failed)
                | (Bootstrapping, Stopped)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }
}

impl fmt::Display for TabletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct TabletLifecycle {
    state: TabletState,
    last_status: String,
    changed_at_ms: u64,
}

impl TabletLifecycle {
    pub fn new(now_ms: u64) -> Self {
        Self {
            state: TabletState::NotStarted,
            last_status: String::new(),
            changed_at_ms: now_ms,
        }
    }

    pub fn state(&self) -> TabletState {
        self.state
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    pub fn changed_at_ms(&self) -> u64 {
        self.changed_at_ms
    }

    pub fn set_last_status(&mut self, status: impl Into<String>) {
        self.last_status = status.into();
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(
        &mut self,
        tablet: &TabletId,
        next: TabletState,
        now_ms: u64,
    ) -> Result<TabletState, TabletError> {
        if !self.state.can_transition_to(next) {
            return Err(TabletError::IllegalTransition {
                tablet: tablet.clone(),
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.changed_at_ms = now_ms;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_lifecycle() {
        let tablet = TabletId::new("t1");
        let mut lifecycle = TabletLifecycle::new(0);
        lifecycle
            .transition(&tablet, TabletState::Bootstrapping, 1)
            .unwrap();
        lifecycle.transition(&tablet, TabletState::Running, 2).unwrap();
        let previous = lifecycle.transition(&tablet, TabletState::Failed, 3).unwrap();
        assert_eq!(previous, TabletState::Running);
        assert_eq!(lifecycle.state(), TabletState::Failed);
        assert_eq!(lifecycle.changed_at_ms(), 3);
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let tablet = TabletId::new("t1");
        let mut lifecycle = TabletLifecycle::new(0);
        lifecycle.transition(&tablet, TabletState::Stopped, 1).unwrap();
        let err = lifecycle
            .transition(&tablet, TabletState::Running, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            TabletError::IllegalTransition {
                from: TabletState::Stopped,
                to: TabletState::Running,
                ..
            }
        ));
        assert!(TabletState::Stopped.is_terminal());
    }

    #[test]
    fn cannot_skip_bootstrap() {
        assert!(!TabletState::NotStarted.can_transition_to(TabletState::Running));
        assert!(!TabletState::Running.can_transition_to(TabletState::Bootstrapping));
    }
}

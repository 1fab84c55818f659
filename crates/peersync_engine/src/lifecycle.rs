//! Service lifecycle state machine.

use crate::error::{SyncError, SyncResult};
use crate::log::now_millis;
use std::collections::VecDeque;
use std::fmt;

const HISTORY_LIMIT: usize = 64;

/// Lifecycle of the sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing is running.
    Idle,
    /// Services are being launched.
    Starting,
    /// Services are running.
    Running,
    /// Services are being shut down.
    Stopping,
}

impl LifecycleState {
    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Starting) | (Starting, Running) | (Running, Stopping) | (Stopping, Idle)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    /// Previous state.
    pub from: LifecycleState,
    /// New state.
    pub to: LifecycleState,
    /// When it happened (Unix millis).
    pub at: u64,
}

/// Current state plus a bounded transition history.
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    history: VecDeque<StateTransition>,
}

impl Lifecycle {
    /// Starts in [`LifecycleState::Idle`].
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Moves to `next`, recording the transition.
    pub fn transition(&mut self, next: LifecycleState) -> SyncResult<StateTransition> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let transition = StateTransition {
            from: self.state,
            to: next,
            at: now_millis(),
        };
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition);
        self.state = next;
        Ok(transition)
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> Vec<StateTransition> {
        self.history.iter().copied().collect()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn full_cycle() {
        let mut lifecycle = Lifecycle::new();
        for next in [Starting, Running, Stopping, Idle] {
            lifecycle.transition(next).unwrap();
        }
        let states: Vec<_> = lifecycle.history().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            states,
            vec![
                (Idle, Starting),
                (Starting, Running),
                (Running, Stopping),
                (Stopping, Idle)
            ]
        );
    }

    #[test]
    fn rejects_skipped_states() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle.transition(Running).unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
        assert_eq!(lifecycle.state(), Idle);
        assert!(lifecycle.history().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let mut lifecycle = Lifecycle::new();
        for _ in 0..HISTORY_LIMIT {
            for next in [Starting, Running, Stopping, Idle] {
                lifecycle.transition(next).unwrap();
            }
        }
        let history = lifecycle.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().map(|t| t.to), Some(Idle));
    }
}

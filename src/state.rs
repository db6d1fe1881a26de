//! Circuit breaker state machine implementation.

use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;

use atomic::Atomic;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed = 0,

    /// Circuit is open and operations are rejected.
    Open = 1,

    /// Circuit is admitting a bounded number of trial operations to test recovery.
    HalfOpen = 2,
}

impl State {
    /// Lower-case label used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the current state and when it was entered.
///
/// Reads are lock-free. Writers must hold the breaker's core lock so that the
/// state always agrees with the window it was derived from.
pub(crate) struct StateManager {
    state: Atomic<State>,
    last_transition: parking_lot::Mutex<Instant>,
}

impl StateManager {
    pub(crate) fn new() -> Self {
        Self {
            state: Atomic::new(State::Closed),
            last_transition: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn current(&self) -> State {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn time_in_state(&self) -> Duration {
        self.last_transition.lock().elapsed()
    }

    /// Attempts to transition from one state to another.
    /// Returns true if the transition happened.
    pub(crate) fn transition_from_to(&self, from: State, to: State) -> bool {
        if from == to {
            return false;
        }

        let result = self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if result {
            *self.last_transition.lock() = Instant::now();
        }

        result
    }

    /// Moves to `to` from whatever the current state is. Returns the previous
    /// state when a transition happened.
    pub(crate) fn force(&self, to: State) -> Option<State> {
        let current = self.current();
        if self.transition_from_to(current, to) {
            Some(current)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        assert_eq!(StateManager::new().current(), State::Closed);
    }

    #[test]
    fn transition_requires_matching_origin() {
        let manager = StateManager::new();
        assert!(!manager.transition_from_to(State::Open, State::HalfOpen));
        assert!(manager.transition_from_to(State::Closed, State::Open));
        assert_eq!(manager.current(), State::Open);
    }

    #[test]
    fn force_reports_previous_state() {
        let manager = StateManager::new();
        assert_eq!(manager.force(State::Closed), None);
        assert_eq!(manager.force(State::Open), Some(State::Closed));
        assert_eq!(manager.force(State::HalfOpen), Some(State::Open));
    }

    #[test]
    fn serializes_like_the_dashboard_expects() {
        let json = serde_json::to_string(&State::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }
}

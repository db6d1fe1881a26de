//! Listener registry for circuit breaker events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::broadcast;

use crate::state::State;

/// A circuit breaker state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// Name of the breaker that transitioned.
    pub breaker: String,
    /// State before the transition.
    pub from: State,
    /// State after the transition.
    pub to: State,
    /// Window failure rate at the moment of transition (0.0–1.0).
    pub failure_rate: f64,
    /// Wall-clock time of the transition.
    pub at: DateTime<Utc>,
}

/// Observer of circuit breaker events.
///
/// Callbacks run synchronously on the calling task after the breaker has
/// released its internal lock; keep them short and non-blocking.
pub trait BreakerListener: Send + Sync + 'static {
    /// Called after every state transition, including manual ones.
    fn on_state_change(&self, change: &StateChange);

    /// Called when a call completes and is counted as a success.
    fn on_success(&self, _breaker: &str) {}

    /// Called when a call completes and is counted as a failure.
    fn on_failure(&self, _breaker: &str) {}

    /// Called when a call is refused without running.
    fn on_rejected(&self, _breaker: &str) {}
}

/// The set of listeners attached to one breaker.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<SmallVec<[Arc<dyn BreakerListener>; 4]>>,
}

impl ListenerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    pub fn register(&self, listener: Arc<dyn BreakerListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// True when no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    // Listeners are cloned out so a callback can register further listeners
    // without deadlocking.
    fn snapshot(&self) -> SmallVec<[Arc<dyn BreakerListener>; 4]> {
        self.listeners.read().clone()
    }

    pub(crate) fn notify_state_change(&self, change: &StateChange) {
        for listener in self.snapshot() {
            listener.on_state_change(change);
        }
    }

    pub(crate) fn notify_success(&self, breaker: &str) {
        for listener in self.snapshot() {
            listener.on_success(breaker);
        }
    }

    pub(crate) fn notify_failure(&self, breaker: &str) {
        for listener in self.snapshot() {
            listener.on_failure(breaker);
        }
    }

    pub(crate) fn notify_rejected(&self, breaker: &str) {
        for listener in self.snapshot() {
            listener.on_rejected(breaker);
        }
    }
}

/// Forwards state changes onto a broadcast channel so callers can observe
/// transitions as a stream instead of registering callbacks.
#[derive(Clone)]
pub struct BroadcastListener {
    sender: broadcast::Sender<StateChange>,
}

impl BroadcastListener {
    /// Creates a listener whose channel keeps up to `capacity` unread changes
    /// per receiver; slower receivers observe `Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Opens a new receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.sender.subscribe()
    }
}

impl BreakerListener for BroadcastListener {
    fn on_state_change(&self, change: &StateChange) {
        // No receivers is fine.
        let _ = self.sender.send(change.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        changes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl BreakerListener for Counting {
        fn on_state_change(&self, _change: &StateChange) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _breaker: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn change() -> StateChange {
        StateChange {
            breaker: "payment".into(),
            from: State::Closed,
            to: State::Open,
            failure_rate: 0.75,
            at: Utc::now(),
        }
    }

    #[test]
    fn notifies_every_listener() {
        let registry = ListenerRegistry::new();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        registry.register(a.clone());
        registry.register(b.clone());

        registry.notify_state_change(&change());
        registry.notify_failure("payment");
        registry.notify_success("payment");

        assert_eq!(a.changes.load(Ordering::SeqCst), 1);
        assert_eq!(b.changes.load(Ordering::SeqCst), 1);
        assert_eq!(a.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_listener_forwards_changes() {
        let listener = BroadcastListener::new(8);
        let mut rx = listener.subscribe();

        listener.on_state_change(&change());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.to, State::Open);
        assert_eq!(received.breaker, "payment");
    }
}

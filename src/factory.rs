//! Registry of named circuit breakers, one per dependency.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::breaker::CircuitBreaker;
use crate::config::{BreakerBuilder, BreakerConfig};
use crate::hook::{BreakerListener, BroadcastListener, StateChange};
use crate::metrics::{BreakerStats, MetricSink, NullMetricSink};

type BreakerMap = HashMap<String, CircuitBreaker, ahash::RandomState>;

const STATE_CHANGE_CAPACITY: usize = 256;

/// Maps dependency names to exactly one [`CircuitBreaker`] each.
///
/// Breakers are created lazily on first use and live as long as the factory.
/// Every breaker the factory builds shares its metric sink and default
/// listeners, and reports transitions on the factory's broadcast channel.
pub struct CircuitBreakerFactory {
    breakers: RwLock<BreakerMap>,
    metric_sink: Arc<dyn MetricSink>,
    listeners: RwLock<SmallVec<[Arc<dyn BreakerListener>; 4]>>,
    state_changes: BroadcastListener,
}

impl Default for CircuitBreakerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerFactory {
    /// Creates an empty factory with no metric sink.
    pub fn new() -> Self {
        Self::with_metric_sink(Arc::new(NullMetricSink))
    }

    /// Creates an empty factory reporting to `sink`.
    pub fn with_metric_sink(sink: Arc<dyn MetricSink>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::default()),
            metric_sink: sink,
            listeners: RwLock::new(SmallVec::new()),
            state_changes: BroadcastListener::new(STATE_CHANGE_CAPACITY),
        }
    }

    /// Attaches `listener` to every breaker created from now on.
    pub fn add_default_listener(&self, listener: Arc<dyn BreakerListener>) {
        self.listeners.write().push(listener);
    }

    /// Attaches `listener` to every breaker already registered and to every
    /// breaker created from now on.
    pub fn attach_listener(&self, listener: Arc<dyn BreakerListener>) {
        // Holding the map lock keeps `create` from slipping a breaker in between.
        let breakers = self.breakers.write();
        for breaker in breakers.values() {
            breaker.listeners().register(Arc::clone(&listener));
        }
        self.listeners.write().push(listener);
        debug!(existing = breakers.len(), "Attached breaker listener");
    }

    /// Observes transitions of every breaker built by this factory.
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_changes.subscribe()
    }

    /// Returns the breaker registered under `config.name`, creating it if
    /// absent. An existing breaker is returned untouched.
    pub fn create(&self, config: BreakerConfig) -> CircuitBreaker {
        if let Some(existing) = self.get(&config.name) {
            return existing;
        }

        let mut breakers = self.breakers.write();
        // Another caller may have won the race between the read and write locks.
        if let Some(existing) = breakers.get(&config.name) {
            return existing.clone();
        }

        let name = config.name.clone();
        let mut builder = BreakerBuilder::from_config(config)
            .shared_metric_sink(Arc::clone(&self.metric_sink))
            .listener(Arc::new(self.state_changes.clone()));
        for listener in self.listeners.read().iter() {
            builder = builder.listener(Arc::clone(listener));
        }
        let breaker = builder.build();

        info!(
            breaker = %name,
            failure_threshold = breaker.config().failure_threshold,
            window = breaker.config().sliding_window_size,
            reset_timeout_ms = breaker.config().reset_timeout.as_millis() as u64,
            "Registered circuit breaker"
        );
        breakers.insert(name, breaker.clone());
        breaker
    }

    /// Returns the breaker for `service_name`, creating it from the category
    /// preset if absent.
    pub fn get_or_create(&self, service_name: &str) -> CircuitBreaker {
        match self.get(service_name) {
            Some(breaker) => breaker,
            None => self.create(BreakerConfig::for_service(service_name)),
        }
    }

    /// Looks up a breaker by name.
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.read().get(name).cloned()
    }

    /// All registered breakers, sorted by name.
    pub fn get_all(&self) -> Vec<CircuitBreaker> {
        let mut all: Vec<_> = self.breakers.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Unregisters a breaker. Handles already held by callers keep working.
    pub fn remove(&self, name: &str) -> Option<CircuitBreaker> {
        let removed = self.breakers.write().remove(name);
        if removed.is_some() {
            debug!(breaker = %name, "Removed circuit breaker");
        }
        removed
    }

    /// Forces every breaker closed and clears its window.
    pub fn reset_all(&self) {
        for breaker in self.get_all() {
            breaker.reset();
        }
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// True when no breaker is registered.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Statistics for every registered breaker, sorted by name.
    pub fn get_stats(&self) -> Vec<BreakerStats> {
        self.get_all().iter().map(CircuitBreaker::stats).collect()
    }
}

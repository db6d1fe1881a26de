//! Lifetime statistics and metric sinks for circuit breakers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::State;

/// Trait for metrics sinks that can receive circuit breaker events.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a state transition event.
    fn record_state_transition(&self, breaker: &str, from: State, to: State);

    /// Records the window failure rate (0.0–1.0).
    fn record_error_rate(&self, breaker: &str, rate: f64);

    /// Records a call refused without running.
    fn record_rejection(&self, breaker: &str);

    /// Records a call result.
    fn record_call(&self, breaker: &str, success: bool, duration: Duration);

    /// Records a call that hit its timeout.
    fn record_timeout(&self, breaker: &str);
}

/// A null metrics sink that discards all events.
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _breaker: &str, _from: State, _to: State) {}
    fn record_error_rate(&self, _breaker: &str, _rate: f64) {}
    fn record_rejection(&self, _breaker: &str) {}
    fn record_call(&self, _breaker: &str, _success: bool, _duration: Duration) {}
    fn record_timeout(&self, _breaker: &str) {}
}

/// Counters that survive window resets and state changes.
#[derive(Debug, Default)]
pub(crate) struct LifetimeStats {
    total_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    timeouts: AtomicU64,
    opens: AtomicU64,
}

impl LifetimeStats {
    pub(crate) fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub(crate) fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub(crate) fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub(crate) fn totals(&self) -> (u64, u64, u64) {
        (
            self.total_calls.load(Ordering::Relaxed),
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

/// Point-in-time view of one breaker, suitable for a health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: State,
    /// Failure rate over the window (0.0–1.0).
    pub failure_rate: f64,
    /// Outcomes currently in the window.
    pub window_len: usize,
    /// Window capacity.
    pub window_size: usize,
    /// Calls that ran, over the breaker's lifetime.
    pub total_calls: u64,
    /// Calls counted as successes.
    pub successful_calls: u64,
    /// Calls counted as failures.
    pub failed_calls: u64,
    /// Calls refused without running.
    pub rejected_calls: u64,
    /// Calls that hit the request timeout.
    pub timeouts: u64,
    /// Number of times the circuit opened.
    pub opens: u64,
    /// Milliseconds since the circuit opened, while open or half-open.
    pub open_for_ms: Option<u64>,
    /// Half-open trial outcomes observed in the current half-open period.
    pub half_open_tests: u32,
    /// Successful half-open trials in the current half-open period.
    pub half_open_successes: u32,
}

#[cfg(feature = "prometheus")]
pub use self::prometheus_sink::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus_sink {
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::gauge::Gauge;
    use prometheus_client::registry::Registry;

    use super::MetricSink;
    use crate::state::State;

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct BreakerLabels {
        breaker: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct CallLabels {
        breaker: String,
        outcome: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct TransitionLabels {
        breaker: String,
        from: String,
        to: String,
    }

    /// Exports breaker events as Prometheus metrics.
    #[derive(Clone, Default)]
    pub struct PrometheusSink {
        calls: Family<CallLabels, Counter>,
        rejections: Family<BreakerLabels, Counter>,
        timeouts: Family<BreakerLabels, Counter>,
        transitions: Family<TransitionLabels, Counter>,
        error_rate: Family<BreakerLabels, Gauge<f64, AtomicU64>>,
    }

    impl PrometheusSink {
        /// Creates a sink and registers its metrics under `circuit_breaker_*`.
        pub fn new(registry: &mut Registry) -> Self {
            let sink = Self::default();
            registry.register(
                "circuit_breaker_calls",
                "Calls that ran through a circuit breaker",
                sink.calls.clone(),
            );
            registry.register(
                "circuit_breaker_rejections",
                "Calls refused by an open circuit",
                sink.rejections.clone(),
            );
            registry.register(
                "circuit_breaker_timeouts",
                "Calls that exceeded their request timeout",
                sink.timeouts.clone(),
            );
            registry.register(
                "circuit_breaker_transitions",
                "Circuit breaker state transitions",
                sink.transitions.clone(),
            );
            registry.register(
                "circuit_breaker_error_rate",
                "Failure rate over the sliding window",
                sink.error_rate.clone(),
            );
            sink
        }

        fn labels(breaker: &str) -> BreakerLabels {
            BreakerLabels {
                breaker: breaker.to_string(),
            }
        }
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, breaker: &str, from: State, to: State) {
            self.transitions
                .get_or_create(&TransitionLabels {
                    breaker: breaker.to_string(),
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
                .inc();
        }

        fn record_error_rate(&self, breaker: &str, rate: f64) {
            self.error_rate.get_or_create(&Self::labels(breaker)).set(rate);
        }

        fn record_rejection(&self, breaker: &str) {
            self.rejections.get_or_create(&Self::labels(breaker)).inc();
        }

        fn record_call(&self, breaker: &str, success: bool, _duration: Duration) {
            let outcome = if success { "success" } else { "failure" };
            self.calls
                .get_or_create(&CallLabels {
                    breaker: breaker.to_string(),
                    outcome: outcome.to_string(),
                })
                .inc();
        }

        fn record_timeout(&self, breaker: &str) {
            self.timeouts.get_or_create(&Self::labels(breaker)).inc();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use prometheus_client::encoding::text::encode;

        #[test]
        fn exports_transitions() {
            let mut registry = Registry::default();
            let sink = PrometheusSink::new(&mut registry);
            sink.record_state_transition("payment", State::Closed, State::Open);
            sink.record_call("payment", false, Duration::from_millis(3));

            let mut out = String::new();
            encode(&mut out, &registry).unwrap();
            assert!(out.contains("circuit_breaker_transitions_total"));
            assert!(out.contains("to=\"open\""));
        }
    }
}

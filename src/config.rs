//! Configuration for circuit breakers.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::hook::{BreakerListener, ListenerRegistry};
use crate::metrics::{MetricSink, NullMetricSink};
use crate::policy::{BreakerPolicy, FailureRatePolicy};

/// Default cap on concurrently admitted half-open trials.
pub const DEFAULT_MAX_HALF_OPEN_TRIALS: u32 = 5;

type ClassifyFn = dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync;

/// Decides whether an operation error counts against the circuit.
///
/// Errors it rejects still reach the caller but are recorded as successes,
/// since they say nothing about the dependency's health (a 404, a validation
/// failure).
#[derive(Clone)]
pub struct ErrorClassifier(Arc<ClassifyFn>);

impl ErrorClassifier {
    /// Every error is a failure.
    pub fn all() -> Self {
        Self(Arc::new(|_| true))
    }

    /// Wraps a custom predicate returning `true` for failures.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Classifies an error.
    pub fn is_failure(&self, error: &(dyn Error + 'static)) -> bool {
        (self.0)(error)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorClassifier")
    }
}

/// Immutable per-dependency breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Dependency name; the factory's key.
    pub name: String,
    /// Failure rate, in percent, at which a closed circuit opens.
    pub failure_threshold: f64,
    /// Number of recent outcomes considered.
    pub sliding_window_size: usize,
    /// How long the circuit stays open before admitting trials.
    pub reset_timeout: Duration,
    /// Outcomes required in the window before any trip decision.
    pub minimum_requests: usize,
    /// Upper bound on a single call, if any.
    pub request_timeout: Option<Duration>,
    /// Concurrent trial admissions allowed while half-open.
    pub max_half_open_trials: u32,
    /// Failure classification for operation errors.
    pub classifier: ErrorClassifier,
}

impl BreakerConfig {
    /// Configuration using the generic preset.
    pub fn new(name: impl Into<String>) -> Self {
        ServiceCategory::Generic.preset(name)
    }

    /// Configuration chosen by matching the service name against known
    /// dependency categories.
    pub fn for_service(name: impl Into<String>) -> Self {
        let name = name.into();
        ServiceCategory::classify(&name).preset(name)
    }

    /// Builds the default policy for this configuration.
    pub fn policy(&self) -> FailureRatePolicy {
        FailureRatePolicy::new(self.failure_threshold, self.minimum_requests)
    }
}

/// Dependency families with distinct protection presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCategory {
    /// Payment providers: trip early, recover slowly.
    Payment,
    /// Email and notification delivery.
    Email,
    /// Databases: short timeouts, quick recovery trials.
    Database,
    /// Third-party HTTP APIs.
    Api,
    /// Anything else.
    Generic,
}

const CATEGORY_KEYWORDS: &[(ServiceCategory, &[&str])] = &[
    (ServiceCategory::Payment, &["payment", "stripe", "billing"]),
    (ServiceCategory::Email, &["email", "mail", "smtp", "notification"]),
    (
        ServiceCategory::Database,
        &["database", "db", "postgres", "mongo", "sql"],
    ),
    (ServiceCategory::Api, &["api", "http"]),
];

impl ServiceCategory {
    /// Matches a service name against the known categories, case-insensitively.
    pub fn classify(service_name: &str) -> Self {
        let name = service_name.to_ascii_lowercase();
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| name.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(ServiceCategory::Generic)
    }

    /// The preset configuration for this category.
    pub fn preset(self, name: impl Into<String>) -> BreakerConfig {
        let (failure_threshold, sliding_window_size, reset_secs, minimum_requests, timeout_secs) =
            match self {
                ServiceCategory::Payment => (30.0, 20, 60, 5, 10),
                ServiceCategory::Email => (50.0, 10, 30, 3, 15),
                ServiceCategory::Database => (50.0, 20, 10, 5, 5),
                ServiceCategory::Api => (50.0, 20, 30, 5, 8),
                ServiceCategory::Generic => (50.0, 10, 30, 5, 10),
            };

        BreakerConfig {
            name: name.into(),
            failure_threshold,
            sliding_window_size,
            reset_timeout: Duration::from_secs(reset_secs),
            minimum_requests,
            request_timeout: Some(Duration::from_secs(timeout_secs)),
            max_half_open_trials: DEFAULT_MAX_HALF_OPEN_TRIALS,
            classifier: ErrorClassifier::all(),
        }
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder {
    config: BreakerConfig,
    policy: Option<Arc<dyn BreakerPolicy>>,
    metric_sink: Arc<dyn MetricSink>,
    listeners: ListenerRegistry,
}

impl BreakerBuilder {
    /// Creates a new builder starting from the generic preset.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(BreakerConfig::new(name))
    }

    /// Creates a builder seeded with an existing configuration.
    pub fn from_config(config: BreakerConfig) -> Self {
        Self {
            config,
            policy: None,
            metric_sink: Arc::new(NullMetricSink),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Sets the failure rate, in percent, that will trip the circuit.
    pub fn failure_threshold(mut self, percent: f64) -> Self {
        self.config.failure_threshold = percent;
        self
    }

    /// Sets how many recent outcomes are considered.
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Sets the number of outcomes required before considering the failure rate.
    pub fn minimum_requests(mut self, count: usize) -> Self {
        self.config.minimum_requests = count;
        self
    }

    /// Sets how long the circuit stays open before probing.
    pub fn reset_timeout(mut self, duration: Duration) -> Self {
        self.config.reset_timeout = duration;
        self
    }

    /// Bounds each async call.
    pub fn request_timeout(mut self, duration: Duration) -> Self {
        self.config.request_timeout = Some(duration);
        self
    }

    /// Removes the per-call bound.
    pub fn no_request_timeout(mut self) -> Self {
        self.config.request_timeout = None;
        self
    }

    /// Sets the number of concurrent half-open trials.
    pub fn max_half_open_trials(mut self, count: u32) -> Self {
        self.config.max_half_open_trials = count.max(1);
        self
    }

    /// Sets the predicate deciding which errors count as failures.
    pub fn classify_errors<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.classifier = ErrorClassifier::new(predicate);
        self
    }

    /// Replaces the default failure-rate policy.
    pub fn policy<P: BreakerPolicy>(mut self, policy: P) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    pub(crate) fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Registers a state-change listener.
    pub fn listener(self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listeners.register(listener);
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Builds a new circuit breaker with the configured settings.
    pub fn build(self) -> CircuitBreaker {
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(self.config.policy()));

        CircuitBreaker::new(self.config, policy, self.metric_sink, self.listeners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_match_on_name_fragments() {
        assert_eq!(ServiceCategory::classify("stripe-payments"), ServiceCategory::Payment);
        assert_eq!(ServiceCategory::classify("SendGrid-Email"), ServiceCategory::Email);
        assert_eq!(ServiceCategory::classify("mongodb"), ServiceCategory::Database);
        assert_eq!(ServiceCategory::classify("maps-api"), ServiceCategory::Api);
        assert_eq!(ServiceCategory::classify("scoring"), ServiceCategory::Generic);
    }

    #[test]
    fn presets_differ_by_category() {
        let payment = BreakerConfig::for_service("payment");
        let database = BreakerConfig::for_service("database");
        assert_eq!(payment.name, "payment");
        assert!(payment.failure_threshold < database.failure_threshold);
        assert!(payment.reset_timeout > database.reset_timeout);
        assert_eq!(payment.max_half_open_trials, DEFAULT_MAX_HALF_OPEN_TRIALS);
    }

    #[test]
    fn builder_overrides_preset() {
        let builder = BreakerBuilder::new("search")
            .failure_threshold(25.0)
            .sliding_window_size(8)
            .minimum_requests(2)
            .reset_timeout(Duration::from_millis(500))
            .no_request_timeout();

        let config = builder.config();
        assert_eq!(config.failure_threshold, 25.0);
        assert_eq!(config.sliding_window_size, 8);
        assert_eq!(config.minimum_requests, 2);
        assert_eq!(config.reset_timeout, Duration::from_millis(500));
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn custom_classifier_is_applied() {
        #[derive(Debug)]
        struct NotFound;
        impl fmt::Display for NotFound {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "not found")
            }
        }
        impl Error for NotFound {}

        let classifier = ErrorClassifier::new(|e| !e.is::<NotFound>());
        assert!(!classifier.is_failure(&NotFound));
        assert!(ErrorClassifier::all().is_failure(&NotFound));
    }
}

//! Core circuit breaker implementation.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{BreakerError, BreakerResult};
use crate::hook::{ListenerRegistry, StateChange};
use crate::metrics::{BreakerStats, LifetimeStats, MetricSink};
use crate::policy::{BreakerPolicy, TrialCounts, TrialVerdict};
use crate::state::{State, StateManager};
use crate::window::{RequestOutcome, SlidingWindow};

/// Mutable state guarded by one lock so that the window, timers and trial
/// counters always agree with the published state.
struct Core {
    window: SlidingWindow,
    opened_at: Option<Instant>,
    trials: TrialCounts,
    trials_in_flight: u32,
    // Bumped on every transition; a trial outcome only counts if it was
    // admitted in the current half-open period.
    generation: u64,
}

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner {
    config: BreakerConfig,
    state_manager: StateManager,
    core: Mutex<Core>,
    policy: Arc<dyn BreakerPolicy>,
    stats: LifetimeStats,
    metric_sink: Arc<dyn MetricSink>,
    listeners: ListenerRegistry,
}

/// Ticket for one admitted call.
///
/// Dropping it unsettled (the caller's future was cancelled) hands the
/// half-open trial slot back.
struct Admission<'a> {
    inner: &'a BreakerInner,
    trial: Option<u64>,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(generation) = self.trial {
            let mut core = self.inner.core.lock();
            if core.generation == generation {
                core.trials_in_flight = core.trials_in_flight.saturating_sub(1);
            }
        }
    }
}

/// A circuit breaker that wraps calls to one dependency to prevent cascading
/// failures.
///
/// Cloning is cheap and yields a handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the specified policy and settings.
    pub fn new(
        config: BreakerConfig,
        policy: Arc<dyn BreakerPolicy>,
        metric_sink: Arc<dyn MetricSink>,
        listeners: ListenerRegistry,
    ) -> Self {
        let core = Core {
            window: SlidingWindow::new(config.sliding_window_size),
            opened_at: None,
            trials: TrialCounts::default(),
            trials_in_flight: 0,
            generation: 0,
        };

        let inner = BreakerInner {
            config,
            state_manager: StateManager::new(),
            core: Mutex::new(core),
            policy,
            stats: LifetimeStats::default(),
            metric_sink,
            listeners,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder(name: impl Into<String>) -> BreakerBuilder {
        BreakerBuilder::new(name)
    }

    /// The dependency name this breaker protects.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The breaker's immutable configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Listeners notified by this breaker.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Gets the current state of the circuit breaker.
    pub fn current_state(&self) -> State {
        self.inner.state_manager.current()
    }

    /// Gets the failure rate over the sliding window (0.0–1.0).
    pub fn failure_rate(&self) -> f64 {
        self.inner.core.lock().window.failure_rate()
    }

    /// Number of outcomes currently in the sliding window.
    pub fn window_len(&self) -> usize {
        self.inner.core.lock().window.len()
    }

    /// When the circuit last opened, if it is open or half-open.
    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.core.lock().opened_at
    }

    /// Trial tallies for the current half-open period.
    pub fn trial_counts(&self) -> TrialCounts {
        self.inner.core.lock().trials
    }

    /// Executes a synchronous function wrapped by the circuit breaker.
    ///
    /// No timeout applies; use [`call_async`](Self::call_async) for bounded calls.
    pub fn call<F, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + 'static,
    {
        let mut admission = self.admit().ok_or(BreakerError::Open)?;

        let start = Instant::now();
        let result = f();
        let duration = start.elapsed();

        self.settle_result(&mut admission, result, duration)
    }

    /// Executes an async function under the configured request timeout.
    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let timeout = self.inner.config.request_timeout;
        self.call_async_with_timeout(timeout, f).await
    }

    /// Executes an async function, overriding the configured request timeout.
    pub async fn call_async_with_timeout<F, Fut, T, E>(
        &self,
        timeout: Option<Duration>,
        f: F,
    ) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let mut admission = self.admit().ok_or(BreakerError::Open)?;

        let start = Instant::now();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result,
                Err(_) => {
                    let duration = start.elapsed();
                    self.inner.stats.record_timeout();
                    self.inner.metric_sink.record_timeout(self.name());
                    warn!(
                        breaker = %self.name(),
                        timeout_ms = limit.as_millis() as u64,
                        "Protected call timed out"
                    );
                    self.settle(&mut admission, false, duration);
                    return Err(BreakerError::Timeout(limit));
                }
            },
            None => f().await,
        };
        let duration = start.elapsed();

        self.settle_result(&mut admission, result, duration)
    }

    /// Executes an async function, serving `fallback` instead of failing.
    ///
    /// A rejected call returns the fallback's result, errors included. A
    /// failed call returns the fallback's value if it succeeds; if the
    /// fallback fails too, the original error is returned.
    pub async fn call_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        f: F,
        fallback: G,
    ) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let result = self.call_async(f).await;
        self.recover_with(result, fallback).await
    }

    /// Replaces a failed or rejected result with the fallback's.
    pub(crate) async fn recover_with<G, GFut, T, E>(
        &self,
        result: BreakerResult<T, E>,
        fallback: G,
    ) -> BreakerResult<T, E>
    where
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        match result {
            Ok(value) => Ok(value),
            Err(BreakerError::Open) => {
                debug!(breaker = %self.name(), "Circuit open, serving fallback");
                fallback().await.map_err(BreakerError::Operation)
            }
            Err(original) => {
                warn!(breaker = %self.name(), error = %original, "Protected call failed, trying fallback");
                match fallback().await {
                    Ok(value) => Ok(value),
                    Err(fallback_error) => {
                        warn!(breaker = %self.name(), error = %fallback_error, "Fallback failed");
                        Err(original)
                    }
                }
            }
        }
    }

    /// Checks if a call is allowed based on the current state.
    fn admit(&self) -> Option<Admission<'_>> {
        let inner = &*self.inner;
        let mut change = None;

        let admitted = {
            let mut core = inner.core.lock();
            match inner.state_manager.current() {
                State::Closed => Some(None),
                State::Open => {
                    let open_for = core
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or_else(|| inner.state_manager.time_in_state());

                    if open_for >= inner.config.reset_timeout
                        && inner
                            .state_manager
                            .transition_from_to(State::Open, State::HalfOpen)
                    {
                        core.generation += 1;
                        core.trials = TrialCounts::default();
                        core.trials_in_flight = 1;
                        change = Some(self.state_change(
                            State::Open,
                            State::HalfOpen,
                            core.window.failure_rate(),
                        ));
                        Some(Some(core.generation))
                    } else {
                        None
                    }
                }
                State::HalfOpen => {
                    if core.trials_in_flight < inner.config.max_half_open_trials {
                        core.trials_in_flight += 1;
                        Some(Some(core.generation))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(change) = change {
            self.publish(change);
        }

        match admitted {
            Some(trial) => Some(Admission {
                inner,
                trial,
                settled: false,
            }),
            None => {
                inner.stats.record_rejection();
                inner.metric_sink.record_rejection(self.name());
                inner.listeners.notify_rejected(self.name());
                debug!(breaker = %self.name(), state = %self.current_state(), "Call rejected");
                None
            }
        }
    }

    fn settle_result<T, E>(
        &self,
        admission: &mut Admission<'_>,
        result: Result<T, E>,
        duration: Duration,
    ) -> BreakerResult<T, E>
    where
        E: Error + 'static,
    {
        match result {
            Ok(value) => {
                self.settle(admission, true, duration);
                Ok(value)
            }
            Err(e) => {
                let failure = self.inner.config.classifier.is_failure(&e);
                if !failure {
                    debug!(breaker = %self.name(), error = %e, "Error classified as ignorable");
                }
                self.settle(admission, !failure, duration);
                Err(BreakerError::Operation(e))
            }
        }
    }

    /// Records an outcome and applies any resulting transition.
    fn settle(&self, admission: &mut Admission<'_>, success: bool, duration: Duration) {
        admission.settled = true;
        let inner = &*self.inner;

        inner.metric_sink.record_call(self.name(), success, duration);
        if success {
            inner.stats.record_success();
            inner.listeners.notify_success(self.name());
        } else {
            inner.stats.record_failure();
            inner.listeners.notify_failure(self.name());
        }

        let change = {
            let mut core = inner.core.lock();
            core.window.record(RequestOutcome::now(success, duration));
            let rate = core.window.failure_rate();

            match inner.state_manager.current() {
                State::Closed => {
                    if inner.policy.should_trip(&core.window)
                        && inner
                            .state_manager
                            .transition_from_to(State::Closed, State::Open)
                    {
                        self.mark_open(&mut core);
                        Some(self.state_change(State::Closed, State::Open, rate))
                    } else {
                        None
                    }
                }
                State::HalfOpen => match admission.trial {
                    Some(generation) if generation == core.generation => {
                        core.trials_in_flight = core.trials_in_flight.saturating_sub(1);
                        core.trials.tests += 1;
                        if success {
                            core.trials.successes += 1;
                        }

                        match inner.policy.judge_trials(core.trials, success) {
                            TrialVerdict::Continue => None,
                            TrialVerdict::Close => {
                                if inner
                                    .state_manager
                                    .transition_from_to(State::HalfOpen, State::Closed)
                                {
                                    Self::mark_closed(&mut core);
                                    Some(self.state_change(State::HalfOpen, State::Closed, rate))
                                } else {
                                    None
                                }
                            }
                            TrialVerdict::Reopen => {
                                if inner
                                    .state_manager
                                    .transition_from_to(State::HalfOpen, State::Open)
                                {
                                    self.mark_open(&mut core);
                                    Some(self.state_change(State::HalfOpen, State::Open, rate))
                                } else {
                                    None
                                }
                            }
                        }
                    }
                    _ => None,
                },
                State::Open => None,
            }
        };

        if let Some(change) = change {
            self.publish(change);
        }
    }

    fn mark_open(&self, core: &mut Core) {
        core.opened_at = Some(Instant::now());
        core.trials = TrialCounts::default();
        core.trials_in_flight = 0;
        core.generation += 1;
        self.inner.stats.record_open();
    }

    fn mark_closed(core: &mut Core) {
        core.window.clear();
        core.opened_at = None;
        core.trials = TrialCounts::default();
        core.trials_in_flight = 0;
        core.generation += 1;
    }

    fn state_change(&self, from: State, to: State, failure_rate: f64) -> StateChange {
        StateChange {
            breaker: self.name().to_string(),
            from,
            to,
            failure_rate,
            at: Utc::now(),
        }
    }

    // Runs outside the core lock.
    fn publish(&self, change: StateChange) {
        match change.to {
            State::Open => warn!(
                breaker = %change.breaker,
                from = %change.from,
                failure_rate = change.failure_rate,
                "Circuit opened"
            ),
            State::HalfOpen => info!(breaker = %change.breaker, "Circuit half-open, admitting trial calls"),
            State::Closed => info!(breaker = %change.breaker, from = %change.from, "Circuit closed"),
        }

        self.inner
            .metric_sink
            .record_state_transition(&change.breaker, change.from, change.to);
        self.inner
            .metric_sink
            .record_error_rate(&change.breaker, change.failure_rate);
        self.inner.listeners.notify_state_change(&change);
    }

    /// Forces the circuit open, clearing the window. Returns false if it was
    /// already open.
    pub fn open(&self) -> bool {
        self.force(State::Open)
    }

    /// Forces the circuit closed, clearing the window. Returns false if it
    /// was already closed.
    pub fn close(&self) -> bool {
        self.force(State::Closed)
    }

    /// Forces the circuit closed and clears the window, even if it was
    /// already closed. Returns true if the state changed.
    pub fn reset(&self) -> bool {
        let changed = self.force(State::Closed);
        if !changed {
            let mut core = self.inner.core.lock();
            core.window.clear();
            core.trials = TrialCounts::default();
        }
        changed
    }

    fn force(&self, to: State) -> bool {
        let change = {
            let mut core = self.inner.core.lock();
            let rate = core.window.failure_rate();
            match self.inner.state_manager.force(to) {
                Some(from) => {
                    match to {
                        State::Open => self.mark_open(&mut core),
                        State::Closed => Self::mark_closed(&mut core),
                        State::HalfOpen => {
                            core.trials = TrialCounts::default();
                            core.trials_in_flight = 0;
                            core.generation += 1;
                        }
                    }
                    core.window.clear();
                    Some(self.state_change(from, to, rate))
                }
                None => None,
            }
        };

        match change {
            Some(change) => {
                info!(breaker = %self.name(), to = %to, "Circuit state forced");
                self.publish(change);
                true
            }
            None => false,
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> BreakerStats {
        let (total_calls, successful_calls, failed_calls) = self.inner.stats.totals();
        let core = self.inner.core.lock();
        let state = self.inner.state_manager.current();

        BreakerStats {
            name: self.name().to_string(),
            state,
            failure_rate: core.window.failure_rate(),
            window_len: core.window.len(),
            window_size: core.window.capacity(),
            total_calls,
            successful_calls,
            failed_calls,
            rejected_calls: self.inner.stats.rejections(),
            timeouts: self.inner.stats.timeouts(),
            opens: self.inner.stats.opens(),
            open_for_ms: core
                .opened_at
                .filter(|_| state != State::Closed)
                .map(|at| at.elapsed().as_millis() as u64),
            half_open_tests: core.trials.tests,
            half_open_successes: core.trials.successes,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name())
            .field("state", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    impl Error for Boom {}

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::builder("test")
            .failure_threshold(50.0)
            .sliding_window_size(4)
            .minimum_requests(4)
            .reset_timeout(Duration::from_millis(1000))
            .build()
    }

    fn fail(b: &CircuitBreaker) {
        let _ = b.call(|| -> Result<(), Boom> { Err(Boom) });
    }

    fn succeed(b: &CircuitBreaker) -> BreakerResult<(), Boom> {
        b.call(|| Ok(()))
    }

    #[test]
    fn no_decision_before_minimum_requests() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        assert_eq!(b.current_state(), State::Closed);
        fail(&b);
        assert_eq!(b.current_state(), State::Open);
    }

    #[test]
    fn opens_once_per_breach() {
        let b = breaker();
        for _ in 0..4 {
            fail(&b);
        }
        assert_eq!(b.stats().opens, 1);

        // Rejections do not run the operation or reopen.
        assert!(matches!(succeed(&b), Err(BreakerError::Open)));
        assert_eq!(b.stats().opens, 1);
        assert_eq!(b.stats().rejected_calls, 1);
    }

    #[test]
    fn success_reaching_minimum_can_trip() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        assert!(succeed(&b).is_ok());
        assert_eq!(b.current_state(), State::Open);
    }

    #[test]
    fn ignorable_errors_count_as_successes() {
        let b = CircuitBreaker::builder("lookups")
            .sliding_window_size(2)
            .minimum_requests(2)
            .classify_errors(|e| !e.is::<Boom>())
            .build();

        for _ in 0..4 {
            assert!(matches!(
                b.call(|| -> Result<(), Boom> { Err(Boom) }),
                Err(BreakerError::Operation(_))
            ));
        }
        assert_eq!(b.current_state(), State::Closed);
        assert_eq!(b.stats().failed_calls, 0);
    }

    #[test]
    fn manual_override_clears_window() {
        let b = breaker();
        fail(&b);
        fail(&b);
        assert_eq!(b.window_len(), 2);

        assert!(b.open());
        assert_eq!(b.window_len(), 0);
        assert!(!b.open());

        assert!(b.close());
        assert_eq!(b.current_state(), State::Closed);

        fail(&b);
        assert!(!b.reset());
        assert_eq!(b.window_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_bounded_trials() {
        let b = CircuitBreaker::builder("trials")
            .sliding_window_size(1)
            .minimum_requests(1)
            .reset_timeout(Duration::from_millis(100))
            .max_half_open_trials(2)
            .no_request_timeout()
            .build();
        fail(&b);
        assert_eq!(b.current_state(), State::Open);

        tokio::time::advance(Duration::from_millis(150)).await;

        let first = b.admit();
        assert!(first.is_some());
        assert_eq!(b.current_state(), State::HalfOpen);
        let second = b.admit();
        assert!(second.is_some());
        assert!(b.admit().is_none());

        // A cancelled trial frees its slot.
        drop(second);
        assert!(b.admit().is_some());
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let b = CircuitBreaker::builder("slow")
            .sliding_window_size(1)
            .minimum_requests(1)
            .request_timeout(Duration::from_millis(50))
            .build();

        let result = b
            .call_async(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, Boom>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(b.stats().timeouts, 1);
        assert_eq!(b.current_state(), State::Open);
    }

    #[tokio::test]
    async fn fallback_serves_rejected_calls() {
        let b = breaker();
        b.open();

        let result = b
            .call_with_fallback(
                || async { Ok::<_, Boom>("live") },
                || async { Ok("cached") },
            )
            .await;
        assert_eq!(result.unwrap(), "cached");
    }

    #[tokio::test]
    async fn failed_fallback_returns_original_error() {
        #[derive(Debug)]
        struct Tagged(&'static str);
        impl fmt::Display for Tagged {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.0)
            }
        }
        impl Error for Tagged {}

        let b = breaker();
        let result: BreakerResult<(), Tagged> = b
            .call_with_fallback(
                || async { Err(Tagged("primary")) },
                || async { Err(Tagged("fallback")) },
            )
            .await;

        match result {
            Err(BreakerError::Operation(e)) => assert_eq!(e.0, "primary"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

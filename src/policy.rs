//! Policy engine for circuit breaker trip and reset decisions.

use crate::window::SlidingWindow;

/// Trial tallies for the current half-open period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrialCounts {
    /// Trial outcomes observed.
    pub tests: u32,
    /// Successful trial outcomes observed.
    pub successes: u32,
}

impl TrialCounts {
    /// Success fraction over the observed trials, 0.0 when none completed.
    pub fn success_rate(&self) -> f64 {
        if self.tests == 0 {
            return 0.0;
        }
        self.successes as f64 / self.tests as f64
    }
}

/// What the breaker should do after a half-open trial completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialVerdict {
    /// Not enough evidence yet; keep probing.
    Continue,
    /// The dependency has recovered.
    Close,
    /// The dependency is still failing.
    Reopen,
}

/// A policy that determines when to trip and reset a circuit breaker.
pub trait BreakerPolicy: Send + Sync + 'static {
    /// Determines if a closed circuit should trip open given the current window.
    fn should_trip(&self, window: &SlidingWindow) -> bool;

    /// Judges the half-open period after a trial outcome has been counted.
    fn judge_trials(&self, trials: TrialCounts, last_succeeded: bool) -> TrialVerdict;
}

/// Trips on the failure rate over the sliding window once enough calls have
/// been observed, and closes after a run of successful trials.
#[derive(Debug, Clone)]
pub struct FailureRatePolicy {
    failure_threshold: f64,
    minimum_requests: usize,
    min_trials: u32,
    close_success_rate: f64,
}

impl FailureRatePolicy {
    /// Trial outcomes needed before a half-open breaker may close.
    pub const DEFAULT_MIN_TRIALS: u32 = 3;

    /// Trial success rate needed to close.
    pub const DEFAULT_CLOSE_SUCCESS_RATE: f64 = 0.8;

    /// Creates a policy. `failure_threshold_percent` is clamped to 0–100.
    pub fn new(failure_threshold_percent: f64, minimum_requests: usize) -> Self {
        Self {
            failure_threshold: failure_threshold_percent.clamp(0.0, 100.0) / 100.0,
            minimum_requests,
            min_trials: Self::DEFAULT_MIN_TRIALS,
            close_success_rate: Self::DEFAULT_CLOSE_SUCCESS_RATE,
        }
    }
}

impl BreakerPolicy for FailureRatePolicy {
    fn should_trip(&self, window: &SlidingWindow) -> bool {
        if window.is_empty() || window.len() < self.minimum_requests {
            return false;
        }
        window.failure_rate() >= self.failure_threshold
    }

    fn judge_trials(&self, trials: TrialCounts, last_succeeded: bool) -> TrialVerdict {
        if trials.tests < self.min_trials {
            if last_succeeded {
                TrialVerdict::Continue
            } else {
                TrialVerdict::Reopen
            }
        } else if trials.success_rate() >= self.close_success_rate {
            TrialVerdict::Close
        } else {
            TrialVerdict::Reopen
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::RequestOutcome;
    use std::time::Duration;

    fn window_with(results: &[bool]) -> SlidingWindow {
        let mut window = SlidingWindow::new(results.len().max(1));
        for &success in results {
            window.record(RequestOutcome::now(success, Duration::ZERO));
        }
        window
    }

    #[test]
    fn waits_for_minimum_requests() {
        let policy = FailureRatePolicy::new(50.0, 4);
        assert!(!policy.should_trip(&window_with(&[false, false, false])));
        assert!(policy.should_trip(&window_with(&[false, false, true, true])));
    }

    #[test]
    fn below_threshold_does_not_trip() {
        let policy = FailureRatePolicy::new(50.0, 4);
        assert!(!policy.should_trip(&window_with(&[false, true, true, true])));
    }

    #[test]
    fn early_trial_failure_reopens() {
        let policy = FailureRatePolicy::new(50.0, 4);
        let trials = TrialCounts { tests: 2, successes: 1 };
        assert_eq!(policy.judge_trials(trials, false), TrialVerdict::Reopen);
    }

    #[test]
    fn three_successful_trials_close() {
        let policy = FailureRatePolicy::new(50.0, 4);
        let pending = TrialCounts { tests: 2, successes: 2 };
        assert_eq!(policy.judge_trials(pending, true), TrialVerdict::Continue);

        let done = TrialCounts { tests: 3, successes: 3 };
        assert_eq!(policy.judge_trials(done, true), TrialVerdict::Close);
    }

    #[test]
    fn low_trial_success_rate_reopens() {
        let policy = FailureRatePolicy::new(50.0, 4);
        let trials = TrialCounts { tests: 3, successes: 2 };
        assert_eq!(policy.judge_trials(trials, false), TrialVerdict::Reopen);
    }
}

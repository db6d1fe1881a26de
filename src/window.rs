//! Count-based sliding window of call outcomes.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// The result of one protected call.
#[derive(Debug, Clone, Copy)]
pub struct RequestOutcome {
    /// When the call completed.
    pub at: Instant,
    /// Whether the call counted as a success.
    pub success: bool,
    /// How long the call ran.
    pub duration: Duration,
}

impl RequestOutcome {
    /// Outcome stamped with the current time.
    pub fn now(success: bool, duration: Duration) -> Self {
        Self {
            at: Instant::now(),
            success,
            duration,
        }
    }
}

/// The most recent `capacity` outcomes.
///
/// Success and failure tallies are adjusted on push and eviction, so reading
/// the failure rate never rescans the buffer.
#[derive(Debug)]
pub struct SlidingWindow {
    outcomes: VecDeque<RequestOutcome>,
    capacity: usize,
    successes: usize,
    failures: usize,
}

impl SlidingWindow {
    /// Creates an empty window. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            successes: 0,
            failures: 0,
        }
    }

    /// Appends an outcome, evicting the oldest one when full.
    pub fn record(&mut self, outcome: RequestOutcome) {
        if self.outcomes.len() == self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                if evicted.success {
                    self.successes -= 1;
                } else {
                    self.failures -= 1;
                }
            }
        }

        if outcome.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.outcomes.push_back(outcome);
    }

    /// Number of outcomes currently held.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True when no outcomes are held.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Maximum number of outcomes held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Successful outcomes in the window.
    pub fn successes(&self) -> usize {
        self.successes
    }

    /// Failed outcomes in the window.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Failures as a fraction of the outcomes held, 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.outcomes.len() as f64
    }

    /// Mean duration of the outcomes held.
    pub fn mean_duration(&self) -> Option<Duration> {
        if self.outcomes.is_empty() {
            return None;
        }
        let total: Duration = self.outcomes.iter().map(|o| o.duration).sum();
        Some(total / self.outcomes.len() as u32)
    }

    /// Drops every outcome.
    pub fn clear(&mut self) {
        self.outcomes.clear();
        self.successes = 0;
        self.failures = 0;
    }
}

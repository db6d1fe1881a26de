//! At-least-once event delivery.
//!
//! An [`EventQueue`] fronts one [`QueueAdapter`]: the in-process adapter or,
//! with the `redis` feature, a Redis-backed adapter shared between processes.
//! Both deliver each message to every subscriber, retry failed deliveries
//! with exponential backoff, and move exhausted messages to a dead-letter
//! sink. Consumers must tolerate duplicates.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::error::QueueError;

mod dispatch;
mod facade;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use facade::{EventQueue, QueueBackend};
pub use memory::{InProcessConfig, InProcessQueue};
#[cfg(feature = "redis")]
pub use redis_store::{RedisQueue, RedisQueueConfig};

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Default delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const BASE_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Delay before retrying a message whose `attempt`-th delivery failed:
/// `min(1000 * 2^(attempt-1), 30000)` milliseconds.
pub fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let millis = BASE_RETRY_DELAY_MS
        .saturating_mul(1u64 << exponent)
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(millis)
}

/// Shortest interval a worker will tick at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// `requested`, raised to [`MIN_POLL_INTERVAL`] when it is zero.
pub(crate) fn effective_poll_interval(requested: Duration) -> Duration {
    if requested < MIN_POLL_INTERVAL {
        warn!(
            requested_ms = requested.as_millis() as u64,
            "Poll interval too short; using the minimum"
        );
        return MIN_POLL_INTERVAL;
    }
    requested
}

/// Resolves once `shutdown` reads true or its sender is gone.
///
/// The borrowed value is released before returning, so the future can sit in
/// a `select!` whose other arms await.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// An application event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Event name, e.g. `payment.completed`.
    pub name: String,
    /// Event body.
    pub payload: serde_json::Value,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// An event occurring now.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// One delivery unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Message id, stable across retries.
    pub id: Uuid,
    /// The event being delivered.
    pub event: DomainEvent,
    /// Audit record to update when delivery settles.
    pub persisted_event_id: Option<Uuid>,
    /// 1-based delivery attempt this message represents.
    pub attempt: u32,
    /// Attempts allowed before dead-lettering.
    pub max_attempts: u32,
    /// Earliest delivery time; unset means immediately.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// First attempt of a new message.
    pub fn new(event: DomainEvent, persisted_event_id: Option<Uuid>, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            persisted_event_id,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            scheduled_for: None,
        }
    }

    /// The message for the next attempt, due after `delay`.
    pub fn next_attempt(&self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            attempt: self.attempt + 1,
            scheduled_for: Some(Utc::now() + delay),
            ..self.clone()
        }
    }

    /// True when no attempts remain after this one.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Time left until the message is due, if it is scheduled in the future.
    pub fn delay_remaining(&self) -> Option<Duration> {
        let due = self.scheduled_for?;
        (due - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// A message that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The message as of its final attempt.
    pub message: QueueMessage,
    /// Handler errors from the final attempt.
    pub error: String,
    /// When the message was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

/// Which adapter is serving the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local memory.
    InProcess,
    /// Shared Redis lists.
    Redis,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::InProcess => f.write_str("in_process"),
            BackendKind::Redis => f.write_str("redis"),
        }
    }
}

/// Queue depth and delivery counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Adapter serving the queue.
    pub backend: BackendKind,
    /// Messages due and waiting for a worker.
    pub backlog: u64,
    /// Messages waiting for a retry delay to elapse.
    pub delayed: u64,
    /// Messages claimed and being handled.
    pub in_flight: u64,
    /// Messages in the dead-letter sink.
    pub dead_letters: u64,
    /// Deliveries by this process that succeeded.
    pub delivered: u64,
    /// Deliveries by this process that were rescheduled.
    pub retried: u64,
    /// Deliveries by this process that ended in the dead-letter sink.
    pub dead_lettered: u64,
}

/// A subscriber to queued events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one delivery. Returning an error fails the whole delivery and
    /// schedules a retry for every subscriber, so handlers must be idempotent.
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "handler"
    }
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Transport contract shared by the queue backends.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// The backend this adapter talks to.
    fn backend(&self) -> BackendKind;

    /// Accepts a message for delivery. Returns once accepted, not delivered.
    async fn publish(&self, message: QueueMessage) -> Result<()>;

    /// Adds a subscriber for every subsequent delivery.
    fn subscribe(&self, handler: Arc<dyn EventHandler>);

    /// Stops the worker and releases claimed messages.
    async fn close(&self) -> Result<()>;

    /// Depth and counters.
    async fn stats(&self) -> Result<QueueStats>;

    /// Messages in the dead-letter sink, oldest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Moves a dead letter back onto the queue as a fresh first attempt.
    async fn replay_dead_letter(&self, message_id: Uuid) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn retry_delays_follow_the_schedule() {
        let delays: Vec<u64> = (1..=7).map(|a| retry_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn zero_poll_interval_is_raised_to_minimum() {
        assert_eq!(effective_poll_interval(Duration::ZERO), MIN_POLL_INTERVAL);
        assert_eq!(
            effective_poll_interval(Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn stopped_resolves_on_signal_or_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        stopped(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        stopped(&mut rx).await;
    }

    #[test]
    fn next_attempt_keeps_identity_and_schedules() {
        let message = QueueMessage::new(DomainEvent::new("a", json!({})), None, 3);
        let retry = message.next_attempt(Duration::from_secs(2));

        assert_eq!(retry.id, message.id);
        assert_eq!(retry.attempt, 2);
        assert!(retry.scheduled_for.is_some());
        assert!(retry.delay_remaining().is_some());
        assert!(!retry.is_last_attempt());
        assert!(retry.next_attempt(Duration::ZERO).is_last_attempt());
    }

    #[test]
    fn zero_max_attempts_still_delivers_once() {
        let message = QueueMessage::new(DomainEvent::new("a", json!({})), None, 0);
        assert_eq!(message.max_attempts, 1);
        assert!(message.is_last_attempt());
    }

    #[test]
    fn message_survives_json() {
        let message = QueueMessage::new(
            DomainEvent::new("session.booked", json!({"sessionId": 42})),
            Some(Uuid::new_v4()),
            5,
        );
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("persistedEventId"));
        let back: QueueMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    proptest! {
        #[test]
        fn retry_delays_are_monotonic_and_capped(attempt in 1u32..10_000) {
            let current = retry_delay(attempt);
            let next = retry_delay(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_millis(MAX_RETRY_DELAY_MS));
        }
    }
}

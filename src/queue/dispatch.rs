//! Delivery and settlement logic shared by the queue adapters.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use super::{retry_delay, DeadLetter, EventHandler, QueueMessage};
use crate::persistence::EventPersistence;

/// What an adapter must do with a message after one delivery attempt.
#[derive(Debug)]
pub(crate) enum Disposition {
    /// Every handler succeeded; drop the message.
    Delivered,
    /// Requeue `message` once `delay` has elapsed.
    Retry {
        message: QueueMessage,
        delay: Duration,
    },
    /// Attempts exhausted; move to the dead-letter sink.
    DeadLetter(DeadLetter),
}

#[derive(Debug, Default)]
pub(crate) struct DeliveryCounters {
    pub(crate) delivered: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
}

/// Fans messages out to subscribers and reports outcomes to persistence.
pub(crate) struct Dispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    persistence: Option<Arc<dyn EventPersistence>>,
    pub(crate) counters: DeliveryCounters,
}

impl Dispatcher {
    pub(crate) fn new(persistence: Option<Arc<dyn EventPersistence>>) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            persistence,
            counters: DeliveryCounters::default(),
        }
    }

    pub(crate) fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "Subscribed event handler");
        self.handlers.write().push(handler);
    }

    /// Runs every handler concurrently and decides the message's fate.
    /// A failing or panicking handler does not stop the others.
    pub(crate) async fn deliver(&self, message: &QueueMessage) -> Disposition {
        let handlers = self.handlers.read().clone();

        let results = join_all(handlers.iter().map(|handler| async move {
            let outcome = AssertUnwindSafe(handler.handle(message))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{}: {:#}", handler.name(), e)),
                Err(_) => Some(format!("{}: handler panicked", handler.name())),
            }
        }))
        .await;

        let errors: Vec<String> = results.into_iter().flatten().collect();
        if errors.is_empty() {
            self.on_delivered(message).await;
            Disposition::Delivered
        } else {
            self.on_failed(message, errors.join("; ")).await
        }
    }

    async fn on_delivered(&self, message: &QueueMessage) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(
            message_id = %message.id,
            event = %message.event.name,
            attempt = message.attempt,
            "Message delivered"
        );

        if let (Some(store), Some(id)) = (&self.persistence, message.persisted_event_id) {
            if let Err(e) = store.mark_processed(id).await {
                warn!(persisted_event_id = %id, error = %e, "Failed to mark event processed");
            }
        }
    }

    async fn on_failed(&self, message: &QueueMessage, error: String) -> Disposition {
        if message.is_last_attempt() {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            error!(
                message_id = %message.id,
                event = %message.event.name,
                attempts = message.attempt,
                error = %error,
                "Message exhausted its attempts, moving to dead letters"
            );

            if let (Some(store), Some(id)) = (&self.persistence, message.persisted_event_id) {
                if let Err(e) = store.mark_failed(id, message.attempt).await {
                    warn!(persisted_event_id = %id, error = %e, "Failed to mark event failed");
                }
            }

            return Disposition::DeadLetter(DeadLetter {
                message: message.clone(),
                error,
                failed_at: Utc::now(),
            });
        }

        let delay = retry_delay(message.attempt);
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        warn!(
            message_id = %message.id,
            event = %message.event.name,
            attempt = message.attempt,
            max_attempts = message.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Delivery failed, scheduling retry"
        );

        if let (Some(store), Some(id)) = (&self.persistence, message.persisted_event_id) {
            if let Err(e) = store.record_retry(id, message.attempt).await {
                warn!(persisted_event_id = %id, error = %e, "Failed to record retry");
            }
        }

        Disposition::Retry {
            message: message.next_attempt(delay),
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{EventStatus, InMemoryEventStore};
    use crate::queue::{handler_fn, DomainEvent};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn one_failing_handler_does_not_stop_others() {
        let dispatcher = Dispatcher::new(None);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        dispatcher.subscribe(handler_fn("counter", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        }));
        dispatcher.subscribe(handler_fn("broken", |_| async {
            Err::<(), _>(anyhow::anyhow!("smtp down"))
        }));

        let message = QueueMessage::new(DomainEvent::new("a", json!({})), None, 3);
        let disposition = dispatcher.deliver(&message).await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        match disposition {
            Disposition::Retry { message, delay } => {
                assert_eq!(message.attempt, 2);
                assert_eq!(delay, Duration::from_secs(1));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl EventHandler for Panics {
        async fn handle(&self, _message: &QueueMessage) -> anyhow::Result<()> {
            panic!("bad payload")
        }

        fn name(&self) -> &str {
            "panics"
        }
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_delivery() {
        let dispatcher = Dispatcher::new(None);
        dispatcher.subscribe(Arc::new(Panics));

        let message = QueueMessage::new(DomainEvent::new("a", json!({})), None, 1);
        match dispatcher.deliver(&message).await {
            Disposition::DeadLetter(dead) => assert!(dead.error.contains("panicked")),
            other => panic!("expected dead letter, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn settlement_updates_persistence() {
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = Dispatcher::new(Some(store.clone() as Arc<dyn EventPersistence>));
        dispatcher.subscribe(handler_fn("ok", |_| async { Ok::<_, anyhow::Error>(()) }));

        let event = DomainEvent::new("a", json!({}));
        let persisted = store.record(&event).await.unwrap();
        let message = QueueMessage::new(event, Some(persisted.id), 3);

        assert!(matches!(dispatcher.deliver(&message).await, Disposition::Delivered));
        let stored = store.get(persisted.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
        assert_eq!(dispatcher.counters.delivered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn no_subscribers_counts_as_delivered() {
        let dispatcher = Dispatcher::new(None);
        let message = QueueMessage::new(DomainEvent::new("a", json!({})), None, 3);
        assert!(matches!(dispatcher.deliver(&message).await, Disposition::Delivered));
    }
}

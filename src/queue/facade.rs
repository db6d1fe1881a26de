//! Backend selection and the producer-facing queue API.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::memory::InProcessQueue;
#[cfg(feature = "redis")]
use super::redis_store::{RedisQueue, RedisQueueConfig};
use super::{
    BackendKind, DeadLetter, DomainEvent, EventHandler, QueueAdapter, QueueMessage, QueueStats,
    Result,
};
use crate::persistence::{EventPersistence, PersistedEvent};
use crate::settings::QueueSettings;

/// The adapter an [`EventQueue`] resolved to at startup.
pub enum QueueBackend {
    /// Process-local queue.
    InProcess(InProcessQueue),
    /// Queue shared through Redis.
    #[cfg(feature = "redis")]
    Redis(RedisQueue),
}

impl QueueBackend {
    fn adapter(&self) -> &dyn QueueAdapter {
        match self {
            QueueBackend::InProcess(queue) => queue,
            #[cfg(feature = "redis")]
            QueueBackend::Redis(queue) => queue,
        }
    }
}

/// Producer and consumer entry point for domain events.
pub struct EventQueue {
    backend: QueueBackend,
    persistence: Option<Arc<dyn EventPersistence>>,
    max_attempts: u32,
}

impl EventQueue {
    /// Resolves the configured backend.
    ///
    /// Redis is used only when selected, configured and reachable; anything
    /// else degrades to the in-process adapter with a warning. This never
    /// fails.
    pub async fn connect(
        settings: &QueueSettings,
        persistence: Option<Arc<dyn EventPersistence>>,
    ) -> Self {
        let backend = match settings.backend {
            BackendKind::InProcess => {
                QueueBackend::InProcess(InProcessQueue::start(settings.in_process(), persistence.clone()))
            }
            BackendKind::Redis => Self::redis_or_fallback(settings, persistence.clone()).await,
        };

        info!(backend = %backend.adapter().backend(), "Event queue ready");
        Self {
            backend,
            persistence,
            max_attempts: settings.max_attempts.max(1),
        }
    }

    #[cfg(feature = "redis")]
    async fn redis_or_fallback(
        settings: &QueueSettings,
        persistence: Option<Arc<dyn EventPersistence>>,
    ) -> QueueBackend {
        let Some(url) = settings.redis_url.clone() else {
            warn!("Redis queue selected without a redis_url; using in-process queue");
            return QueueBackend::InProcess(InProcessQueue::start(settings.in_process(), persistence));
        };

        let config = RedisQueueConfig {
            url,
            key_prefix: settings.key_prefix.clone(),
            poll_interval: settings.poll_interval(),
            connect_timeout: settings.connect_timeout(),
            claim_ttl: settings.claim_ttl(),
        };
        match RedisQueue::connect(config, persistence.clone()).await {
            Ok(queue) => QueueBackend::Redis(queue),
            Err(e) => {
                warn!(error = %e, "Redis queue unavailable; degrading to in-process queue");
                QueueBackend::InProcess(InProcessQueue::start(settings.in_process(), persistence))
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn redis_or_fallback(
        settings: &QueueSettings,
        persistence: Option<Arc<dyn EventPersistence>>,
    ) -> QueueBackend {
        warn!("Redis queue selected but the `redis` feature is disabled; using in-process queue");
        QueueBackend::InProcess(InProcessQueue::start(settings.in_process(), persistence))
    }

    /// Wraps an already constructed backend.
    pub fn from_backend(
        backend: QueueBackend,
        persistence: Option<Arc<dyn EventPersistence>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backend,
            persistence,
            max_attempts: max_attempts.max(1),
        }
    }

    /// The backend actually in use.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.adapter().backend()
    }

    /// Queues `event`, linking it to `persisted` when given. Returns the
    /// message id once the backend has accepted it.
    pub async fn enqueue_event(
        &self,
        event: DomainEvent,
        persisted: Option<&PersistedEvent>,
    ) -> Result<Uuid> {
        let message = QueueMessage::new(event, persisted.map(|p| p.id), self.max_attempts);
        self.publish(message).await
    }

    async fn publish(&self, message: QueueMessage) -> Result<Uuid> {
        let id = message.id;
        debug!(
            message_id = %id,
            event = %message.event.name,
            persisted_event_id = ?message.persisted_event_id,
            attempt = message.attempt,
            "Enqueuing event"
        );
        self.backend.adapter().publish(message).await?;
        Ok(id)
    }

    /// Records `event` in persistence, then queues it.
    ///
    /// A persistence failure is logged and the event is queued unlinked.
    pub async fn emit(&self, event: DomainEvent) -> Result<Uuid> {
        let persisted = match &self.persistence {
            Some(store) => match store.record(&event).await {
                Ok(persisted) => Some(persisted),
                Err(e) => {
                    warn!(event = %event.name, error = %e, "Failed to persist event; queuing without audit record");
                    None
                }
            },
            None => None,
        };
        self.enqueue_event(event, persisted.as_ref()).await
    }

    /// Re-queues every pending record in `persistence`, e.g. after a restart.
    /// Returns how many were queued.
    ///
    /// A record resumes at the attempt after the ones it already used, so the
    /// total across restarts stays within `max_attempts`. Records that already
    /// used every attempt are marked failed instead.
    pub async fn recover_pending(&self, persistence: &dyn EventPersistence) -> Result<usize> {
        let pending = match persistence.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to load pending events for recovery");
                return Ok(0);
            }
        };

        let mut recovered = 0;
        for record in &pending {
            if record.retry_count >= self.max_attempts {
                warn!(
                    persisted_event_id = %record.id,
                    attempts = record.retry_count,
                    "Pending event has no attempts left; marking failed"
                );
                if let Err(e) = persistence.mark_failed(record.id, record.retry_count).await {
                    warn!(persisted_event_id = %record.id, error = %e, "Failed to mark event failed");
                }
                continue;
            }

            let mut message = QueueMessage::new(record.to_event(), Some(record.id), self.max_attempts);
            message.attempt = record.retry_count + 1;
            self.publish(message).await?;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "Re-queued pending events");
        }
        Ok(recovered)
    }

    /// Adds a subscriber. Call once per consuming module at startup.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.backend.adapter().subscribe(handler);
    }

    /// Stops delivery; see the adapter for drain semantics.
    pub async fn close(&self) -> Result<()> {
        self.backend.adapter().close().await
    }

    /// Depth and counters of the active backend.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.backend.adapter().stats().await
    }

    /// Messages that exhausted their attempts.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.backend.adapter().dead_letters().await
    }

    /// Re-queues one dead letter as a first attempt.
    pub async fn replay_dead_letter(&self, message_id: Uuid) -> Result<()> {
        self.backend.adapter().replay_dead_letter(message_id).await
    }
}

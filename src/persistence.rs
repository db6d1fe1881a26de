//! Durable record of emitted events.
//!
//! Every emitted event is recorded as pending before it is queued; the queue
//! reports back whether delivery succeeded or was abandoned. Records are
//! appended and updated, never deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::queue::DomainEvent;

/// Result alias for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Lifecycle of a persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Recorded, not yet delivered.
    Pending,
    /// Delivered to every subscriber.
    Processed,
    /// Retries exhausted; the message was dead-lettered.
    Failed,
}

/// Audit record of one emitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEvent {
    /// Record id.
    pub id: Uuid,
    /// Name of the recorded event.
    pub event_type: String,
    /// Event body.
    pub payload: serde_json::Value,
    /// When the event happened.
    pub emitted_at: DateTime<Utc>,
    /// When every subscriber accepted the event.
    pub processed_at: Option<DateTime<Utc>>,
    /// Delivery status.
    pub status: EventStatus,
    /// Delivery attempts that failed so far.
    pub retry_count: u32,
}

impl PersistedEvent {
    /// A fresh pending record for `event`.
    pub fn pending(event: &DomainEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event.name.clone(),
            payload: event.payload.clone(),
            emitted_at: event.occurred_at,
            processed_at: None,
            status: EventStatus::Pending,
            retry_count: 0,
        }
    }

    /// Rebuilds the domain event this record was created from.
    pub fn to_event(&self) -> DomainEvent {
        DomainEvent {
            name: self.event_type.clone(),
            payload: self.payload.clone(),
            occurred_at: self.emitted_at,
        }
    }
}

/// Storage for persisted events.
#[async_trait]
pub trait EventPersistence: Send + Sync {
    /// Records a newly emitted event as pending.
    async fn record(&self, event: &DomainEvent) -> Result<PersistedEvent>;

    /// Marks an event delivered.
    async fn mark_processed(&self, id: Uuid) -> Result<()>;

    /// Notes that a delivery attempt failed and another will follow.
    async fn record_retry(&self, id: Uuid, retry_count: u32) -> Result<()>;

    /// Marks an event abandoned after `attempts` delivery attempts.
    async fn mark_failed(&self, id: Uuid, attempts: u32) -> Result<()>;

    /// Looks up a record.
    async fn get(&self, id: Uuid) -> Result<Option<PersistedEvent>>;

    /// Pending records in emission order.
    async fn pending(&self) -> Result<Vec<PersistedEvent>>;
}

/// Process-local [`EventPersistence`] keeping records in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<IndexMap<Uuid, PersistedEvent>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Stores a record as-is, replacing any record with the same id.
    pub fn insert(&self, event: PersistedEvent) {
        self.events.write().insert(event.id, event);
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut PersistedEvent),
    {
        let mut events = self.events.write();
        let event = events.get_mut(&id).ok_or(PersistenceError::NotFound(id))?;
        f(event);
        Ok(())
    }
}

#[async_trait]
impl EventPersistence for InMemoryEventStore {
    async fn record(&self, event: &DomainEvent) -> Result<PersistedEvent> {
        let persisted = PersistedEvent::pending(event);
        self.insert(persisted.clone());
        Ok(persisted)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        self.update(id, |event| {
            event.status = EventStatus::Processed;
            event.processed_at = Some(Utc::now());
        })
    }

    async fn record_retry(&self, id: Uuid, retry_count: u32) -> Result<()> {
        self.update(id, |event| event.retry_count = retry_count)
    }

    async fn mark_failed(&self, id: Uuid, attempts: u32) -> Result<()> {
        self.update(id, |event| {
            event.status = EventStatus::Failed;
            event.retry_count = attempts;
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<PersistedEvent>> {
        Ok(self.events.read().get(&id).cloned())
    }

    async fn pending(&self) -> Result<Vec<PersistedEvent>> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|e| e.status == EventStatus::Pending)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_start_pending() {
        let store = InMemoryEventStore::new();
        let event = DomainEvent::new("match.created", json!({"clientId": 7}));
        let persisted = store.record(&event).await.unwrap();

        assert_eq!(persisted.status, EventStatus::Pending);
        assert_eq!(persisted.event_type, "match.created");
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_transitions() {
        let store = InMemoryEventStore::new();
        let a = store.record(&DomainEvent::new("a", json!({}))).await.unwrap();
        let b = store.record(&DomainEvent::new("b", json!({}))).await.unwrap();

        store.mark_processed(a.id).await.unwrap();
        store.mark_failed(b.id, 3).await.unwrap();

        let a = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, EventStatus::Processed);
        assert!(a.processed_at.is_some());

        let b = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(b.status, EventStatus::Failed);
        assert_eq!(b.retry_count, 3);
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let store = InMemoryEventStore::new();
        let err = store.mark_processed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[tokio::test]
    async fn pending_preserves_emission_order() {
        let store = InMemoryEventStore::new();
        for name in ["first", "second", "third"] {
            store.record(&DomainEvent::new(name, json!(null))).await.unwrap();
        }
        let names: Vec<_> = store
            .pending()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{Event, EventId, EventStatus, Provider, StatusFields};

/// Source of truth for admitted events and their status.
///
/// Implementations must make [`create`](EventStore::create) and
/// [`update_status`](EventStore::update_status) atomic: uniqueness of
/// (provider, event id) and the status compare-and-set are enforced by the
/// storage itself, not by callers checking first.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_by_provider_and_event_id(
        &self,
        provider: &Provider,
        event_id: &str,
    ) -> Result<Option<Event>, StoreError>;

    async fn find_by_id(&self, id: &EventId) -> Result<Option<Event>, StoreError>;

    /// Insert a new event, failing with [`StoreError::DuplicateEvent`] if
    /// the (provider, event id) pair exists.
    async fn create(&self, event: Event) -> Result<Event, StoreError>;

    /// Move `id` to `status`. Fails with [`StoreError::StaleRetryCount`]
    /// when `fields` carries an expected retry count that no longer holds.
    async fn update_status(
        &self,
        id: &EventId,
        status: EventStatus,
        fields: StatusFields,
    ) -> Result<Event, StoreError>;

    /// Delete an event that is still `PENDING`, returning whether a row
    /// went away. Rolls back an admission whose job was never enqueued.
    async fn remove_pending(&self, id: &EventId) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Records {
    events: HashMap<EventId, Event>,
    by_external: HashMap<(Provider, String), EventId>,
}

/// In-memory event store for tests and embedded deployments.
#[derive(Default)]
pub struct InMemoryEventStore {
    records: Mutex<Records>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All events, oldest first.
    pub async fn snapshot(&self) -> Vec<Event> {
        let guard = self.records.lock().await;
        let mut events: Vec<Event> = guard.events.values().cloned().collect();
        events.sort_by_key(|e| e.created_at);
        events
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn find_by_provider_and_event_id(
        &self,
        provider: &Provider,
        event_id: &str,
    ) -> Result<Option<Event>, StoreError> {
        let guard = self.records.lock().await;
        let found = guard
            .by_external
            .get(&(provider.clone(), event_id.to_string()))
            .and_then(|id| guard.events.get(id))
            .cloned();
        Ok(found)
    }

    async fn find_by_id(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.records.lock().await.events.get(id).cloned())
    }

    async fn create(&self, event: Event) -> Result<Event, StoreError> {
        let mut guard = self.records.lock().await;
        let key = (event.provider.clone(), event.event_id.clone());
        if guard.by_external.contains_key(&key) {
            return Err(StoreError::DuplicateEvent {
                provider: event.provider,
                event_id: event.event_id,
            });
        }
        guard.by_external.insert(key, event.id);
        guard.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn update_status(
        &self,
        id: &EventId,
        status: EventStatus,
        fields: StatusFields,
    ) -> Result<Event, StoreError> {
        let mut guard = self.records.lock().await;
        let event = guard.events.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        event.transition(status, &fields)?;
        Ok(event.clone())
    }

    async fn remove_pending(&self, id: &EventId) -> Result<bool, StoreError> {
        let mut guard = self.records.lock().await;
        let key = match guard.events.get(id) {
            Some(event) if event.status == EventStatus::Pending => {
                (event.provider.clone(), event.event_id.clone())
            }
            _ => return Ok(false),
        };
        guard.events.remove(id);
        guard.by_external.remove(&key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::types::NewEvent;

    fn new_event(provider: Provider, event_id: &str) -> Event {
        Event::admitted(NewEvent {
            provider,
            event_id: event_id.to_string(),
            event_type: "payment.succeeded".to_string(),
            payload: serde_json::json!({ "id": event_id }),
            signature: Some("sig".to_string()),
            max_retries: 3,
        })
    }

    #[tokio::test]
    async fn create_enforces_uniqueness_per_provider() {
        let store = InMemoryEventStore::new();
        store.create(new_event(Provider::Stripe, "evt_1")).await.unwrap();

        let err = store.create(new_event(Provider::Stripe, "evt_1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEvent { .. }));

        // Same external id from a different provider is a different event.
        store.create(new_event(Provider::Github, "evt_1")).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_creates_admit_exactly_one() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create(new_event(Provider::Paypal, "evt_race")).await.is_ok()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn find_by_provider_and_event_id() {
        let store = InMemoryEventStore::new();
        let created = store.create(new_event(Provider::Stripe, "evt_9")).await.unwrap();

        let found = store
            .find_by_provider_and_event_id(&Provider::Stripe, "evt_9")
            .await
            .unwrap();
        assert_eq!(found.map(|e| e.id), Some(created.id));
        assert!(store
            .find_by_provider_and_event_id(&Provider::Github, "evt_9")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_status_applies_fields_and_rejects_backward_moves() {
        let store = InMemoryEventStore::new();
        let event = store.create(new_event(Provider::Stripe, "evt_2")).await.unwrap();

        store
            .update_status(&event.id, EventStatus::Processing, StatusFields::new())
            .await
            .unwrap();

        let now = Utc::now();
        let done = store
            .update_status(
                &event.id,
                EventStatus::Completed,
                StatusFields::new().with_processed_at(now).with_next_retry_at(None),
            )
            .await
            .unwrap();
        assert_eq!(done.status, EventStatus::Completed);
        assert_eq!(done.processed_at, Some(now));

        let err = store
            .update_status(&event.id, EventStatus::Processing, StatusFields::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                id: event.id,
                from: EventStatus::Completed,
                to: EventStatus::Processing,
            }
        );
    }

    #[tokio::test]
    async fn retry_count_update_is_compare_and_set() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = store.create(new_event(Provider::Stripe, "evt_cas")).await.unwrap();
        store
            .update_status(&event.id, EventStatus::Processing, StatusFields::new())
            .await
            .unwrap();

        // Two deliveries that both loaded retry_count 0 record a failure.
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let id = event.id;
            handles.push(tokio::spawn(async move {
                store
                    .update_status(
                        &id,
                        EventStatus::Processing,
                        StatusFields::new().expect_retry_count(0).with_retry_count(1),
                    )
                    .await
            }));
        }

        let mut stale = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(updated) => assert_eq!(updated.retry_count, 1),
                Err(StoreError::StaleRetryCount { expected: 0, actual: 1, .. }) => stale += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(stale, 1);
    }

    #[tokio::test]
    async fn remove_pending_only_deletes_unprocessed_events() {
        let store = InMemoryEventStore::new();
        let pending = store.create(new_event(Provider::Stripe, "evt_a")).await.unwrap();
        let started = store.create(new_event(Provider::Stripe, "evt_b")).await.unwrap();
        store
            .update_status(&started.id, EventStatus::Processing, StatusFields::new())
            .await
            .unwrap();

        assert!(store.remove_pending(&pending.id).await.unwrap());
        assert!(!store.remove_pending(&pending.id).await.unwrap());
        assert!(!store.remove_pending(&started.id).await.unwrap());
        assert_eq!(store.len().await, 1);

        // The external id is free to be admitted again.
        store.create(new_event(Provider::Stripe, "evt_a")).await.unwrap();
    }

    #[tokio::test]
    async fn update_status_unknown_id() {
        let store = InMemoryEventStore::new();
        let id = EventId::new();
        let err = store
            .update_status(&id, EventStatus::Processing, StatusFields::new())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
    }
}

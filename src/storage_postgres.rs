use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use crate::error::{QueueError, StoreError};
use crate::event_store::EventStore;
use crate::storage::QueueStorage;
use crate::types::{
    DeadLetterEntry, Event, EventId, EventStatus, Job, JobId, Provider, StatusFields,
};

const EVENT_COLUMNS: &str = "id, provider, event_id, event_type, payload, signature, status, \
     retry_count, max_retries, next_retry_at, processed_at, created_at";

/// Concurrent writers can race a status change; re-read and retry this often.
const UPDATE_ATTEMPTS: usize = 3;

/// Postgres-backed event store and queue persistence.
///
/// Uniqueness of (provider, event_id) is a table constraint and status
/// changes are conditional updates, so several processes may share it.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Wrap a connected client and create the tables if needed.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS webhook_events (
                    id UUID PRIMARY KEY,
                    provider TEXT NOT NULL,
                    event_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    signature TEXT,
                    status TEXT NOT NULL,
                    retry_count INT NOT NULL DEFAULT 0,
                    max_retries INT NOT NULL,
                    next_retry_at TIMESTAMPTZ,
                    processed_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (provider, event_id)
                );
                CREATE TABLE IF NOT EXISTS webhook_jobs (
                    id UUID PRIMARY KEY,
                    payload JSONB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS webhook_dead_letters (
                    id UUID PRIMARY KEY,
                    payload JSONB NOT NULL
                );",
            )
            .await?;

        Ok(Self { client })
    }

    async fn load(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        let query = format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&id.0])
            .await
            .map_err(store_backend)?;
        row.as_ref().map(row_to_event).transpose()
    }
}

fn store_backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn queue_backend(err: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn row_to_event(row: &Row) -> Result<Event, StoreError> {
    let get_err = |err: tokio_postgres::Error| StoreError::Backend(err.to_string());

    let provider: String = row.try_get("provider").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(get_err)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(get_err)?;

    Ok(Event {
        id: EventId(row.try_get::<_, Uuid>("id").map_err(get_err)?),
        provider: Provider::parse(&provider),
        event_id: row.try_get("event_id").map_err(get_err)?,
        event_type: row.try_get("event_type").map_err(get_err)?,
        payload: row.try_get("payload").map_err(get_err)?,
        signature: row.try_get("signature").map_err(get_err)?,
        status: status.parse().map_err(StoreError::Backend)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(1),
        next_retry_at: row.try_get::<_, Option<DateTime<Utc>>>("next_retry_at").map_err(get_err)?,
        processed_at: row.try_get::<_, Option<DateTime<Utc>>>("processed_at").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
    })
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn find_by_provider_and_event_id(
        &self,
        provider: &Provider,
        event_id: &str,
    ) -> Result<Option<Event>, StoreError> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE provider = $1 AND event_id = $2"
        );
        let row = self
            .client
            .query_opt(query.as_str(), &[&provider.as_str(), &event_id])
            .await
            .map_err(store_backend)?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn find_by_id(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        self.load(id).await
    }

    async fn create(&self, event: Event) -> Result<Event, StoreError> {
        let inserted = self
            .client
            .query_opt(
                "INSERT INTO webhook_events
                    (id, provider, event_id, event_type, payload, signature, status,
                     retry_count, max_retries, next_retry_at, processed_at, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (provider, event_id) DO NOTHING
                 RETURNING id",
                &[
                    &event.id.0,
                    &event.provider.as_str(),
                    &event.event_id,
                    &event.event_type,
                    &event.payload,
                    &event.signature,
                    &event.status.as_str(),
                    &to_i32(event.retry_count),
                    &to_i32(event.max_retries),
                    &event.next_retry_at,
                    &event.processed_at,
                    &event.created_at,
                ],
            )
            .await
            .map_err(store_backend)?;

        match inserted {
            Some(_) => Ok(event),
            None => Err(StoreError::DuplicateEvent {
                provider: event.provider,
                event_id: event.event_id,
            }),
        }
    }

    async fn update_status(
        &self,
        id: &EventId,
        status: EventStatus,
        fields: StatusFields,
    ) -> Result<Event, StoreError> {
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self.load(id).await?.ok_or(StoreError::NotFound(*id))?;
            let mut next = current.clone();
            next.transition(status, &fields)?;

            let updated = self
                .client
                .execute(
                    "UPDATE webhook_events
                     SET status = $2, retry_count = $3, next_retry_at = $4, processed_at = $5
                     WHERE id = $1 AND status = $6 AND retry_count = $7",
                    &[
                        &id.0,
                        &next.status.as_str(),
                        &to_i32(next.retry_count),
                        &next.next_retry_at,
                        &next.processed_at,
                        &current.status.as_str(),
                        &to_i32(fields.expected_retry_count.unwrap_or(current.retry_count)),
                    ],
                )
                .await
                .map_err(store_backend)?;

            if updated == 1 {
                return Ok(next);
            }
        }

        Err(StoreError::Backend(format!(
            "event {id} kept changing during status update"
        )))
    }

    async fn remove_pending(&self, id: &EventId) -> Result<bool, StoreError> {
        let deleted = self
            .client
            .execute(
                "DELETE FROM webhook_events WHERE id = $1 AND status = $2",
                &[&id.0, &EventStatus::Pending.as_str()],
            )
            .await
            .map_err(store_backend)?;
        Ok(deleted == 1)
    }
}

#[async_trait]
impl QueueStorage for PostgresStore {
    async fn save_job(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_value(job).map_err(queue_backend)?;
        self.client
            .execute(
                "INSERT INTO webhook_jobs (id, payload)
                 VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&job.id.0, &payload],
            )
            .await
            .map_err(queue_backend)?;
        Ok(())
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.client
            .execute("DELETE FROM webhook_jobs WHERE id = $1", &[&job_id.0])
            .await
            .map_err(queue_backend)?;
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let rows = self
            .client
            .query("SELECT payload FROM webhook_jobs", &[])
            .await
            .map_err(queue_backend)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<_, serde_json::Value>(0).ok())
            .filter_map(|v| serde_json::from_value::<Job>(v).ok())
            .collect())
    }

    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        let payload = serde_json::to_value(entry).map_err(queue_backend)?;
        self.client
            .execute(
                "INSERT INTO webhook_dead_letters (id, payload)
                 VALUES ($1, $2)
                 ON CONFLICT (id) DO NOTHING",
                &[&entry.job_id.0, &payload],
            )
            .await
            .map_err(queue_backend)?;
        Ok(())
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let rows = self
            .client
            .query("SELECT payload FROM webhook_dead_letters", &[])
            .await
            .map_err(queue_backend)?;

        let mut entries: Vec<DeadLetterEntry> = rows
            .into_iter()
            .filter_map(|row| row.try_get::<_, serde_json::Value>(0).ok())
            .filter_map(|v| serde_json::from_value::<DeadLetterEntry>(v).ok())
            .collect();
        entries.sort_by_key(|entry| entry.dead_lettered_at);
        Ok(entries)
    }
}

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::config::QueueConnection;
use crate::error::QueueError;
use crate::storage::QueueStorage;
use crate::types::{DeadLetterEntry, Job, JobId};

/// Queue persistence in Redis: a hash of active jobs and a dead-letter list.
pub struct RedisQueueStorage {
    client: redis::Client,
    prefix: String,
}

impl RedisQueueStorage {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn connect(connection: &QueueConnection, prefix: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(connection.redis_url()).map_err(backend)?;
        Ok(Self::new(client, prefix))
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead_letters", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, QueueError> {
        self.client.get_tokio_connection().await.map_err(backend)
    }
}

fn backend(err: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(err.to_string())
}

#[async_trait]
impl QueueStorage for RedisQueueStorage {
    async fn save_job(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job).map_err(backend)?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(self.jobs_key(), job.id.to_string(), payload)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hdel(self.jobs_key(), job_id.to_string())
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn.hvals(self.jobs_key()).await.map_err(backend)?;
        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_str::<Job>(&v).ok())
            .collect())
    }

    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        let payload = serde_json::to_string(entry).map_err(backend)?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .rpush(self.dead_letter_key(), payload)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn
            .lrange(self.dead_letter_key(), 0, -1)
            .await
            .map_err(backend)?;
        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_str::<DeadLetterEntry>(&v).ok())
            .collect())
    }
}

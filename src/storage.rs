use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::types::{DeadLetterEntry, Job, JobId};

/// Durable backing for the job queue.
///
/// Everything the queue holds in memory can be rebuilt from here after a
/// restart: active jobs (leased or waiting) and dead-letter entries.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Insert or replace a job.
    async fn save_job(&self, job: &Job) -> Result<(), QueueError>;
    async fn remove_job(&self, job_id: &JobId) -> Result<(), QueueError>;
    async fn load_jobs(&self) -> Result<Vec<Job>, QueueError>;
    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), QueueError>;
    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, QueueError>;
}

/// In-memory queue storage for lightweight deployments.
///
/// Shared through an `Arc`, it outlives a [`JobQueue`](crate::JobQueue),
/// which is enough to exercise restart recovery in tests.
#[derive(Default)]
pub struct InMemoryQueueStorage {
    jobs: Mutex<HashMap<JobId, Job>>,
    dead_letters: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn save_job(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs: Vec<Job> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.ready_at);
        Ok(jobs)
    }

    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        self.dead_letters.lock().await.push(entry.clone());
        Ok(())
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.dead_letters.lock().await.clone())
    }
}

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep_until, Instant};

use crate::error::QueueError;
use crate::storage::{InMemoryQueueStorage, QueueStorage};
use crate::telemetry::metric_inc;
use crate::types::{duration_millis, utc_after, DeadLetterEntry, EventId, Job, JobHandle, JobId, JobOptions};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a lease lasts before the job is redelivered.
    pub lease_timeout: Duration,

    /// Upper bound on how long [`JobQueue::next`] sleeps between checks.
    pub poll_interval: Duration,

    /// Completed job ids kept for inspection.
    pub completed_retention: usize,

    /// Dead-letter entries kept in memory.
    pub dlq_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            completed_retention: 10,
            dlq_capacity: 10_000,
        }
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Job goes back to the queue and becomes ready after `delay`.
    Rescheduled { attempt: u32, delay: Duration },

    /// Attempt budget used up. The job is not redelivered and the lease
    /// stays held so the caller can [`JobQueue::move_to_dead_letter`].
    Exhausted { attempt: u32 },
}

/// Exclusive, time-bounded claim on a job.
#[derive(Debug, Clone)]
pub struct Lease {
    job: Job,
    token: u64,
    expires_at: Instant,
}

impl Lease {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn event_id(&self) -> EventId {
        self.job.event_id
    }

    /// Failed attempts before this delivery.
    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub ready: usize,
    pub delayed: usize,
    pub leased: usize,
    pub completed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug)]
struct Scheduled {
    ready_at: Instant,
    seq: u64,
    job_id: JobId,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at) && self.seq == other.seq
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior, FIFO among equal ready times
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Leased {
    job: Job,
    token: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Scheduled>,
    waiting: HashMap<JobId, Job>,
    leased: HashMap<JobId, Leased>,
    completed: VecDeque<JobId>,
    dead_letters: VecDeque<DeadLetterEntry>,
    next_seq: u64,
    next_token: u64,
}

impl QueueState {
    fn schedule(&mut self, job: Job, ready_at: Instant) {
        self.next_seq += 1;
        self.heap.push(Scheduled {
            ready_at,
            seq: self.next_seq,
            job_id: job.id,
        });
        self.waiting.insert(job.id, job);
    }

    /// Put jobs whose lease ran out back in line, ready immediately.
    fn reclaim_expired(&mut self, now: Instant) -> Vec<Job> {
        let expired: Vec<JobId> = self
            .leased
            .iter()
            .filter(|(_, leased)| leased.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(leased) = self.leased.remove(&id) {
                reclaimed.push(leased.job.clone());
                self.schedule(leased.job, now);
            }
        }
        reclaimed
    }

    fn pop_ready(&mut self, now: Instant) -> Option<Job> {
        while let Some(top) = self.heap.peek() {
            if top.ready_at > now {
                return None;
            }
            let Some(top) = self.heap.pop() else { break };
            if let Some(job) = self.waiting.remove(&top.job_id) {
                return Some(job);
            }
        }
        None
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let next_ready = self.heap.peek().map(|s| s.ready_at);
        let next_expiry = self.leased.values().map(|l| l.expires_at).min();
        match (next_ready, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_held(&self, lease: &Lease) -> bool {
        self.leased
            .get(&lease.job.id)
            .is_some_and(|held| held.token == lease.token)
    }

    fn take_lease(&mut self, lease: &Lease) -> Result<Leased, QueueError> {
        if !self.is_held(lease) {
            return Err(QueueError::LeaseExpired(lease.job.id));
        }
        self.leased
            .remove(&lease.job.id)
            .ok_or(QueueError::LeaseExpired(lease.job.id))
    }
}

/// Durable, at-least-once job queue with leases, exponential backoff
/// and a dead-letter queue.
///
/// Jobs are written to [`QueueStorage`] before [`enqueue`](Self::enqueue)
/// returns. Ready jobs are ordered by ready time. A leased job is invisible
/// to other workers until it is acknowledged, failed, dead-lettered,
/// discarded, or its lease expires.
pub struct JobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    storage: Arc<dyn QueueStorage>,
    notify: Notify,
    closed: AtomicBool,
    dead_letter_tx: mpsc::Sender<DeadLetterEntry>,
    dead_letter_rx: std::sync::Mutex<Option<mpsc::Receiver<DeadLetterEntry>>>,
}

impl JobQueue {
    pub fn new(config: QueueConfig, storage: Arc<dyn QueueStorage>) -> Self {
        let (dead_letter_tx, dead_letter_rx) = mpsc::channel(config.dlq_capacity.max(1));
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            storage,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dead_letter_tx,
            dead_letter_rx: std::sync::Mutex::new(Some(dead_letter_rx)),
        }
    }

    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(config, Arc::new(InMemoryQueueStorage::new()))
    }

    /// Create a queue and reload whatever `storage` still holds.
    pub async fn with_storage(
        config: QueueConfig,
        storage: Arc<dyn QueueStorage>,
    ) -> Result<Self, QueueError> {
        let queue = Self::new(config, storage);
        queue.restore().await?;
        Ok(queue)
    }

    /// Reload persisted jobs and dead-letter entries.
    ///
    /// Jobs that were leased when the previous process stopped are
    /// redelivered. Returns the number of jobs restored.
    pub async fn restore(&self) -> Result<usize, QueueError> {
        let jobs = self.storage.load_jobs().await?;
        let entries = self.storage.load_dead_letters().await?;

        let now = Instant::now();
        let now_utc = Utc::now();
        let mut restored = 0usize;
        {
            let mut state = self.state.lock().await;
            for job in jobs {
                if state.waiting.contains_key(&job.id) || state.leased.contains_key(&job.id) {
                    continue;
                }
                let delay = (job.ready_at - now_utc).to_std().unwrap_or(Duration::ZERO);
                state.schedule(job, instant_after(now, delay));
                restored += 1;
            }

            for entry in entries {
                if state.dead_letters.iter().any(|e| e.job_id == entry.job_id) {
                    continue;
                }
                state.dead_letters.push_back(entry);
            }
            while state.dead_letters.len() > self.config.dlq_capacity {
                state.dead_letters.pop_front();
            }
        }

        if restored > 0 {
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
        tracing::info!(restored, "restored jobs from queue storage");
        Ok(restored)
    }

    /// Add a job for `event_id`. Durable once this returns `Ok`.
    pub async fn enqueue(
        &self,
        event_id: EventId,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            event_id,
            attempt: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
            enqueued_at: now,
            ready_at: now,
        };
        self.storage.save_job(&job).await?;

        let handle = JobHandle {
            job_id: job.id,
            event_id,
        };
        self.state.lock().await.schedule(job, Instant::now());
        self.notify.notify_one();

        metric_inc("webhook.job.enqueued");
        tracing::debug!(job_id = %handle.job_id, event_id = %event_id, "job enqueued");
        Ok(handle)
    }

    /// Lease the earliest ready job, if any, without waiting.
    pub async fn try_lease(&self) -> Option<Lease> {
        if self.is_closed() {
            return None;
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;

        for job in state.reclaim_expired(now) {
            metric_inc("webhook.job.lease_expired");
            tracing::warn!(
                job_id = %job.id,
                event_id = %job.event_id,
                "lease expired; job will be redelivered"
            );
        }

        let job = state.pop_ready(now)?;
        state.next_token += 1;
        let token = state.next_token;
        let expires_at = instant_after(now, self.config.lease_timeout);
        state.leased.insert(
            job.id,
            Leased {
                job: job.clone(),
                token,
                expires_at,
            },
        );

        Some(Lease {
            job,
            token,
            expires_at,
        })
    }

    /// Wait for the next job. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Lease> {
        loop {
            if self.is_closed() {
                return None;
            }

            if let Some(lease) = self.try_lease().await {
                return Some(lease);
            }

            let poll_deadline = instant_after(Instant::now(), self.config.poll_interval);
            let wake_at = match self.state.lock().await.next_wakeup() {
                Some(at) => at.min(poll_deadline),
                None => poll_deadline,
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    /// Mark a leased job done and drop it from the active queue.
    ///
    /// If storage cannot forget the job it goes back in line.
    pub async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let held = self.state.lock().await.take_lease(lease)?;
        if let Err(err) = self.storage.remove_job(&lease.job.id).await {
            self.put_back(held.job).await;
            return Err(err);
        }

        {
            let mut state = self.state.lock().await;
            state.completed.push_back(lease.job.id);
            while state.completed.len() > self.config.completed_retention {
                state.completed.pop_front();
            }
        }

        metric_inc("webhook.job.completed");
        tracing::info!(job_id = %lease.job.id, event_id = %lease.job.event_id, "job completed");
        Ok(())
    }

    /// Report a failed attempt.
    ///
    /// The job is rescheduled after `retry_after`, or after the job's own
    /// backoff (`base * 2^attempt`) when `None`. Once the attempt count
    /// reaches the job's maximum the queue answers
    /// [`FailureDisposition::Exhausted`] instead of rescheduling.
    pub async fn fail(
        &self,
        lease: &Lease,
        retry_after: Option<Duration>,
    ) -> Result<FailureDisposition, QueueError> {
        let mut state = self.state.lock().await;
        let (attempt, max_attempts, backoff) = match state.leased.get(&lease.job.id) {
            Some(held) if held.token == lease.token => {
                (held.job.attempt + 1, held.job.max_attempts, held.job.backoff)
            }
            _ => return Err(QueueError::LeaseExpired(lease.job.id)),
        };

        if attempt >= max_attempts {
            if let Some(held) = state.leased.get_mut(&lease.job.id) {
                held.job.attempt = attempt;
            }
            drop(state);
            tracing::warn!(
                job_id = %lease.job.id,
                event_id = %lease.job.event_id,
                attempt,
                "job failed with no attempts left"
            );
            return Ok(FailureDisposition::Exhausted { attempt });
        }

        let mut job = state.take_lease(lease)?.job;
        let delay = retry_after.unwrap_or_else(|| backoff.delay_for(attempt));
        job.attempt = attempt;
        job.ready_at = utc_after(delay);
        state.schedule(job.clone(), instant_after(Instant::now(), delay));
        drop(state);

        self.storage.save_job(&job).await?;
        self.notify.notify_one();

        metric_inc("webhook.job.retry_scheduled");
        tracing::warn!(
            job_id = %job.id,
            event_id = %job.event_id,
            attempt,
            delay_ms = duration_millis(delay),
            "job failed; retry scheduled"
        );
        Ok(FailureDisposition::Rescheduled { attempt, delay })
    }

    /// Remove a leased job from the active queue and record an immutable
    /// copy in the dead-letter queue. Counts as one more failed attempt.
    ///
    /// At most one entry is kept per event: a later job for an event that
    /// is already dead-lettered is dropped and the existing entry returned.
    pub async fn move_to_dead_letter(
        &self,
        lease: &Lease,
        reason: impl Into<String>,
    ) -> Result<DeadLetterEntry, QueueError> {
        let (held, existing) = {
            let mut state = self.state.lock().await;
            let held = state.take_lease(lease)?;
            let existing = state
                .dead_letters
                .iter()
                .find(|entry| entry.event_id == held.job.event_id)
                .cloned();
            (held, existing)
        };

        let entry = match existing {
            Some(entry) => {
                tracing::info!(
                    job_id = %held.job.id,
                    event_id = %entry.event_id,
                    "event already dead-lettered; dropping job"
                );
                entry
            }
            None => {
                let entry = DeadLetterEntry {
                    job_id: held.job.id,
                    event_id: held.job.event_id,
                    attempts: lease.job.attempt + 1,
                    reason: reason.into(),
                    dead_lettered_at: Utc::now(),
                };
                if let Err(err) = self.storage.record_dead_letter(&entry).await {
                    self.put_back(held.job).await;
                    return Err(err);
                }
                self.push_dead_letter(entry).await
            }
        };

        if let Err(err) = self.storage.remove_job(&held.job.id).await {
            // The entry is recorded; the redelivered job only needs removing.
            self.put_back(held.job).await;
            return Err(err);
        }
        Ok(entry)
    }

    /// Keep `entry` unless a concurrent settle already recorded its event.
    async fn push_dead_letter(&self, entry: DeadLetterEntry) -> DeadLetterEntry {
        {
            let mut state = self.state.lock().await;
            if let Some(existing) = state
                .dead_letters
                .iter()
                .find(|kept| kept.event_id == entry.event_id)
            {
                return existing.clone();
            }
            state.dead_letters.push_back(entry.clone());
            while state.dead_letters.len() > self.config.dlq_capacity {
                state.dead_letters.pop_front();
            }
        }

        metric_inc("webhook.job.dead_lettered");
        tracing::error!(
            job_id = %entry.job_id,
            event_id = %entry.event_id,
            attempts = entry.attempts,
            reason = %entry.reason,
            "job moved to dead-letter queue"
        );
        if self.dead_letter_tx.try_send(entry.clone()).is_err() {
            tracing::warn!(job_id = %entry.job_id, "dead-letter alert channel full; alert dropped");
        }
        entry
    }

    /// Drop a leased job without retry.
    pub async fn discard(&self, lease: &Lease, reason: &str) -> Result<(), QueueError> {
        let held = self.state.lock().await.take_lease(lease)?;
        if let Err(err) = self.storage.remove_job(&lease.job.id).await {
            self.put_back(held.job).await;
            return Err(err);
        }

        metric_inc("webhook.job.discarded");
        tracing::error!(
            job_id = %lease.job.id,
            event_id = %lease.job.event_id,
            reason,
            "job discarded"
        );
        Ok(())
    }

    /// Requeue a job whose settlement could not be persisted.
    async fn put_back(&self, job: Job) {
        metric_inc("webhook.job.settle_failed");
        tracing::warn!(
            job_id = %job.id,
            event_id = %job.event_id,
            "queue storage failed while settling job; redelivering"
        );
        self.state.lock().await.schedule(job, Instant::now());
        self.notify.notify_one();
    }

    /// Whether `lease` is still the current claim on its job.
    pub async fn holds(&self, lease: &Lease) -> bool {
        self.state.lock().await.is_held(lease)
    }

    pub async fn counts(&self) -> QueueCounts {
        let now = Instant::now();
        let state = self.state.lock().await;
        let ready = state
            .heap
            .iter()
            .filter(|s| s.ready_at <= now && state.waiting.contains_key(&s.job_id))
            .count();

        QueueCounts {
            ready,
            delayed: state.waiting.len().saturating_sub(ready),
            leased: state.leased.len(),
            completed: state.completed.len(),
            dead_lettered: state.dead_letters.len(),
        }
    }

    /// Most recently completed job ids, oldest first.
    pub async fn recent_completed(&self) -> Vec<JobId> {
        self.state.lock().await.completed.iter().copied().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().await.dead_letters.iter().cloned().collect()
    }

    /// Receiver for dead-letter alerts. Can be taken once.
    pub fn take_dead_letter_receiver(&self) -> Option<mpsc::Receiver<DeadLetterEntry>> {
        self.dead_letter_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Stop handing out jobs. Leased jobs can still be settled.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Consume dead-letter alerts. Logging only; dead-lettering is terminal.
pub async fn dead_letter_loop(mut rx: mpsc::Receiver<DeadLetterEntry>) {
    while let Some(entry) = rx.recv().await {
        tracing::error!(
            job_id = %entry.job_id,
            event_id = %entry.event_id,
            attempts = entry.attempts,
            reason = %entry.reason,
            "dead letter job"
        );
    }
}

fn instant_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

use std::sync::Arc;

use chrono::Utc;

use crate::error::{DropReason, HandlerError, ProcessOutcome, StoreError};
use crate::event_store::EventStore;
use crate::handler::HandlerRegistry;
use crate::queue::{FailureDisposition, JobQueue, Lease};
use crate::telemetry::metric_inc;
use crate::types::{utc_after, Backoff, Event, EventStatus, StatusFields};

/// Shared, read-only context for all workers.
pub struct Worker {
    store: Arc<dyn EventStore>,
    queue: Arc<JobQueue>,
    handlers: Arc<HandlerRegistry>,

    /// Delay before retry `n` is `backoff.delay_for(n)`.
    backoff: Backoff,
}

impl Worker {
    pub fn new(
        store: Arc<dyn EventStore>,
        queue: Arc<JobQueue>,
        handlers: Arc<HandlerRegistry>,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            queue,
            handlers,
            backoff,
        }
    }

    /// Run one delivery of a leased job through the state machine.
    ///
    /// Never sleeps for backoff: on failure the job is handed back to the
    /// queue with a delay and this returns immediately.
    pub async fn process(&self, lease: &Lease) -> ProcessOutcome {
        let event_id = lease.event_id();

        let event = match self.store.find_by_id(&event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                let reason = DropReason::EventMissing(event_id);
                if let Err(err) = self.queue.discard(lease, &reason.to_string()).await {
                    tracing::warn!(job_id = %lease.job_id(), error = %err, "failed to discard job");
                }
                return ProcessOutcome::Dropped(reason);
            }
            Err(err) => return abandon(lease, "load event", err.to_string()),
        };

        if event.status.is_terminal() {
            tracing::info!(
                event_id = %event.id,
                status = %event.status,
                "event already settled; settling redelivered job"
            );
            return self.settle_terminal(lease, event.status).await;
        }

        let event = match self
            .store
            .update_status(&event.id, EventStatus::Processing, StatusFields::new())
            .await
        {
            Ok(event) => event,
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                return self.settle_terminal(lease, from).await;
            }
            Err(err) => return abandon(lease, "mark processing", err.to_string()),
        };

        tracing::info!(
            event_id = %event.id,
            provider = %event.provider,
            event_type = %event.event_type,
            attempt = event.retry_count + 1,
            "processing webhook event"
        );

        match self.handlers.dispatch(&event.event_type, &event.payload).await {
            Ok(()) => self.complete(lease, &event).await,
            Err(err) => self.handle_failure(lease, &event, err).await,
        }
    }

    async fn complete(&self, lease: &Lease, event: &Event) -> ProcessOutcome {
        let fields = StatusFields::new()
            .with_processed_at(Utc::now())
            .with_next_retry_at(None);

        match self
            .store
            .update_status(&event.id, EventStatus::Completed, fields)
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                return self.settle_terminal(lease, from).await;
            }
            Err(err) => return abandon(lease, "mark completed", err.to_string()),
        }

        metric_inc("webhook.event.completed");
        tracing::info!(event_id = %event.id, "event processed successfully");
        self.settle_ack(lease).await;
        ProcessOutcome::Completed
    }

    async fn handle_failure(&self, lease: &Lease, event: &Event, err: HandlerError) -> ProcessOutcome {
        let retry_count = event.retry_count + 1;
        tracing::error!(
            event_id = %event.id,
            retry_count,
            max_retries = event.max_retries,
            error = %err,
            "error processing event"
        );

        if retry_count >= event.max_retries {
            return self
                .dead_letter(lease, event, event.retry_count, retry_count, &err.message)
                .await;
        }

        let delay = self.backoff.delay_for(retry_count);
        let fields = StatusFields::new()
            .expect_retry_count(event.retry_count)
            .with_retry_count(retry_count)
            .with_next_retry_at(Some(utc_after(delay)));

        match self
            .store
            .update_status(&event.id, EventStatus::Processing, fields)
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                return self.settle_terminal(lease, from).await;
            }
            // StaleRetryCount lands here: another delivery's count stands.
            Err(store_err) => return abandon(lease, "schedule retry", store_err.to_string()),
        }

        match self.queue.fail(lease, Some(delay)).await {
            Ok(FailureDisposition::Rescheduled { .. }) => {
                metric_inc("webhook.event.retry_scheduled");
                ProcessOutcome::RetryScheduled { retry_count, delay }
            }
            // The job's own attempt budget ran out first.
            Ok(FailureDisposition::Exhausted { .. }) => {
                self.dead_letter(lease, event, retry_count, retry_count, &err.message)
                    .await
            }
            Err(queue_err) => abandon(lease, "reschedule job", queue_err.to_string()),
        }
    }

    /// Mark the event `DEAD_LETTER` if its failure count is still
    /// `expected`, then record the job in the dead-letter queue.
    async fn dead_letter(
        &self,
        lease: &Lease,
        event: &Event,
        expected: u32,
        retry_count: u32,
        reason: &str,
    ) -> ProcessOutcome {
        let fields = StatusFields::new()
            .expect_retry_count(expected)
            .with_retry_count(retry_count)
            .with_next_retry_at(None);

        match self
            .store
            .update_status(&event.id, EventStatus::DeadLetter, fields)
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                return self.settle_terminal(lease, from).await;
            }
            Err(err) => return abandon(lease, "mark dead letter", err.to_string()),
        }

        if let Err(err) = self.queue.move_to_dead_letter(lease, reason).await {
            // A redelivery of this job finds the event DEAD_LETTER and
            // records the entry then.
            tracing::warn!(job_id = %lease.job_id(), error = %err, "failed to move job to dead-letter queue");
        }

        metric_inc("webhook.event.dead_lettered");
        tracing::error!(event_id = %event.id, retry_count, "event moved to dead letter queue");
        ProcessOutcome::DeadLettered { retry_count }
    }

    /// Settle a job whose event already reached `status`. A dead-lettered
    /// event keeps exactly one dead-letter entry however often it is seen.
    async fn settle_terminal(&self, lease: &Lease, status: EventStatus) -> ProcessOutcome {
        match status {
            EventStatus::DeadLetter => {
                if let Err(err) = self
                    .queue
                    .move_to_dead_letter(lease, "event already dead-lettered")
                    .await
                {
                    tracing::warn!(job_id = %lease.job_id(), error = %err, "failed to settle dead-lettered job");
                }
            }
            _ => self.settle_ack(lease).await,
        }
        ProcessOutcome::Skipped(status)
    }

    async fn settle_ack(&self, lease: &Lease) {
        if let Err(err) = self.queue.ack(lease).await {
            tracing::warn!(job_id = %lease.job_id(), error = %err, "failed to acknowledge job");
        }
    }
}

fn abandon(lease: &Lease, step: &str, error: String) -> ProcessOutcome {
    tracing::error!(
        job_id = %lease.job_id(),
        event_id = %lease.event_id(),
        step,
        error = %error,
        "processing step failed; leaving job for redelivery"
    );
    ProcessOutcome::Abandoned(error)
}

/// Main worker loop.
///
/// Each worker:
/// - Leases jobs from the shared queue
/// - Runs them through [`Worker::process`]
/// - Exits once the queue is closed
pub async fn worker_loop(worker: Arc<Worker>) {
    while let Some(lease) = worker.queue.next().await {
        let outcome = worker.process(&lease).await;
        tracing::debug!(job_id = %lease.job_id(), ?outcome, "job delivery finished");
    }
}

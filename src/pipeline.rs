use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::IntakeConfig;
use crate::error::{AdmitError, StoreError};
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::handler::HandlerRegistry;
use crate::intake::{IntakeHandler, WebhookRequest};
use crate::queue::{dead_letter_loop, JobQueue};
use crate::types::{AdmitOutcome, DeadLetterEntry, Event, EventId};
use crate::worker::{worker_loop, Worker};

/// Running intake pipeline: admission, worker pool and dead-letter consumer.
///
/// Must be created inside a tokio runtime.
pub struct Pipeline {
    intake: IntakeHandler,
    store: Arc<dyn EventStore>,
    queue: Arc<JobQueue>,
    is_running: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    dead_letter_handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(
        config: IntakeConfig,
        store: Arc<dyn EventStore>,
        queue: Arc<JobQueue>,
        handlers: HandlerRegistry,
    ) -> Self {
        let intake = IntakeHandler::new(&config, store.clone(), queue.clone());
        let worker = Arc::new(Worker::new(
            store.clone(),
            queue.clone(),
            Arc::new(handlers),
            config.backoff(),
        ));

        let worker_count = config.worker_count.max(1);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            worker_handles.push(tokio::spawn(worker_loop(worker.clone())));
        }

        let dead_letter_handle = queue
            .take_dead_letter_receiver()
            .map(|rx| tokio::spawn(dead_letter_loop(rx)));

        tracing::info!(workers = worker_count, ?config, "webhook pipeline started");

        Self {
            intake,
            store,
            queue,
            is_running: Arc::new(AtomicBool::new(true)),
            worker_handles,
            dead_letter_handle,
        }
    }

    /// Pipeline backed by the in-memory store and queue.
    pub fn in_memory(config: IntakeConfig, handlers: HandlerRegistry) -> Self {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(JobQueue::in_memory(config.queue_config()));
        Self::new(config, store, queue, handlers)
    }

    pub fn intake(&self) -> &IntakeHandler {
        &self.intake
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub async fn admit(&self, request: WebhookRequest) -> Result<AdmitOutcome, AdmitError> {
        self.intake.admit(request).await
    }

    pub async fn receive<'a, I>(
        &self,
        provider_segment: &str,
        headers: I,
        body: &[u8],
    ) -> Result<AdmitOutcome, AdmitError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.intake.receive(provider_segment, headers, body).await
    }

    pub async fn event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        self.store.find_by_id(id).await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.queue.dead_letters().await
    }

    #[cfg(feature = "http")]
    pub fn router(&self) -> axum::Router {
        crate::http::router(self.intake.clone(), self.store.clone())
    }

    /// Stop leasing, let workers finish their current job, then stop.
    pub async fn shutdown(&mut self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.close();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }

        // The alert channel stays open while the queue lives.
        if let Some(handle) = self.dead_letter_handle.take() {
            handle.abort();
            let _ = handle.await;
        }

        tracing::info!("webhook pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.queue.close();
        for handle in &self.worker_handles {
            handle.abort();
        }
        if let Some(handle) = &self.dead_letter_handle {
            handle.abort();
        }
    }
}

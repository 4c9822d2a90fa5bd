use std::fmt;
use std::time::Duration;

use crate::types::{EventId, EventStatus, JobId, Provider};

/// Reasons a webhook request fails authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// No signature header was supplied.
    MissingSignature,

    /// No secret is configured for the provider.
    UnknownProvider(Provider),

    /// Signature does not match the payload.
    InvalidSignature,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::MissingSignature =>
                write!(f, "missing signature"),
            SignatureError::UnknownProvider(provider) =>
                write!(f, "unsupported provider: {provider}"),
            SignatureError::InvalidSignature =>
                write!(f, "invalid signature"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Errors returned by an [`EventStore`](crate::EventStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The (provider, event id) pair already exists.
    DuplicateEvent {
        provider: Provider,
        event_id: String,
    },

    NotFound(EventId),

    /// The requested status is not reachable from the current one.
    InvalidTransition {
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    },

    /// Another writer changed `retry_count` since the caller loaded it.
    StaleRetryCount {
        id: EventId,
        expected: u32,
        actual: u32,
    },

    /// Underlying storage failed.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DuplicateEvent { provider, event_id } =>
                write!(f, "event {event_id} from {provider} already exists"),
            StoreError::NotFound(id) =>
                write!(f, "event not found: {id}"),
            StoreError::InvalidTransition { id, from, to } =>
                write!(f, "event {id} cannot move from {from} to {to}"),
            StoreError::StaleRetryCount { id, expected, actual } =>
                write!(f, "event {id} retry count is {actual}, expected {expected}"),
            StoreError::Backend(message) =>
                write!(f, "event store error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors returned by the [`JobQueue`](crate::JobQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Queue has been closed.
    Closed,

    /// The lease ran out and the job was handed to another worker,
    /// or the job already left the active queue.
    LeaseExpired(JobId),

    /// Queue persistence failed.
    Backend(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed =>
                write!(f, "queue is closed"),
            QueueError::LeaseExpired(job_id) =>
                write!(f, "lease on job {job_id} is no longer held"),
            QueueError::Backend(message) =>
                write!(f, "queue storage error: {message}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Failure reported by a business handler. Always treated as retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Errors returned synchronously to the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    Signature(SignatureError),

    /// Payload carries none of `id`, `event_id` or `idempotency_key`.
    MissingEventId,

    Store(StoreError),
    Queue(QueueError),
}

impl AdmitError {
    /// Whether the sender is at fault (4xx) rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, AdmitError::Signature(_) | AdmitError::MissingEventId)
    }
}

impl fmt::Display for AdmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmitError::Signature(err) => err.fmt(f),
            AdmitError::MissingEventId =>
                write!(f, "payload has no event id"),
            AdmitError::Store(err) => err.fmt(f),
            AdmitError::Queue(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for AdmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdmitError::Signature(err) => Some(err),
            AdmitError::Store(err) => Some(err),
            AdmitError::Queue(err) => Some(err),
            AdmitError::MissingEventId => None,
        }
    }
}

impl From<SignatureError> for AdmitError {
    fn from(err: SignatureError) -> Self {
        AdmitError::Signature(err)
    }
}

impl From<StoreError> for AdmitError {
    fn from(err: StoreError) -> Self {
        AdmitError::Store(err)
    }
}

impl From<QueueError> for AdmitError {
    fn from(err: QueueError) -> Self {
        AdmitError::Queue(err)
    }
}

/// What a worker did with one job delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,

    /// Handler failed; the queue redelivers after `delay`.
    RetryScheduled {
        retry_count: u32,
        delay: Duration,
    },

    /// Retry budget exhausted; moved to the dead-letter queue.
    DeadLettered {
        retry_count: u32,
    },

    /// Event was already terminal; the job was acknowledged untouched.
    Skipped(EventStatus),

    /// Job was removed without processing.
    Dropped(DropReason),

    /// A store or queue call failed; the lease is left to expire
    /// so the job is redelivered.
    Abandoned(String),
}

/// Reasons a job is dropped without retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The job references an event that does not exist.
    EventMissing(EventId),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::EventMissing(id) =>
                write!(f, "event {id} referenced by job does not exist"),
        }
    }
}

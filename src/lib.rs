//! Reliable intake for third-party webhooks.
//!
//! Inbound callbacks are authenticated with a per-provider HMAC secret,
//! admitted at most once per (provider, event id), and processed by a
//! worker pool through an at-least-once job queue with exponential
//! backoff and a dead-letter queue.
//!
//! ## Guarantees
//! - Exactly-once admission per (provider, event id)
//! - At-least-once delivery to business handlers
//! - At most `max_retries` failed attempts per event
//! - Monotonic status transitions
//!
//! ## Non-Guarantees
//! - Exactly-once execution of business handlers
//! - Ordering across events or providers
//! - Sharding the queue across processes
//!
//! The in-memory store and queue persistence are always available.
//! Postgres and Redis backends sit behind the `postgres` and `redis`
//! features, the axum adapter behind `http`.

mod config;
mod error;
mod event_store;
mod handler;
mod intake;
mod pipeline;
mod queue;
mod signing;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use config::{IntakeConfig, QueueConnection};
pub use error::{
    AdmitError,
    DropReason,
    HandlerError,
    ProcessOutcome,
    QueueError,
    SignatureError,
    StoreError,
};
pub use event_store::{EventStore, InMemoryEventStore};
pub use handler::{
    EventHandler,
    FnHandler,
    GenericHandler,
    HandlerRegistry,
    OrderCreatedHandler,
    PaymentSucceededHandler,
    UserCreatedHandler,
};
pub use intake::{parse_payload, IntakeHandler, WebhookRequest};
pub use pipeline::Pipeline;
pub use queue::{dead_letter_loop, FailureDisposition, JobQueue, Lease, QueueConfig, QueueCounts};
pub use signing::{compute_signature, parse_signature_header, verify_signature, SignatureVerifier};
pub use storage::{InMemoryQueueStorage, QueueStorage};
pub use types::{
    AdmitOutcome,
    Backoff,
    DeadLetterEntry,
    Event,
    EventId,
    EventStatus,
    Job,
    JobHandle,
    JobId,
    JobOptions,
    NewEvent,
    Provider,
    StatusFields,
};
pub use worker::{worker_loop, Worker};

#[cfg(feature = "http")]
pub use http::router;

#[cfg(feature = "redis")]
pub use storage_redis::RedisQueueStorage;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;

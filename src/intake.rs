//! Webhook admission: verify, deduplicate, persist, enqueue.

use std::sync::Arc;

use serde_json::Value;

use crate::config::IntakeConfig;
use crate::error::{AdmitError, StoreError};
use crate::event_store::EventStore;
use crate::queue::JobQueue;
use crate::signing::{parse_signature_header, SignatureVerifier};
use crate::telemetry::{metric_inc, metric_inc_provider};
use crate::types::{AdmitOutcome, Backoff, Event, JobOptions, NewEvent, Provider};

const EVENT_ID_FIELDS: [&str; 3] = ["id", "event_id", "idempotency_key"];
const EVENT_TYPE_FIELDS: [&str; 2] = ["type", "event_type"];

/// One inbound webhook, reduced to what admission needs.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub provider: Provider,
    pub event_id: String,
    pub event_type: String,

    /// Raw body bytes; the signature is checked against these.
    pub payload: Vec<u8>,

    pub signature: Option<String>,
}

impl WebhookRequest {
    /// Derive a request from a raw HTTP exchange.
    ///
    /// The provider comes from the path segment, the signature from the
    /// provider's header, and the ids from the JSON body.
    pub fn parse<'a, I>(provider_segment: &str, headers: I, body: &[u8]) -> Result<Self, AdmitError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let provider = Provider::parse(provider_segment);
        let signature = parse_signature_header(headers, provider.signature_header());
        let document = parse_payload(body);

        let event_id = first_string(&document, &EVENT_ID_FIELDS).ok_or(AdmitError::MissingEventId)?;
        let event_type =
            first_string(&document, &EVENT_TYPE_FIELDS).unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            provider,
            event_id,
            event_type,
            payload: body.to_vec(),
            signature,
        })
    }
}

/// Body as JSON, or the lossy text of the body as a JSON string.
pub fn parse_payload(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn first_string(document: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match document.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Turns verified webhooks into admitted events and queued jobs.
///
/// Admission never runs business logic. A (provider, event id) pair is
/// admitted at most once; repeats answer [`AdmitOutcome::AlreadyProcessed`].
#[derive(Clone)]
pub struct IntakeHandler {
    verifier: SignatureVerifier,
    store: Arc<dyn EventStore>,
    queue: Arc<JobQueue>,
    max_retries: u32,
    backoff: Backoff,
}

impl IntakeHandler {
    pub fn new(config: &IntakeConfig, store: Arc<dyn EventStore>, queue: Arc<JobQueue>) -> Self {
        Self {
            verifier: SignatureVerifier::from_config(config),
            store,
            queue,
            max_retries: config.max_retries.max(1),
            backoff: config.backoff(),
        }
    }

    /// Authenticate a raw request, then admit it.
    ///
    /// The signature is checked before the body is inspected, so an
    /// unauthenticated sender never learns whether its payload parsed.
    pub async fn receive<'a, I>(
        &self,
        provider_segment: &str,
        headers: I,
        body: &[u8],
    ) -> Result<AdmitOutcome, AdmitError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let headers: Vec<(&str, &str)> = headers.into_iter().collect();
        let provider = Provider::parse(provider_segment);
        let signature = parse_signature_header(headers.iter().copied(), provider.signature_header());
        self.verify(&provider, body, signature.as_deref())?;

        let request = WebhookRequest::parse(provider_segment, headers, body)?;
        self.admit_verified(request).await
    }

    /// Verify and admit one webhook.
    pub async fn admit(&self, request: WebhookRequest) -> Result<AdmitOutcome, AdmitError> {
        self.verify(&request.provider, &request.payload, request.signature.as_deref())?;
        self.admit_verified(request).await
    }

    fn verify(&self, provider: &Provider, body: &[u8], signature: Option<&str>) -> Result<(), AdmitError> {
        self.verifier.verify(provider, body, signature).map_err(|err| {
            metric_inc_provider("webhook.intake.rejected", provider);
            tracing::warn!(provider = %provider, error = %err, "webhook rejected");
            AdmitError::from(err)
        })
    }

    async fn admit_verified(&self, request: WebhookRequest) -> Result<AdmitOutcome, AdmitError> {
        let WebhookRequest {
            provider,
            event_id,
            event_type,
            payload,
            signature,
        } = request;

        if self
            .store
            .find_by_provider_and_event_id(&provider, &event_id)
            .await?
            .is_some()
        {
            return Ok(already_processed(&provider, &event_id));
        }

        let event = Event::admitted(NewEvent {
            provider: provider.clone(),
            event_id: event_id.clone(),
            event_type,
            payload: parse_payload(&payload),
            signature,
            max_retries: self.max_retries,
        });

        let event = match self.store.create(event).await {
            Ok(event) => event,
            Err(StoreError::DuplicateEvent { .. }) => {
                return Ok(already_processed(&provider, &event_id));
            }
            Err(err) => return Err(err.into()),
        };

        let options = JobOptions {
            max_attempts: event.max_retries,
            backoff: self.backoff,
        };
        if let Err(err) = self.queue.enqueue(event.id, options).await {
            tracing::error!(
                id = %event.id,
                provider = %provider,
                event_id = %event_id,
                error = %err,
                "failed to enqueue admitted event"
            );
            // An unqueued PENDING row never runs; free the id for the retry.
            if let Err(store_err) = self.store.remove_pending(&event.id).await {
                tracing::error!(
                    id = %event.id,
                    error = %store_err,
                    "failed to roll back unqueued event"
                );
            }
            return Err(err.into());
        }

        metric_inc_provider("webhook.intake.queued", &provider);
        tracing::info!(
            id = %event.id,
            provider = %provider,
            event_id = %event_id,
            event_type = %event.event_type,
            "webhook queued"
        );
        Ok(AdmitOutcome::Queued { event_id: event.id })
    }
}

fn already_processed(provider: &Provider, event_id: &str) -> AdmitOutcome {
    metric_inc("webhook.intake.duplicate");
    tracing::info!(provider = %provider, event_id, "event already processed");
    AdmitOutcome::AlreadyProcessed
}

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Third-party system a webhook originates from.
///
/// The built-in variants carry a known signature header. Any other
/// provider name is kept verbatim (upper-cased) in [`Provider::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Provider {
    Stripe,
    Paypal,
    Github,
    Other(String),
}

impl Provider {
    /// Parse a provider name case-insensitively, e.g. a URL path segment.
    pub fn parse(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        match upper.as_str() {
            "STRIPE" => Provider::Stripe,
            "PAYPAL" => Provider::Paypal,
            "GITHUB" => Provider::Github,
            _ => Provider::Other(upper),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Provider::Stripe => "STRIPE",
            Provider::Paypal => "PAYPAL",
            Provider::Github => "GITHUB",
            Provider::Other(name) => name,
        }
    }

    /// Request header carrying this provider's signature.
    pub fn signature_header(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe-signature",
            Provider::Paypal => "paypal-signature",
            Provider::Github => "x-hub-signature-256",
            Provider::Other(_) => "x-webhook-signature",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Provider::parse(s))
    }
}

impl From<String> for Provider {
    fn from(value: String) -> Self {
        Provider::parse(&value)
    }
}

impl From<Provider> for String {
    fn from(value: Provider) -> Self {
        value.as_str().to_string()
    }
}

/// System-assigned identifier of an admitted event.
///
/// Distinct from the provider-supplied `event_id`, which is only unique
/// per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Processing status of an event.
///
/// Transitions only move forward:
///
/// ```text
/// PENDING -> PROCESSING -> COMPLETED
///    |          |  ^
///    |          +--+ (retry / redelivery)
///    |          v
///    +----> DEAD_LETTER
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    DeadLetter,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::DeadLetter)
    }

    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, DeadLetter)
                | (Pending, DeadLetter)
        )
    }

    /// Every status from which `next` may be entered.
    pub fn predecessors(next: EventStatus) -> Vec<EventStatus> {
        [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Completed,
            EventStatus::DeadLetter,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(next))
        .collect()
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "PROCESSING" => Ok(EventStatus::Processing),
            "COMPLETED" => Ok(EventStatus::Completed),
            "DEAD_LETTER" => Ok(EventStatus::DeadLetter),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// A webhook callback that passed signature verification and was admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub provider: Provider,

    /// Provider-supplied identifier, unique per provider.
    pub event_id: String,

    pub event_type: String,

    /// Request body as received.
    pub payload: serde_json::Value,

    /// Raw signature header value, kept for audit.
    pub signature: Option<String>,

    pub status: EventStatus,

    /// Number of processing attempts that failed.
    pub retry_count: u32,

    /// Failed attempts allowed before the event is dead-lettered.
    pub max_retries: u32,

    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build a freshly admitted event in `PENDING` state.
    pub fn admitted(new: NewEvent) -> Self {
        Self {
            id: EventId::new(),
            provider: new.provider,
            event_id: new.event_id,
            event_type: new.event_type,
            payload: new.payload,
            signature: new.signature,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries.max(1),
            next_retry_at: None,
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Move to `next`, applying `fields`, if the transition is allowed.
    pub fn transition(&mut self, next: EventStatus, fields: &StatusFields) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        if let Some(expected) = fields.expected_retry_count {
            if expected != self.retry_count {
                return Err(StoreError::StaleRetryCount {
                    id: self.id,
                    expected,
                    actual: self.retry_count,
                });
            }
        }
        self.status = next;
        fields.apply(self);
        Ok(())
    }
}

/// Admission input for a new [`Event`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub provider: Provider,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub signature: Option<String>,
    pub max_retries: u32,
}

/// Optional field changes written together with a status update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusFields {
    pub retry_count: Option<u32>,

    /// `Some(None)` clears the stored value.
    pub next_retry_at: Option<Option<DateTime<Utc>>>,

    pub processed_at: Option<DateTime<Utc>>,

    /// Reject the update unless the stored `retry_count` still equals this.
    pub expected_retry_count: Option<u32>,
}

impl StatusFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn with_processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    /// Compare-and-set guard on the failure counter.
    pub fn expect_retry_count(mut self, retry_count: u32) -> Self {
        self.expected_retry_count = Some(retry_count);
        self
    }

    pub fn apply(&self, event: &mut Event) {
        if let Some(count) = self.retry_count {
            event.retry_count = count;
        }
        if let Some(next) = self.next_retry_at {
            event.next_retry_at = next;
        }
        if let Some(at) = self.processed_at {
            event.processed_at = Some(at);
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,

    /// No cap unless configured.
    pub max_ms: Option<u64>,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self {
            base_ms: duration_millis(base),
            max_ms: None,
        }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max_ms = Some(duration_millis(max));
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let pow = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.base_ms.saturating_mul(pow);
        let delay = match self.max_ms {
            Some(max) => delay.min(max),
            None => delay,
        };
        Duration::from_millis(delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Wall-clock time `delay` from now, saturating at the far end of the range.
pub(crate) fn utc_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-job retry settings given at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Queue entry referencing an [`Event`] by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub event_id: EventId,

    /// Failed attempts so far.
    pub attempt: u32,

    pub max_attempts: u32,
    pub backoff: Backoff,
    pub enqueued_at: DateTime<Utc>,

    /// Earliest time the job may be leased.
    pub ready_at: DateTime<Utc>,
}

/// Returned by [`JobQueue::enqueue`](crate::JobQueue::enqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: JobId,
    pub event_id: EventId,
}

/// Immutable copy of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub event_id: EventId,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Result of a successful intake call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmitOutcome {
    /// Newly admitted and scheduled for processing.
    Queued {
        #[serde(rename = "eventId")]
        event_id: EventId,
    },

    /// The (provider, event id) pair was seen before.
    AlreadyProcessed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_is_case_insensitive() {
        assert_eq!(Provider::parse("stripe"), Provider::Stripe);
        assert_eq!(Provider::parse("GitHub"), Provider::Github);
        assert_eq!(Provider::parse("acme"), Provider::Other("ACME".to_string()));
        assert_eq!(Provider::Paypal.signature_header(), "paypal-signature");
    }

    #[test]
    fn status_transitions_only_move_forward() {
        use EventStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(DeadLetter));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(DeadLetter));
        assert!(!DeadLetter.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert_eq!(EventStatus::predecessors(Completed), vec![Processing]);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));

        let capped = backoff.with_max(Duration::from_secs(5));
        assert_eq!(capped.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let backoff = Backoff::exponential(Duration::from_millis(1000));
        let mut previous = Duration::ZERO;
        for attempt in 0..80 {
            let delay = backoff.delay_for(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn backoff_from_huge_durations_saturates() {
        let backoff = Backoff::exponential(Duration::MAX).with_max(Duration::MAX);
        assert_eq!(backoff.base_ms, u64::MAX);
        assert_eq!(backoff.max_ms, Some(u64::MAX));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(u64::MAX));
        assert_eq!(duration_millis(Duration::from_secs(3)), 3_000);
    }

    #[test]
    fn transition_checks_expected_retry_count() {
        let mut event = Event::admitted(NewEvent {
            provider: Provider::Stripe,
            event_id: "evt_cas".to_string(),
            event_type: "payment.succeeded".to_string(),
            payload: serde_json::Value::Null,
            signature: None,
            max_retries: 3,
        });
        event.transition(EventStatus::Processing, &StatusFields::new()).unwrap();
        event
            .transition(
                EventStatus::Processing,
                &StatusFields::new().expect_retry_count(0).with_retry_count(1),
            )
            .unwrap();
        assert_eq!(event.retry_count, 1);

        // A second writer that also loaded retry_count 0 loses.
        let err = event
            .transition(
                EventStatus::Processing,
                &StatusFields::new().expect_retry_count(0).with_retry_count(1),
            )
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StaleRetryCount {
                id: event.id,
                expected: 0,
                actual: 1,
            }
        );
        assert_eq!(event.retry_count, 1);
    }

    #[test]
    fn admit_outcome_serializes_like_http_body() {
        let id = EventId::new();
        let queued = serde_json::to_value(AdmitOutcome::Queued { event_id: id }).unwrap();
        assert_eq!(queued["status"], "queued");
        assert_eq!(queued["eventId"], id.0.to_string());

        let dup = serde_json::to_value(AdmitOutcome::AlreadyProcessed).unwrap();
        assert_eq!(dup, serde_json::json!({ "status": "already_processed" }));
    }
}

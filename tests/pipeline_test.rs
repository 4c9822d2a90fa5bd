use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use webhook_intake::{
    compute_signature, AdmitError, AdmitOutcome, Event, EventId, EventStatus, FnHandler,
    HandlerError, HandlerRegistry, IntakeConfig, Pipeline, Provider, QueueCounts, SignatureError,
    WebhookRequest,
};

const STRIPE_SECRET: &str = "whsec_stripe";
const PAYPAL_SECRET: &str = "whsec_paypal";
const GITHUB_SECRET: &str = "gh_secret";

fn config() -> IntakeConfig {
    IntakeConfig::new()
        .with_secret(Provider::Stripe, STRIPE_SECRET)
        .with_secret(Provider::Paypal, PAYPAL_SECRET)
        .with_secret(Provider::Github, GITHUB_SECRET)
        .with_backoff(Duration::from_millis(1), None)
        .with_poll_interval(Duration::from_millis(10))
        .with_worker_count(2)
}

fn secret_for(provider: &Provider) -> &'static str {
    match provider {
        Provider::Stripe => STRIPE_SECRET,
        Provider::Paypal => PAYPAL_SECRET,
        _ => GITHUB_SECRET,
    }
}

fn signed_request(provider: Provider, event_id: &str, event_type: &str) -> WebhookRequest {
    let body = serde_json::json!({ "id": event_id, "type": event_type }).to_string();
    let signature = compute_signature(secret_for(&provider).as_bytes(), body.as_bytes());
    WebhookRequest {
        provider,
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        payload: body.into_bytes(),
        signature: Some(signature),
    }
}

/// Handler that fails its first `failures` calls, counting every call.
fn flaky(calls: Arc<AtomicU32>, failures: u32) -> HandlerRegistry {
    HandlerRegistry::new(FnHandler(move |_event_type: String, _payload: Value| {
        let calls = calls.clone();
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                Err(HandlerError::new(format!("attempt {call} failed")))
            } else {
                Ok(())
            }
        }
    }))
}

fn queued_id(outcome: AdmitOutcome) -> EventId {
    match outcome {
        AdmitOutcome::Queued { event_id } => event_id,
        other => panic!("expected queued, got {other:?}"),
    }
}

async fn wait_for_status(pipeline: &Pipeline, id: EventId, status: EventStatus) -> Event {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let event = pipeline.event(&id).await.unwrap().unwrap();
        if event.status == status {
            return event;
        }
        assert!(
            Instant::now() < deadline,
            "event stuck in {} waiting for {status}",
            event.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn github_event_completes_on_first_attempt() {
    let mut pipeline = Pipeline::in_memory(config(), HandlerRegistry::default());

    let outcome = pipeline
        .admit(signed_request(Provider::Github, "evt_1", "push"))
        .await
        .unwrap();
    let id = queued_id(outcome);

    let event = wait_for_status(&pipeline, id, EventStatus::Completed).await;
    assert_eq!(event.retry_count, 0);
    assert_eq!(event.provider, Provider::Github);
    assert_eq!(event.event_id, "evt_1");
    assert!(event.processed_at.is_some());
    assert!(pipeline.dead_letters().await.is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn stripe_event_failing_every_attempt_is_dead_lettered() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut pipeline = Pipeline::in_memory(config(), flaky(calls.clone(), u32::MAX));

    let id = queued_id(
        pipeline
            .admit(signed_request(Provider::Stripe, "evt_2", "payment.succeeded"))
            .await
            .unwrap(),
    );

    let event = wait_for_status(&pipeline, id, EventStatus::DeadLetter).await;
    assert_eq!(event.retry_count, 3);
    assert!(event.processed_at.is_none());

    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.dead_letters().await.is_empty() {
        assert!(Instant::now() < deadline, "dead-letter entry never recorded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // No redelivery after dead-lettering.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let dead = pipeline.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event_id, id);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].reason, "attempt 3 failed");

    let counts = pipeline.queue().counts().await;
    assert_eq!(counts.ready + counts.delayed + counts.leased, 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn lease_expiring_mid_handler_still_dead_letters_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let slow_failure = HandlerRegistry::new(FnHandler(move |_event_type: String, _payload: Value| {
        let calls = counter.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(60)).await;
            Err(HandlerError::new("timed out"))
        }
    }));
    let config = config()
        .with_max_retries(1)
        .with_lease_timeout(Duration::from_millis(20));
    let mut pipeline = Pipeline::in_memory(config, slow_failure);

    let id = queued_id(
        pipeline
            .admit(signed_request(Provider::Stripe, "evt_slow", "payment.succeeded"))
            .await
            .unwrap(),
    );

    let event = wait_for_status(&pipeline, id, EventStatus::DeadLetter).await;
    assert_eq!(event.retry_count, 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let counts = pipeline.queue().counts().await;
        if !pipeline.dead_letters().await.is_empty() && counts.ready + counts.delayed + counts.leased == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "redelivered job never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Let any stale delivery finish before counting entries.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let dead = pipeline.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event_id, id);
    assert!(calls.load(Ordering::SeqCst) >= 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn transient_failures_end_in_completion() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut pipeline = Pipeline::in_memory(config(), flaky(calls.clone(), 2));

    let id = queued_id(
        pipeline
            .admit(signed_request(Provider::Stripe, "evt_flaky", "order.created"))
            .await
            .unwrap(),
    );

    let event = wait_for_status(&pipeline, id, EventStatus::Completed).await;
    assert_eq!(event.retry_count, 2);
    assert!(event.next_retry_at.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(pipeline.dead_letters().await.is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn retry_ceiling_follows_configured_max_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut pipeline = Pipeline::in_memory(
        config().with_max_retries(5),
        flaky(calls.clone(), u32::MAX),
    );

    let id = queued_id(
        pipeline
            .admit(signed_request(Provider::Paypal, "evt_ceiling", "user.created"))
            .await
            .unwrap(),
    );

    let event = wait_for_status(&pipeline, id, EventStatus::DeadLetter).await;
    assert_eq!(event.max_retries, 5);
    assert_eq!(event.retry_count, 5);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn paypal_event_submitted_twice_is_admitted_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut pipeline = Pipeline::in_memory(config(), flaky(calls.clone(), 0));

    let first = pipeline
        .admit(signed_request(Provider::Paypal, "evt_3", "order.created"))
        .await
        .unwrap();
    let second = pipeline
        .admit(signed_request(Provider::Paypal, "evt_3", "order.created"))
        .await
        .unwrap();

    let id = queued_id(first);
    assert_eq!(second, AdmitOutcome::AlreadyProcessed);

    wait_for_status(&pipeline, id, EventStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Same external id from another provider is a different event.
    let other = pipeline
        .admit(signed_request(Provider::Stripe, "evt_3", "order.created"))
        .await
        .unwrap();
    assert!(matches!(other, AdmitOutcome::Queued { .. }));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn concurrent_duplicates_admit_exactly_one() {
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = Arc::new(Pipeline::in_memory(config(), flaky(calls.clone(), 0)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .admit(signed_request(Provider::Stripe, "evt_race", "payment.succeeded"))
                .await
        }));
    }

    let mut queued = Vec::new();
    for handle in handles {
        if let AdmitOutcome::Queued { event_id } = handle.await.unwrap().unwrap() {
            queued.push(event_id);
        }
    }
    assert_eq!(queued.len(), 1);

    wait_for_status(&pipeline, queued[0], EventStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_signature_is_rejected_without_side_effects() {
    let mut pipeline = Pipeline::in_memory(config(), HandlerRegistry::default());

    let mut request = signed_request(Provider::Stripe, "evt_unsigned", "payment.succeeded");
    request.signature = None;

    let err = pipeline.admit(request).await.unwrap_err();
    assert_eq!(err, AdmitError::Signature(SignatureError::MissingSignature));
    assert!(err.is_client_error());
    assert!(pipeline
        .store()
        .find_by_provider_and_event_id(&Provider::Stripe, "evt_unsigned")
        .await
        .unwrap()
        .is_none());
    assert_eq!(pipeline.queue().counts().await, QueueCounts::default());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let mut pipeline = Pipeline::in_memory(config(), HandlerRegistry::default());

    let mut request = signed_request(Provider::Github, "evt_tampered", "push");
    let last = request.payload.len() - 2;
    request.payload[last] ^= 0x20;

    let err = pipeline.admit(request).await.unwrap_err();
    assert_eq!(err, AdmitError::Signature(SignatureError::InvalidSignature));
    assert!(pipeline
        .store()
        .find_by_provider_and_event_id(&Provider::Github, "evt_tampered")
        .await
        .unwrap()
        .is_none());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn unconfigured_provider_is_rejected() {
    let mut pipeline = Pipeline::in_memory(config(), HandlerRegistry::default());

    let body = br#"{"id":"evt_acme"}"#;
    let err = pipeline
        .receive("acme", [("x-webhook-signature", "00ff")], body)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AdmitError::Signature(SignatureError::UnknownProvider(Provider::Other("ACME".to_string())))
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_workers_and_rejects_new_jobs() {
    let mut pipeline = Pipeline::in_memory(config(), HandlerRegistry::default());
    assert!(pipeline.is_running());

    pipeline.shutdown().await;
    assert!(!pipeline.is_running());

    let err = pipeline
        .admit(signed_request(Provider::Github, "evt_late", "push"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmitError::Queue(_)));
}

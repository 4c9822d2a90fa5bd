//! axum adapter: `POST /webhooks/{provider}` and `GET /events/{id}`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AdmitError, SignatureError};
use crate::event_store::EventStore;
use crate::intake::IntakeHandler;
use crate::types::{AdmitOutcome, EventId};

#[derive(Clone)]
struct AppState {
    intake: IntakeHandler,
    store: Arc<dyn EventStore>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

fn error_response(status: StatusCode, error: &'static str, message: String) -> Response {
    (status, Json(ErrorResponse { error, message })).into_response()
}

pub fn router(intake: IntakeHandler, store: Arc<dyn EventStore>) -> Router {
    Router::new()
        .route("/webhooks/{provider}", post(receive_webhook))
        .route("/events/{id}", get(get_event))
        .with_state(AppState { intake, store })
}

async fn receive_webhook(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AdmitError> {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)));

    let outcome = state.intake.receive(&provider, headers, &body).await?;
    let status = match outcome {
        AdmitOutcome::Queued { .. } => StatusCode::ACCEPTED,
        AdmitOutcome::AlreadyProcessed => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn get_event(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_id", format!("not an event id: {id}"));
    };

    match state.store.find_by_id(&EventId(uuid)).await {
        Ok(Some(event)) => Json(event).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", format!("event not found: {id}")),
        Err(err) => {
            tracing::error!(error = %err, "event lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

impl IntoResponse for AdmitError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AdmitError::Signature(SignatureError::MissingSignature) => {
                (StatusCode::BAD_REQUEST, "missing_signature")
            }
            AdmitError::Signature(SignatureError::UnknownProvider(_)) => {
                (StatusCode::BAD_REQUEST, "unknown_provider")
            }
            AdmitError::Signature(SignatureError::InvalidSignature) => {
                (StatusCode::UNAUTHORIZED, "invalid_signature")
            }
            AdmitError::MissingEventId => (StatusCode::BAD_REQUEST, "missing_event_id"),
            AdmitError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
            AdmitError::Queue(_) => (StatusCode::INTERNAL_SERVER_ERROR, "queue_error"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "webhook intake failed");
        }
        error_response(status, code, self.to_string())
    }
}

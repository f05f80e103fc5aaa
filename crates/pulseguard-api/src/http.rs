//! Axum adapters over the orchestrators.
//!
//! Every response — success or failure — echoes the correlation ID in the
//! `X-Request-ID` header; error bodies are the structured envelope
//! `{code, message, correlation_id}` and never leak internals.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use pulseguard_bus::EventBus;
use pulseguard_models::ModelRegistry;
use pulseguard_mlops::{DriftDetector, DriftRequest};
use pulseguard_store::{AlertStore, Database};
use pulseguard_types::{AlertStatus, CorrelationId, Event, EventPayload};

use crate::ingest::{IngestError, IngestOutcome, IngestRequest, IngestService};

const REQUEST_ID_HEADER: &str = "x-request-id";
const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const API_KEY_HEADER: &str = "x-api-key";

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the handlers need, cloned per request via `Arc`.
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub detector: DriftDetector,
    pub alerts: AlertStore,
    pub bus: EventBus,
    pub db: Database,
    pub models: Arc<dyn ModelRegistry>,
    drift_limiter: DefaultKeyedRateLimiter<String>,
}

impl AppState {
    pub fn new(
        ingest: Arc<IngestService>,
        detector: DriftDetector,
        alerts: AlertStore,
        bus: EventBus,
        db: Database,
        models: Arc<dyn ModelRegistry>,
        drift_rate_per_minute: u32,
    ) -> Arc<Self> {
        let quota = Quota::per_minute(
            NonZeroU32::new(drift_rate_per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
        );
        Arc::new(Self {
            ingest,
            detector,
            alerts,
            bus,
            db,
            models,
            drift_limiter: RateLimiter::keyed(quota),
        })
    }
}

/// Build the full API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/data/ingest", post(ingest_handler))
        .route("/v1/ml/check_drift", post(check_drift_handler))
        .route("/v1/alerts/{id}/feedback", post(alert_feedback_handler))
        .route("/health", get(health_handler))
        .route("/health/ready", get(ready_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope helpers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    code: &'static str,
    message: String,
    correlation_id: CorrelationId,
}

fn envelope(
    status: StatusCode,
    code: &'static str,
    message: String,
    correlation_id: CorrelationId,
) -> Response {
    let mut response = (
        status,
        Json(ErrorEnvelope {
            code,
            message,
            correlation_id,
        }),
    )
        .into_response();
    stamp_request_id(&mut response, correlation_id);
    response
}

fn stamp_request_id(response: &mut Response, correlation_id: CorrelationId) {
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn correlation_from(headers: &HeaderMap) -> CorrelationId {
    CorrelationId::from_header(header_str(headers, REQUEST_ID_HEADER))
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /v1/data/ingest
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct AcceptedBody {
    event_id: Uuid,
    correlation_id: CorrelationId,
}

#[derive(Serialize)]
struct DuplicateBody {
    status: &'static str,
    event_id: Uuid,
    correlation_id: CorrelationId,
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Response {
    let correlation_id = correlation_from(&headers);
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return envelope(
                StatusCode::BAD_REQUEST,
                "malformed_payload",
                rejection.body_text(),
                correlation_id,
            );
        }
    };
    let idempotency_key = header_str(&headers, IDEMPOTENCY_HEADER);

    let mut response = match state
        .ingest
        .ingest(request, idempotency_key, correlation_id)
        .await
    {
        Ok(IngestOutcome::Accepted { event_id }) => (
            StatusCode::ACCEPTED,
            Json(AcceptedBody {
                event_id,
                correlation_id,
            }),
        )
            .into_response(),
        Ok(IngestOutcome::Duplicate { event_id }) => (
            StatusCode::OK,
            Json(DuplicateBody {
                status: "duplicate_ignored",
                event_id,
                correlation_id,
            }),
        )
            .into_response(),
        Err(IngestError::Validation { code, message }) => {
            return envelope(StatusCode::BAD_REQUEST, code, message, correlation_id);
        }
        Err(e @ IngestError::QueueFull) => {
            let mut response = envelope(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_full",
                e.to_string(),
                correlation_id,
            );
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            return response;
        }
        Err(e @ IngestError::IdempotencyUnavailable(_)) => {
            return envelope(
                StatusCode::SERVICE_UNAVAILABLE,
                "idempotency_unavailable",
                e.to_string(),
                correlation_id,
            );
        }
        Err(e @ IngestError::Storage(_)) => {
            error!(error = %e, "ingestion storage failure");
            return envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_failure",
                e.to_string(),
                correlation_id,
            );
        }
        Err(e @ IngestError::PipelineNotStarted { .. }) => {
            error!(error = %e, "reading persisted but pipeline start failed");
            return envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "pipeline_not_started",
                e.to_string(),
                correlation_id,
            );
        }
    };
    stamp_request_id(&mut response, correlation_id);
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /v1/ml/check_drift
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DriftCheckBody {
    sensor_id: String,
    window_minutes: u32,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    p_value_threshold: Option<f64>,
    #[serde(default)]
    min_samples: Option<usize>,
}

#[derive(Serialize)]
struct DriftCheckResponse {
    drift_detected: bool,
    p_value: Option<f64>,
    ks_statistic: Option<f64>,
    reference_count: usize,
    current_count: usize,
    request_id: CorrelationId,
    evaluated_at: chrono::DateTime<chrono::Utc>,
    insufficient_data: bool,
}

async fn check_drift_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<DriftCheckBody>, JsonRejection>,
) -> Response {
    let correlation_id = correlation_from(&headers);
    let Json(body) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return envelope(
                StatusCode::BAD_REQUEST,
                "malformed_payload",
                rejection.body_text(),
                correlation_id,
            );
        }
    };

    let api_key = header_str(&headers, API_KEY_HEADER)
        .unwrap_or("anonymous")
        .to_string();
    if state.drift_limiter.check_key(&api_key).is_err() {
        return envelope(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "drift-check quota exceeded for this API key".to_string(),
            correlation_id,
        );
    }

    let request = DriftRequest {
        sensor_id: body.sensor_id,
        model_name: body
            .model_name
            .unwrap_or_else(|| "adhoc".to_string()),
        window_minutes: body.window_minutes,
        p_value_threshold: body
            .p_value_threshold
            .unwrap_or(DriftRequest::DEFAULT_P_VALUE_THRESHOLD),
        min_samples: body.min_samples.unwrap_or(DriftRequest::DEFAULT_MIN_SAMPLES),
        hard_cap: DriftRequest::DEFAULT_HARD_CAP,
    };

    match state.detector.check(&request, correlation_id).await {
        Ok(report) => {
            let mut response = Json(DriftCheckResponse {
                drift_detected: report.drift_detected,
                p_value: report.p_value,
                ks_statistic: report.ks_statistic,
                reference_count: report.reference_count,
                current_count: report.current_count,
                request_id: report.correlation_id,
                evaluated_at: report.evaluated_at,
                insufficient_data: report.insufficient_data,
            })
            .into_response();
            stamp_request_id(&mut response, correlation_id);
            response
        }
        Err(e) => {
            error!(error = %e, "drift check failed");
            envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "drift_check_failed",
                e.to_string(),
                correlation_id,
            )
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /v1/alerts/{id}/feedback
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FeedbackBody {
    status: AlertStatus,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Serialize)]
struct FeedbackResponse {
    status: &'static str,
    alert_id: Uuid,
    correlation_id: CorrelationId,
}

async fn alert_feedback_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    payload: Result<Json<FeedbackBody>, JsonRejection>,
) -> Response {
    let correlation_id = correlation_from(&headers);
    let Json(body) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return envelope(
                StatusCode::BAD_REQUEST,
                "malformed_payload",
                rejection.body_text(),
                correlation_id,
            );
        }
    };

    let alert = match state.alerts.get(id).await {
        Ok(Some(alert)) => alert,
        Ok(None) => {
            return envelope(
                StatusCode::NOT_FOUND,
                "alert_not_found",
                format!("no alert with id {id}"),
                correlation_id,
            );
        }
        Err(e) => {
            return envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_failure",
                e.to_string(),
                correlation_id,
            );
        }
    };

    if let Err(e) = state.alerts.update_status(id, body.status).await {
        return envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_failure",
            e.to_string(),
            correlation_id,
        );
    }

    // Feedback fans out to whatever learning subsystem subscribes; losing it
    // must not fail the triage action.
    let feedback = body
        .feedback
        .unwrap_or_else(|| format!("status set to {}", body.status));
    if let Err(e) = state
        .bus
        .publish(Event::new(
            "api::alert_feedback",
            correlation_id,
            EventPayload::SystemFeedbackReceived {
                alert_id: id,
                sensor_id: alert.sensor_id,
                feedback,
            },
        ))
        .await
    {
        error!(error = %e, "failed to publish feedback event");
    }

    let mut response = Json(FeedbackResponse {
        status: "recorded",
        alert_id: id,
        correlation_id,
    })
    .into_response();
    stamp_request_id(&mut response, correlation_id);
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    repository: bool,
    event_bus: bool,
    model_registry: bool,
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    let repository = state.db.ping().await.is_ok();
    let event_bus = state.bus.is_accepting();
    let model_registry = state.models.ping().await.is_ok();
    let ready = repository && event_bus && model_registry;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if ready { "ready" } else { "degraded" },
            repository,
            event_bus,
            model_registry,
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

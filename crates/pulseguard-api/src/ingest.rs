//! The ingestion orchestrator.
//!
//! One call runs the whole write path: payload validation → idempotency
//! reservation → repository insert (with bounded retry on transient errors)
//! → `SensorReadingIngested` publication.  The orchestrator knows nothing of
//! HTTP; the adapter in [`crate::http`] maps [`IngestOutcome`] and
//! [`IngestError`] onto status codes and the error envelope.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use pulseguard_bus::{BusError, EventBus};
use pulseguard_store::{IdempotencyStore, ReadingRepository, Reservation, StoreError};
use pulseguard_types::{CorrelationId, Event, EventPayload, Sensor, SensorReading, SensorStatus,
    SensorType};

const SOURCE: &str = "ingest";

/// Wire shape of an ingestion payload.  `sensor_type` stays a raw string
/// until validation so the error can carry a stable code instead of a serde
/// parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub sensor_id: String,
    pub sensor_type: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Idempotency-key reservation TTL.
    pub idempotency_ttl: Duration,
    /// Bootstrap unknown sensors (status `active`) instead of rejecting.
    pub auto_register_sensors: bool,
    /// Total insert attempts on transient repository errors.
    pub max_insert_attempts: u32,
    /// First retry delay; doubles per attempt, jittered ±25 %.
    pub retry_backoff_base: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(600),
            auto_register_sensors: true,
            max_insert_attempts: 3,
            retry_backoff_base: Duration::from_millis(100),
        }
    }
}

/// Successful ingestion results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The reading was persisted and the pipeline event published.
    Accepted { event_id: Uuid },
    /// A recognized replay — idempotency key or natural-key collision.  The
    /// caller replays the original response.
    Duplicate { event_id: Uuid },
}

/// Ingestion failures, pre-sorted for the HTTP adapter.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Bad payload: 400, never retried, never published.
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
    },

    /// The idempotency backend could not answer: 5xx, the key is NOT
    /// treated as a duplicate.
    #[error("idempotency backend unavailable: {0}")]
    IdempotencyUnavailable(String),

    /// The repository kept failing transiently or failed permanently: 5xx.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The bus queue stayed full: 503 with Retry-After.
    #[error("event queue full")]
    QueueFull,

    /// The row was persisted but the pipeline event could not be published:
    /// 5xx, reconcilable from the stored row.
    #[error("reading {event_id} persisted but pipeline start failed: {reason}")]
    PipelineNotStarted { event_id: Uuid, reason: String },
}

/// The single write path into the runtime.
pub struct IngestService {
    repo: ReadingRepository,
    idempotency: Arc<dyn IdempotencyStore>,
    bus: EventBus,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(
        repo: ReadingRepository,
        idempotency: Arc<dyn IdempotencyStore>,
        bus: EventBus,
        config: IngestConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            idempotency,
            bus,
            config,
        })
    }

    /// Run the full ingestion flow for one payload.
    #[instrument(name = "ingest", skip(self, request, idempotency_key),
        fields(sensor_id = %request.sensor_id, correlation_id = %correlation_id))]
    pub async fn ingest(
        &self,
        request: IngestRequest,
        idempotency_key: Option<&str>,
        correlation_id: CorrelationId,
    ) -> Result<IngestOutcome, IngestError> {
        let reading = validate(request)?;
        let event_id = Uuid::new_v4();

        if let Some(key) = idempotency_key {
            match self
                .idempotency
                .reserve(key, event_id, self.config.idempotency_ttl)
                .await
            {
                Ok(Reservation::FirstTime) => {}
                Ok(Reservation::Duplicate(original)) => {
                    debug!(key, original = %original, "idempotent replay");
                    return Ok(IngestOutcome::Duplicate { event_id: original });
                }
                Err(e) => return Err(IngestError::IdempotencyUnavailable(e.to_string())),
            }
        }

        self.ensure_sensor(&reading).await?;

        match self.insert_with_retry(&reading).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey) => {
                // Same (timestamp, sensor_id) row already exists: a logical
                // duplicate even without an idempotency key.
                debug!(sensor_id = %reading.sensor_id, "natural-key duplicate");
                return Ok(IngestOutcome::Duplicate { event_id });
            }
            Err(e) => return Err(IngestError::Storage(e.to_string())),
        }

        let event = Event::with_id(
            event_id,
            SOURCE,
            correlation_id,
            EventPayload::SensorReadingIngested { reading },
        );
        match self.bus.publish(event).await {
            Ok(()) => Ok(IngestOutcome::Accepted { event_id }),
            Err(BusError::QueueFull(_)) => Err(IngestError::QueueFull),
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "row persisted but publish failed");
                Err(IngestError::PipelineNotStarted {
                    event_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn ensure_sensor(&self, reading: &SensorReading) -> Result<(), IngestError> {
        match self.repo.get_sensor(&reading.sensor_id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) if self.config.auto_register_sensors => {
                self.repo
                    .bootstrap_sensor(Sensor {
                        sensor_id: reading.sensor_id.clone(),
                        sensor_type: reading.sensor_type,
                        location: None,
                        status: SensorStatus::Active,
                    })
                    .await
                    .map_err(|e| IngestError::Storage(e.to_string()))?;
                Ok(())
            }
            Ok(None) => Err(IngestError::Validation {
                code: "unknown_sensor",
                message: format!("sensor '{}' is not registered", reading.sensor_id),
            }),
            Err(e) => Err(IngestError::Storage(e.to_string())),
        }
    }

    async fn insert_with_retry(&self, reading: &SensorReading) -> Result<(), StoreError> {
        let max_attempts = self.config.max_insert_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.repo.insert(reading).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = jittered_backoff(self.config.retry_backoff_base, attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient insert failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Exponential backoff (base × 2^(attempt−1)) with ±25 % jitter.
fn jittered_backoff(base: Duration, failed_attempt: u32) -> Duration {
    let factor = 1u32 << failed_attempt.saturating_sub(1).min(16);
    let nominal = base.saturating_mul(factor);
    let jitter = rand::rng().random_range(0.75..=1.25);
    nominal.mul_f64(jitter)
}

/// Shape and bounds checks.  Deep semantic validation (skew, type match
/// against the master record) belongs to the validation agent downstream.
fn validate(request: IngestRequest) -> Result<SensorReading, IngestError> {
    if request.sensor_id.is_empty() {
        return Err(IngestError::Validation {
            code: "sensor_id_empty",
            message: "sensor_id must not be empty".to_string(),
        });
    }
    if request.sensor_id.len() > pulseguard_types::domain::MAX_SENSOR_ID_LEN {
        return Err(IngestError::Validation {
            code: "sensor_id_too_long",
            message: format!(
                "sensor_id exceeds {} characters",
                pulseguard_types::domain::MAX_SENSOR_ID_LEN
            ),
        });
    }
    let sensor_type: SensorType = request.sensor_type.parse().map_err(|e: String| {
        IngestError::Validation {
            code: "unknown_sensor_type",
            message: e,
        }
    })?;
    if !request.value.is_finite() {
        return Err(IngestError::Validation {
            code: "value_not_finite",
            message: format!("value {} is not finite", request.value),
        });
    }
    if let Some(quality) = request.quality
        && !(0.0..=1.0).contains(&quality)
    {
        return Err(IngestError::Validation {
            code: "quality_out_of_range",
            message: format!("quality {quality} is outside [0, 1]"),
        });
    }

    Ok(SensorReading {
        sensor_id: request.sensor_id,
        sensor_type,
        value: request.value,
        unit: request.unit,
        timestamp: request.timestamp,
        quality: request.quality,
        metadata: request.metadata,
    })
}

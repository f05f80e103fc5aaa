//! The closed event union routed over the in-process bus.
//!
//! Every event is a common header ([`Event`]) plus one variant of
//! [`EventPayload`].  The parallel fieldless [`EventType`] enum keys bus
//! subscriptions, so a subscriber names the variant it wants without
//! pattern-matching on payload data.
//!
//! # Wire format
//!
//! When persisted (DLQ, audit) events serialize as JSON with the header
//! fields first and an internally-tagged payload:
//!
//! ```json
//! {
//!   "event_id": "…",
//!   "correlation_id": "…",
//!   "occurred_at": "2025-08-22T10:00:00.000123Z",
//!   "attempt": 0,
//!   "source": "ingest",
//!   "payload": { "event_type": "sensor_reading_ingested", … }
//! }
//! ```
//!
//! Events are in-process values; durability is not required.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::CorrelationId;
use crate::domain::{AnomalyAlert, DriftReport, RetrainOutcome, RetrainSkipReason, Sensor,
    SensorReading};

/// Discriminant of [`EventPayload`], used to key bus subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SensorReadingIngested,
    DataAcquired,
    DataValidated,
    ValidationFailed,
    AnomalyDetected,
    NotificationDispatched,
    DriftDetected,
    RetrainScheduled,
    RetrainSkipped,
    RetrainCompleted,
    SystemFeedbackReceived,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::SensorReadingIngested => "sensor_reading_ingested",
            EventType::DataAcquired => "data_acquired",
            EventType::DataValidated => "data_validated",
            EventType::ValidationFailed => "validation_failed",
            EventType::AnomalyDetected => "anomaly_detected",
            EventType::NotificationDispatched => "notification_dispatched",
            EventType::DriftDetected => "drift_detected",
            EventType::RetrainScheduled => "retrain_scheduled",
            EventType::RetrainSkipped => "retrain_skipped",
            EventType::RetrainCompleted => "retrain_completed",
            EventType::SystemFeedbackReceived => "system_feedback_received",
        };
        f.write_str(s)
    }
}

/// Variant-specific event bodies.
///
/// The set is closed: adding a variant is a deliberate API change that every
/// subscriber sees at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A reading was persisted and the pipeline should start.
    SensorReadingIngested { reading: SensorReading },
    /// Acquisition enriched the reading with its sensor master record.
    DataAcquired { reading: SensorReading, sensor: Sensor },
    /// Validation passed.  `clamped` marks a slightly-future timestamp that
    /// was pulled back to the wall clock.
    DataValidated {
        reading: SensorReading,
        sensor: Sensor,
        clamped: bool,
    },
    /// Validation failed; the reading does not propagate further.
    ValidationFailed {
        reading: SensorReading,
        reason_code: String,
        detail: String,
    },
    /// The anomaly model flagged a validated reading.
    AnomalyDetected {
        alert: AnomalyAlert,
        model_name: String,
        model_version: u32,
        score: f64,
    },
    /// An alert left the building (audit trail).
    NotificationDispatched {
        alert_id: Uuid,
        sensor_id: String,
        channel: String,
    },
    /// The drift detector found significant divergence.
    DriftDetected { report: DriftReport },
    /// A retrain was accepted and is about to run.
    RetrainScheduled {
        model_name: String,
        triggered_by_event_id: Uuid,
    },
    /// A `DriftDetected` event was observed but no retrain started.
    RetrainSkipped {
        model_name: String,
        reason: RetrainSkipReason,
        next_eligible_at: Option<DateTime<Utc>>,
    },
    /// A retrain attempt finished (any outcome).
    RetrainCompleted {
        model_name: String,
        outcome: RetrainOutcome,
        new_version: Option<u32>,
        error: Option<String>,
    },
    /// Operator feedback on an alert, for downstream learning subsystems.
    SystemFeedbackReceived {
        alert_id: Uuid,
        sensor_id: String,
        feedback: String,
    },
}

impl EventPayload {
    /// The subscription key for this payload.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::SensorReadingIngested { .. } => EventType::SensorReadingIngested,
            EventPayload::DataAcquired { .. } => EventType::DataAcquired,
            EventPayload::DataValidated { .. } => EventType::DataValidated,
            EventPayload::ValidationFailed { .. } => EventType::ValidationFailed,
            EventPayload::AnomalyDetected { .. } => EventType::AnomalyDetected,
            EventPayload::NotificationDispatched { .. } => EventType::NotificationDispatched,
            EventPayload::DriftDetected { .. } => EventType::DriftDetected,
            EventPayload::RetrainScheduled { .. } => EventType::RetrainScheduled,
            EventPayload::RetrainSkipped { .. } => EventType::RetrainSkipped,
            EventPayload::RetrainCompleted { .. } => EventType::RetrainCompleted,
            EventPayload::SystemFeedbackReceived { .. } => EventType::SystemFeedbackReceived,
        }
    }
}

/// Common header + payload.  The bus owns delivery state; `attempt` counts
/// delivery attempts on the copy handed to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub correlation_id: CorrelationId,
    pub occurred_at: DateTime<Utc>,
    pub attempt: u32,
    /// Publishing component, e.g. `"ingest"` or `"agent::validation"`.
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Build a first-attempt event with a fresh `event_id`, stamped now.
    pub fn new(
        source: impl Into<String>,
        correlation_id: CorrelationId,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id,
            occurred_at: Utc::now(),
            attempt: 0,
            source: source.into(),
            payload,
        }
    }

    /// Build an event whose `event_id` is chosen by the caller (the
    /// ingestion path pre-allocates the ID for its idempotency reservation).
    pub fn with_id(
        event_id: Uuid,
        source: impl Into<String>,
        correlation_id: CorrelationId,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id,
            correlation_id,
            occurred_at: Utc::now(),
            attempt: 0,
            source: source.into(),
            payload,
        }
    }

    /// The subscription key for this event.
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

//! Domain records: readings, sensors, alerts, drift reports, retrain audit
//! rows, and model-version handles.
//!
//! Readings are append-only and never mutated after ingestion.  Alerts and
//! retrain records persist for audit; everything else is ephemeral runtime
//! state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::CorrelationId;

/// Maximum accepted length of a `sensor_id`.
pub const MAX_SENSOR_ID_LEN: usize = 255;

// ─────────────────────────────────────────────────────────────────────────────
// Sensors and readings
// ─────────────────────────────────────────────────────────────────────────────

/// The physical quantity a sensor measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Vibration,
    Pressure,
    Humidity,
    Voltage,
    Audio,
    Flow,
    Current,
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SensorType::Temperature => "temperature",
            SensorType::Vibration => "vibration",
            SensorType::Pressure => "pressure",
            SensorType::Humidity => "humidity",
            SensorType::Voltage => "voltage",
            SensorType::Audio => "audio",
            SensorType::Flow => "flow",
            SensorType::Current => "current",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(SensorType::Temperature),
            "vibration" => Ok(SensorType::Vibration),
            "pressure" => Ok(SensorType::Pressure),
            "humidity" => Ok(SensorType::Humidity),
            "voltage" => Ok(SensorType::Voltage),
            "audio" => Ok(SensorType::Audio),
            "flow" => Ok(SensorType::Flow),
            "current" => Ok(SensorType::Current),
            other => Err(format!("unknown sensor type '{other}'")),
        }
    }
}

/// Operational state of a sensor master record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Active,
    Inactive,
    Maintenance,
    Decommissioned,
}

impl std::fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SensorStatus::Active => "active",
            SensorStatus::Inactive => "inactive",
            SensorStatus::Maintenance => "maintenance",
            SensorStatus::Decommissioned => "decommissioned",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SensorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SensorStatus::Active),
            "inactive" => Ok(SensorStatus::Inactive),
            "maintenance" => Ok(SensorStatus::Maintenance),
            "decommissioned" => Ok(SensorStatus::Decommissioned),
            other => Err(format!("unknown sensor status '{other}'")),
        }
    }
}

/// A sensor master record.  Readings reference it by `sensor_id`; insertion
/// of a reading requires the sensor row to exist (insert-ignore bootstrap is
/// permitted on first sight).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub status: SensorStatus,
}

/// One immutable sensor measurement.
///
/// Natural key: `(timestamp, sensor_id)`.  Created by ingestion; never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// UTC, microsecond precision.
    pub timestamp: DateTime<Utc>,
    /// Measurement quality in `[0, 1]` when the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────────────────────────

/// Triage state of an [`AnomalyAlert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
    Ignored,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertStatus::Open => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AlertStatus::Open),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            "ignored" => Ok(AlertStatus::Ignored),
            other => Err(format!("unknown alert status '{other}'")),
        }
    }
}

/// A persisted anomaly finding, produced by the anomaly-detection agent and
/// dispatched by the notification agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub id: Uuid,
    pub sensor_id: String,
    /// Classifier label, e.g. `"threshold_breach"` or `"model_score"`.
    pub kind: String,
    /// 1 (informational) ..= 5 (critical).
    pub severity: u8,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    pub description: String,
    /// Free-form supporting data (feature values, score, threshold).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommended_actions: Vec<String>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Drift
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one drift evaluation over a reference and a current window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub sensor_id: String,
    pub model_name: String,
    pub reference_count: usize,
    pub current_count: usize,
    pub ks_statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub threshold: f64,
    pub drift_detected: bool,
    pub insufficient_data: bool,
    pub evaluated_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Retraining
// ─────────────────────────────────────────────────────────────────────────────

/// Final state of one retrain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainOutcome {
    Success,
    Failure,
    Timeout,
    RejectedNoImprovement,
    Skipped,
}

impl std::fmt::Display for RetrainOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetrainOutcome::Success => "success",
            RetrainOutcome::Failure => "failure",
            RetrainOutcome::Timeout => "timeout",
            RetrainOutcome::RejectedNoImprovement => "rejected_no_improvement",
            RetrainOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RetrainOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RetrainOutcome::Success),
            "failure" => Ok(RetrainOutcome::Failure),
            "timeout" => Ok(RetrainOutcome::Timeout),
            "rejected_no_improvement" => Ok(RetrainOutcome::RejectedNoImprovement),
            "skipped" => Ok(RetrainOutcome::Skipped),
            other => Err(format!("unknown retrain outcome '{other}'")),
        }
    }
}

/// Why a `DriftDetected` event did not start a retrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainSkipReason {
    Disabled,
    InProgress,
    Cooldown,
    Capacity,
}

impl std::fmt::Display for RetrainSkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetrainSkipReason::Disabled => "disabled",
            RetrainSkipReason::InProgress => "in_progress",
            RetrainSkipReason::Cooldown => "cooldown",
            RetrainSkipReason::Capacity => "capacity",
        };
        f.write_str(s)
    }
}

/// Audit row recording one retrain attempt from trigger to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainRecord {
    pub model_name: String,
    pub triggered_by_event_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: RetrainOutcome,
    pub new_version: Option<u32>,
    pub reason_if_skipped: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Model versions
// ─────────────────────────────────────────────────────────────────────────────

/// Promotion stage of a model version in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStage {
    None,
    Staging,
    Production,
    Archived,
    /// Set when artifact integrity verification failed; the version must not
    /// be served until re-registered.
    Quarantined,
}

impl std::fmt::Display for ModelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelStage::None => "none",
            ModelStage::Staging => "staging",
            ModelStage::Production => "production",
            ModelStage::Archived => "archived",
            ModelStage::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

/// Opaque handle to one registered model version.
///
/// `feature_names` is the serving contract: the inference input vector must
/// be built in exactly this order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    /// Monotone per model name.
    pub version: u32,
    pub stage: ModelStage,
    pub feature_names: Vec<String>,
    /// Hex SHA-256 of the persisted artifact.
    pub content_hash: String,
}

//! `pulseguard-types` – shared vocabulary of the PulseGuard runtime.
//!
//! Every crate in the workspace speaks in terms of the records defined here:
//!
//! - [`correlation`] – the [`CorrelationId`] threaded through every log line
//!   and event that stems from one ingress.
//! - [`domain`] – sensor readings, sensor master records, anomaly alerts,
//!   drift reports, retrain audit records, and model-version handles.
//! - [`event`] – the closed [`Event`] union routed over the in-process bus.
//!
//! Payloads are a closed tagged union rather than loose maps so that drift
//! between publishers and subscribers is a compile error, not a silent bug.

pub mod correlation;
pub mod domain;
pub mod event;

pub use correlation::CorrelationId;
pub use domain::{
    AlertStatus, AnomalyAlert, DriftReport, ModelStage, ModelVersion, RetrainOutcome,
    RetrainRecord, RetrainSkipReason, Sensor, SensorReading, SensorStatus, SensorType,
};
pub use event::{Event, EventPayload, EventType};

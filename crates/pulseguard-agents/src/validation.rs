//! Validation agent – second hop of the Golden Path.
//!
//! Consumes `DataAcquired` and checks:
//!
//! 1. `value` is finite,
//! 2. the reading's `sensor_type` matches the registered sensor type,
//! 3. the timestamp lies within a configurable skew window of the wall
//!    clock (default ±24 h).  Timestamps up to 60 s in the future are
//!    clamped to now and marked; anything further in the future is rejected.
//!
//! On pass the agent publishes `DataValidated`; on fail it publishes
//! `ValidationFailed` with a stable reason code and the reading does not
//! propagate further.  A validation failure is handled, not retried — the
//! handler returns `Ok` either way.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use pulseguard_bus::{EventBus, HandlerError, SubscribeOptions};
use pulseguard_types::{Event, EventPayload, EventType};

use crate::agent::Agent;

const SOURCE: &str = "agent::validation";

/// Marker key added to a reading whose future timestamp was clamped.
pub const CLAMPED_FROM_KEY: &str = "clamped_from";

pub struct ValidationAgent {
    bus: EventBus,
    /// Accepted distance into the past (and, symmetric, the future beyond
    /// the clamp allowance).
    skew: ChronoDuration,
    /// Future timestamps up to this far ahead are clamped to now.
    future_clamp: ChronoDuration,
}

impl ValidationAgent {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Self::with_skew(bus, ChronoDuration::hours(24), ChronoDuration::seconds(60))
    }

    pub fn with_skew(
        bus: EventBus,
        skew: ChronoDuration,
        future_clamp: ChronoDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            skew,
            future_clamp,
        })
    }

    async fn reject(
        &self,
        event_correlation: pulseguard_types::CorrelationId,
        reading: pulseguard_types::SensorReading,
        reason_code: &str,
        detail: String,
    ) -> Result<(), HandlerError> {
        debug!(sensor_id = %reading.sensor_id, reason = %reason_code, "validation failed");
        self.bus
            .publish(Event::new(
                SOURCE,
                event_correlation,
                EventPayload::ValidationFailed {
                    reading,
                    reason_code: reason_code.to_string(),
                    detail,
                },
            ))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }
}

#[async_trait]
impl Agent for ValidationAgent {
    fn name(&self) -> &str {
        "validation"
    }

    fn subscriptions(&self) -> Vec<(EventType, SubscribeOptions)> {
        vec![(EventType::DataAcquired, SubscribeOptions::default())]
    }

    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let EventPayload::DataAcquired {
            mut reading,
            sensor,
        } = event.payload
        else {
            return Err(HandlerError::Permanent(format!(
                "unexpected payload {:?}",
                event.payload.event_type()
            )));
        };

        if !reading.value.is_finite() {
            let detail = format!("value {} is not finite", reading.value);
            return self
                .reject(event.correlation_id, reading, "value_not_finite", detail)
                .await;
        }

        if reading.sensor_type != sensor.sensor_type {
            let detail = format!(
                "reading type '{}' does not match registered type '{}'",
                reading.sensor_type, sensor.sensor_type
            );
            return self
                .reject(event.correlation_id, reading, "sensor_type_mismatch", detail)
                .await;
        }

        let now = Utc::now();
        let mut clamped = false;
        if reading.timestamp > now {
            let ahead = reading.timestamp - now;
            if ahead <= self.future_clamp {
                reading
                    .metadata
                    .insert(CLAMPED_FROM_KEY.to_string(), reading.timestamp.to_rfc3339());
                reading.timestamp = now;
                clamped = true;
            } else {
                let detail = format!("timestamp is {}s in the future", ahead.num_seconds());
                return self
                    .reject(event.correlation_id, reading, "timestamp_skew", detail)
                    .await;
            }
        } else if now - reading.timestamp > self.skew {
            let detail = format!(
                "timestamp is {}h in the past (skew window {}h)",
                (now - reading.timestamp).num_hours(),
                self.skew.num_hours()
            );
            return self
                .reject(event.correlation_id, reading, "timestamp_skew", detail)
                .await;
        }

        self.bus
            .publish(Event::new(
                SOURCE,
                event.correlation_id,
                EventPayload::DataValidated {
                    reading,
                    sensor,
                    clamped,
                },
            ))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }
}

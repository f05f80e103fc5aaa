//! Acquisition agent – first hop of the Golden Path.
//!
//! Consumes `SensorReadingIngested`, attaches the sensor master record, and
//! republishes as `DataAcquired`.  A pure function of the input plus one
//! repository lookup; no state is carried between events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use pulseguard_bus::{EventBus, HandlerError, SubscribeOptions};
use pulseguard_store::{ReadingRepository, StoreError};
use pulseguard_types::{Event, EventPayload, EventType, Sensor, SensorStatus};

use crate::agent::Agent;

/// Bus source label.
const SOURCE: &str = "agent::acquisition";

pub struct AcquisitionAgent {
    bus: EventBus,
    repo: ReadingRepository,
    /// When set, a reading for an unknown sensor bootstraps an active master
    /// record instead of dead-lettering.
    auto_register: bool,
}

impl AcquisitionAgent {
    pub fn new(bus: EventBus, repo: ReadingRepository, auto_register: bool) -> Arc<Self> {
        Arc::new(Self {
            bus,
            repo,
            auto_register,
        })
    }
}

fn map_store_err(e: StoreError) -> HandlerError {
    if e.is_transient() {
        HandlerError::Transient(e.to_string())
    } else {
        HandlerError::Permanent(e.to_string())
    }
}

#[async_trait]
impl Agent for AcquisitionAgent {
    fn name(&self) -> &str {
        "acquisition"
    }

    fn subscriptions(&self) -> Vec<(EventType, SubscribeOptions)> {
        vec![(EventType::SensorReadingIngested, SubscribeOptions::default())]
    }

    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let EventPayload::SensorReadingIngested { reading } = event.payload else {
            // Subscription is keyed by type; anything else is a wiring bug.
            return Err(HandlerError::Permanent(format!(
                "unexpected payload {:?}",
                event.payload.event_type()
            )));
        };

        let sensor = match self.repo.get_sensor(&reading.sensor_id).await {
            Ok(Some(sensor)) => sensor,
            Ok(None) if self.auto_register => {
                let bootstrap = Sensor {
                    sensor_id: reading.sensor_id.clone(),
                    sensor_type: reading.sensor_type,
                    location: None,
                    status: SensorStatus::Active,
                };
                self.repo
                    .bootstrap_sensor(bootstrap.clone())
                    .await
                    .map_err(map_store_err)?;
                debug!(sensor_id = %reading.sensor_id, "auto-registered sensor on first sight");
                bootstrap
            }
            Ok(None) => {
                return Err(HandlerError::Permanent(format!(
                    "no master record for sensor '{}'",
                    reading.sensor_id
                )));
            }
            Err(e) => return Err(map_store_err(e)),
        };

        self.bus
            .publish(Event::new(
                SOURCE,
                event.correlation_id,
                EventPayload::DataAcquired { reading, sensor },
            ))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }
}

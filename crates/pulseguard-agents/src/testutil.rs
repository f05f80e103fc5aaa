//! Shared fixtures for the agent tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pulseguard_bus::{BusConfig, EventBus, EventHandler, HandlerError, SubscribeOptions};
use pulseguard_types::{CorrelationId, Event, EventPayload, EventType, Sensor, SensorReading,
    SensorStatus, SensorType};

pub(crate) fn test_bus() -> EventBus {
    EventBus::new(BusConfig {
        queue_capacity: 64,
        publish_timeout: Duration::from_millis(200),
        grace_period: Duration::from_millis(500),
    })
}

pub(crate) fn sample_reading(sensor_id: &str, value: f64) -> SensorReading {
    SensorReading {
        sensor_id: sensor_id.to_string(),
        sensor_type: SensorType::Temperature,
        value,
        unit: Some("celsius".to_string()),
        timestamp: chrono::Utc::now(),
        quality: Some(1.0),
        metadata: BTreeMap::new(),
    }
}

pub(crate) fn active_sensor(sensor_id: &str) -> Sensor {
    Sensor {
        sensor_id: sensor_id.to_string(),
        sensor_type: SensorType::Temperature,
        location: None,
        status: SensorStatus::Active,
    }
}

pub(crate) fn ingested_event(sensor_id: &str, value: f64) -> Event {
    Event::new(
        "test",
        CorrelationId::generate(),
        EventPayload::SensorReadingIngested {
            reading: sample_reading(sensor_id, value),
        },
    )
}

pub(crate) fn acquired_event(sensor_id: &str, value: f64) -> Event {
    Event::new(
        "test",
        CorrelationId::generate(),
        EventPayload::DataAcquired {
            reading: sample_reading(sensor_id, value),
            sensor: active_sensor(sensor_id),
        },
    )
}

pub(crate) fn validated_event(sensor_id: &str, value: f64) -> Event {
    Event::new(
        "test",
        CorrelationId::generate(),
        EventPayload::DataValidated {
            reading: sample_reading(sensor_id, value),
            sensor: active_sensor(sensor_id),
            clamped: false,
        },
    )
}

/// Collects every event of one type published on the bus.
pub(crate) struct Capture {
    events: Arc<Mutex<Vec<Event>>>,
}

struct CaptureHandler {
    events: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl EventHandler for CaptureHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub(crate) fn capture(bus: &EventBus, event_type: EventType) -> Capture {
    let events = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        event_type,
        format!("capture::{event_type}"),
        Arc::new(CaptureHandler {
            events: Arc::clone(&events),
        }),
        SubscribeOptions::default(),
    );
    Capture { events }
}

impl Capture {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until at least `n` events arrived or `deadline_ms` elapsed.
    pub(crate) async fn wait_for(&self, n: usize, deadline_ms: u64) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        while self.events().len() < n && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.events()
    }
}

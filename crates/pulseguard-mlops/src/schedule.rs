//! Cron-driven drift checks.
//!
//! [`CronSchedule`] parses the classic five-field expression subset the
//! runtime needs (`*`, `*/step`, comma lists, ranges) and computes the next
//! fire time.  [`DriftScheduleAgent`] owns the timer loop: on every tick it
//! sweeps the monitored `(sensor_id, model_name)` pairs through the
//! [`DriftDetector`] under a fresh correlation ID, publishing `DriftDetected`
//! for every positive report.
//!
//! Overlap policy: when a sweep is still executing at the next tick, the
//! tick is skipped and the overlap counter increments.  Pairs within one
//! sweep run sequentially, so no pair is ever checked twice concurrently.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use pulseguard_agents::{Agent, AgentError};
use pulseguard_bus::{EventBus, HandlerError, SubscribeOptions};
use pulseguard_types::{CorrelationId, Event, EventPayload, EventType};

use crate::detector::{DriftDetector, DriftRequest};

const SOURCE: &str = "agent::drift_schedule";

// ─────────────────────────────────────────────────────────────────────────────
// Cron expression
// ─────────────────────────────────────────────────────────────────────────────

/// Malformed cron expression.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid field '{field}': {reason}")]
    Field { field: String, reason: String },
    #[error("value {value} outside range {min}..={max}")]
    Range { value: u32, min: u32, max: u32 },
}

/// One parsed field: the admitted values plus whether the source was `*`
/// (needed for the standard day-of-month / day-of-week OR rule).
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    values: BTreeSet<u32>,
    wildcard: bool,
}

impl CronField {
    fn parse(field: &str, min: u32, max: u32) -> Result<Self, CronError> {
        if field == "*" {
            return Ok(Self {
                values: (min..=max).collect(),
                wildcard: true,
            });
        }
        if let Some(step_str) = field.strip_prefix("*/") {
            let step: u32 = step_str.parse().map_err(|_| CronError::Field {
                field: field.to_string(),
                reason: "step is not a number".to_string(),
            })?;
            if step == 0 {
                return Err(CronError::Field {
                    field: field.to_string(),
                    reason: "step must be positive".to_string(),
                });
            }
            return Ok(Self {
                values: (min..=max).step_by(step as usize).collect(),
                wildcard: false,
            });
        }

        let mut values = BTreeSet::new();
        for part in field.split(',') {
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: u32 = lo.parse().map_err(|_| CronError::Field {
                    field: field.to_string(),
                    reason: format!("'{part}' range start is not a number"),
                })?;
                let hi: u32 = hi.parse().map_err(|_| CronError::Field {
                    field: field.to_string(),
                    reason: format!("'{part}' range end is not a number"),
                })?;
                for v in [lo, hi] {
                    if v < min || v > max {
                        return Err(CronError::Range { value: v, min, max });
                    }
                }
                if lo > hi {
                    return Err(CronError::Field {
                        field: field.to_string(),
                        reason: format!("'{part}' range is inverted"),
                    });
                }
                values.extend(lo..=hi);
            } else {
                let v: u32 = part.parse().map_err(|_| CronError::Field {
                    field: field.to_string(),
                    reason: format!("'{part}' is not a number"),
                })?;
                if v < min || v > max {
                    return Err(CronError::Range { value: v, min, max });
                }
                values.insert(v);
            }
        }
        Ok(Self {
            values,
            wildcard: false,
        })
    }

    fn contains(&self, v: u32) -> bool {
        self.values.contains(&v)
    }
}

/// Five-field cron expression (minute, hour, day-of-month, month,
/// day-of-week with 0 = Sunday), UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        Ok(Self {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week: CronField::parse(fields[4], 0, 6)?,
        })
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        if !self.minute.contains(t.minute())
            || !self.hour.contains(t.hour())
            || !self.month.contains(t.month())
        {
            return false;
        }
        let dom = self.day_of_month.contains(t.day());
        let dow = self.day_of_week.contains(t.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted, either matching
        // is enough; otherwise both must match (the wildcard always does).
        if !self.day_of_month.wildcard && !self.day_of_week.wildcard {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `after`.  `None` only for
    /// expressions that can never fire (e.g. February 31st).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + ChronoDuration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        // Four years bounds leap-day-only schedules.
        for _ in 0..(4 * 366 * 24 * 60) {
            if self.matches(t) {
                return Some(t);
            }
            t += ChronoDuration::minutes(1);
        }
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduled drift agent
// ─────────────────────────────────────────────────────────────────────────────

/// One `(sensor, model)` pair under drift surveillance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredPair {
    pub sensor_id: String,
    pub model_name: String,
}

/// Tuning for [`DriftScheduleAgent`].
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub schedule: CronSchedule,
    pub window_minutes: u32,
    pub p_value_threshold: f64,
    pub min_samples: usize,
}

impl ScheduleConfig {
    /// The stock "every 6 hours" schedule with detector defaults.
    pub fn every_six_hours() -> Self {
        Self {
            // The expression is a compile-time constant; parse cannot fail.
            schedule: CronSchedule::parse("0 */6 * * *")
                .unwrap_or_else(|_| unreachable!("default schedule is valid")),
            window_minutes: 360,
            p_value_threshold: DriftRequest::DEFAULT_P_VALUE_THRESHOLD,
            min_samples: DriftRequest::DEFAULT_MIN_SAMPLES,
        }
    }
}

/// Periodic driver of the drift detector.
#[derive(Clone)]
pub struct DriftScheduleAgent {
    bus: EventBus,
    detector: DriftDetector,
    config: ScheduleConfig,
    pairs: Vec<MonitoredPair>,
    sweep_in_progress: Arc<AtomicBool>,
    overlaps: Arc<AtomicU64>,
    stop_tx: watch::Sender<bool>,
}

impl DriftScheduleAgent {
    pub fn new(
        bus: EventBus,
        detector: DriftDetector,
        config: ScheduleConfig,
        pairs: Vec<MonitoredPair>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            bus,
            detector,
            config,
            pairs,
            sweep_in_progress: Arc::new(AtomicBool::new(false)),
            overlaps: Arc::new(AtomicU64::new(0)),
            stop_tx,
        })
    }

    /// Ticks skipped because the previous sweep was still running.
    pub fn overlaps(&self) -> u64 {
        self.overlaps.load(Ordering::Relaxed)
    }

    /// Run one full sweep over the monitored pairs under a fresh correlation
    /// ID.  Detector failures are logged and do not abort the sweep.
    pub async fn sweep_once(&self) -> u64 {
        let correlation_id = CorrelationId::generate();
        let mut positives = 0;
        for pair in &self.pairs {
            let request = DriftRequest {
                sensor_id: pair.sensor_id.clone(),
                model_name: pair.model_name.clone(),
                window_minutes: self.config.window_minutes,
                p_value_threshold: self.config.p_value_threshold,
                min_samples: self.config.min_samples,
                hard_cap: DriftRequest::DEFAULT_HARD_CAP,
            };
            match self.detector.check(&request, correlation_id).await {
                Ok(report) if report.drift_detected => {
                    info!(
                        sensor_id = %pair.sensor_id,
                        model = %pair.model_name,
                        p_value = report.p_value,
                        "drift detected by scheduled sweep"
                    );
                    positives += 1;
                    let event = Event::new(
                        SOURCE,
                        correlation_id,
                        EventPayload::DriftDetected { report },
                    );
                    if let Err(e) = self.bus.publish(event).await {
                        error!(error = %e, "failed to publish drift event");
                    }
                }
                Ok(report) => {
                    debug!(
                        sensor_id = %pair.sensor_id,
                        model = %pair.model_name,
                        insufficient = report.insufficient_data,
                        "no drift"
                    );
                }
                Err(e) => {
                    warn!(
                        sensor_id = %pair.sensor_id,
                        model = %pair.model_name,
                        error = %e,
                        "drift check failed"
                    );
                }
            }
        }
        positives
    }

    /// Tick entry: skip when the previous sweep is still running, otherwise
    /// launch a sweep task that releases the flag when done.
    fn on_tick(self: &Arc<Self>) {
        if self
            .sweep_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.overlaps.fetch_add(1, Ordering::Relaxed);
            warn!("drift sweep still running; skipping tick");
            return;
        }
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.sweep_once().await;
            agent.sweep_in_progress.store(false, Ordering::SeqCst);
        });
    }

    async fn timer_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            let Some(next) = self.config.schedule.next_after(Utc::now()) else {
                warn!("cron schedule can never fire; drift agent idle");
                return;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => self.on_tick(),
                result = stop_rx.wait_for(|stopped| *stopped) => {
                    if result.is_ok() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Agent for DriftScheduleAgent {
    fn name(&self) -> &str {
        "drift_schedule"
    }

    /// Timer-driven; consumes nothing from the bus.
    fn subscriptions(&self) -> Vec<(EventType, SubscribeOptions)> {
        Vec::new()
    }

    async fn start(&self) -> Result<(), AgentError> {
        // All state is behind shared handles, so the timer task can run on
        // its own clone.
        let agent = Arc::new(self.clone());
        info!(pairs = agent.pairs.len(), "drift schedule agent started");
        tokio::spawn(agent.timer_loop());
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        Err(HandlerError::Permanent(format!(
            "drift schedule agent has no subscriptions, got {:?}",
            event.event_type()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DriftDetector;
    use pulseguard_bus::{BusConfig, EventBus, EventHandler};
    use pulseguard_store::Database;
    use pulseguard_types::{Sensor, SensorReading, SensorStatus, SensorType};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    // ── CronSchedule ─────────────────────────────────────────────────────────

    #[test]
    fn every_six_hours_fires_on_the_hour() {
        let schedule = CronSchedule::parse("0 */6 * * *").unwrap();
        let next = schedule.next_after(at("2025-08-22T10:15:00Z")).unwrap();
        assert_eq!(next, at("2025-08-22T12:00:00Z"));
        let after_that = schedule.next_after(next).unwrap();
        assert_eq!(after_that, at("2025-08-22T18:00:00Z"));
    }

    #[test]
    fn midnight_rollover() {
        let schedule = CronSchedule::parse("0 */6 * * *").unwrap();
        let next = schedule.next_after(at("2025-08-22T19:00:00Z")).unwrap();
        assert_eq!(next, at("2025-08-23T00:00:00Z"));
    }

    #[test]
    fn explicit_minute_list() {
        let schedule = CronSchedule::parse("5,35 * * * *").unwrap();
        assert_eq!(
            schedule.next_after(at("2025-08-22T10:05:00Z")).unwrap(),
            at("2025-08-22T10:35:00Z")
        );
    }

    #[test]
    fn ranges_are_inclusive() {
        let schedule = CronSchedule::parse("0 9-11 * * *").unwrap();
        assert_eq!(
            schedule.next_after(at("2025-08-22T10:30:00Z")).unwrap(),
            at("2025-08-22T11:00:00Z")
        );
        assert_eq!(
            schedule.next_after(at("2025-08-22T11:30:00Z")).unwrap(),
            at("2025-08-23T09:00:00Z")
        );
    }

    #[test]
    fn day_of_week_is_respected() {
        // 2025-08-22 is a Friday; next Monday (dow 1) is the 25th.
        let schedule = CronSchedule::parse("0 8 * * 1").unwrap();
        assert_eq!(
            schedule.next_after(at("2025-08-22T10:00:00Z")).unwrap(),
            at("2025-08-25T08:00:00Z")
        );
    }

    #[test]
    fn restricted_dom_and_dow_use_or_semantics() {
        // Fire on the 1st of the month OR on Mondays.
        let schedule = CronSchedule::parse("0 0 1 * 1").unwrap();
        // From Friday the 22nd: Monday the 25th comes before September 1st.
        assert_eq!(
            schedule.next_after(at("2025-08-22T10:00:00Z")).unwrap(),
            at("2025-08-25T00:00:00Z")
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert_eq!(
            CronSchedule::parse("0 */6 * *"),
            Err(CronError::FieldCount(4))
        );
        assert!(matches!(
            CronSchedule::parse("61 * * * *"),
            Err(CronError::Range { value: 61, .. })
        ));
        assert!(matches!(
            CronSchedule::parse("*/0 * * * *"),
            Err(CronError::Field { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("banana * * * *"),
            Err(CronError::Field { .. })
        ));
    }

    // ── DriftScheduleAgent ───────────────────────────────────────────────────

    struct Capture {
        events: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, event: Event) -> Result<(), HandlerError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn test_bus() -> EventBus {
        EventBus::new(BusConfig {
            queue_capacity: 32,
            publish_timeout: std::time::Duration::from_millis(200),
            grace_period: std::time::Duration::from_millis(500),
        })
    }

    async fn drifting_repo() -> pulseguard_store::ReadingRepository {
        let db = Database::open_in_memory().unwrap();
        let repo = db.readings();
        repo.bootstrap_sensor(Sensor {
            sensor_id: "s1".to_string(),
            sensor_type: SensorType::Temperature,
            location: None,
            status: SensorStatus::Active,
        })
        .await
        .unwrap();
        let now = Utc::now();
        for i in 0..100 {
            // Reference window: around 20.  Current window: around 30.
            for (offset_min, base) in [(45, 20.0), (15, 30.0)] {
                repo.insert(&SensorReading {
                    sensor_id: "s1".to_string(),
                    sensor_type: SensorType::Temperature,
                    value: base + (i as f64) * 0.01,
                    unit: None,
                    timestamp: now - ChronoDuration::minutes(offset_min)
                        + ChronoDuration::microseconds(i),
                    quality: None,
                    metadata: BTreeMap::new(),
                })
                .await
                .unwrap();
            }
        }
        repo
    }

    fn sweep_config() -> ScheduleConfig {
        ScheduleConfig {
            schedule: CronSchedule::parse("0 */6 * * *").unwrap(),
            window_minutes: 30,
            p_value_threshold: 0.05,
            min_samples: 30,
        }
    }

    #[tokio::test]
    async fn sweep_publishes_drift_event_for_positive_pair() {
        let bus = test_bus();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::DriftDetected,
            "capture",
            Arc::new(Capture {
                events: Arc::clone(&events),
            }),
            SubscribeOptions::default(),
        );

        let repo = drifting_repo().await;
        let agent = DriftScheduleAgent::new(
            bus.clone(),
            DriftDetector::new(repo),
            sweep_config(),
            vec![MonitoredPair {
                sensor_id: "s1".to_string(),
                model_name: "anomaly-temperature".to_string(),
            }],
        );

        let positives = agent.sweep_once().await;
        assert_eq!(positives, 1);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        while events.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::DriftDetected { report } => {
                assert!(report.drift_detected);
                assert_eq!(report.model_name, "anomaly-temperature");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_stays_quiet_without_drift() {
        let bus = test_bus();
        let db = Database::open_in_memory().unwrap();
        let agent = DriftScheduleAgent::new(
            bus.clone(),
            DriftDetector::new(db.readings()),
            sweep_config(),
            vec![MonitoredPair {
                sensor_id: "s1".to_string(),
                model_name: "m1".to_string(),
            }],
        );

        // Empty repository: insufficient data, no event, no error.
        assert_eq!(agent.sweep_once().await, 0);
        assert_eq!(bus.metrics().published, 0);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_and_counted() {
        let bus = test_bus();
        let db = Database::open_in_memory().unwrap();
        let agent = DriftScheduleAgent::new(
            bus,
            DriftDetector::new(db.readings()),
            sweep_config(),
            Vec::new(),
        );

        // Simulate a sweep still in flight.
        agent.sweep_in_progress.store(true, Ordering::SeqCst);
        agent.on_tick();
        assert_eq!(agent.overlaps(), 1);

        // Once the sweep finishes, ticks run again.
        agent.sweep_in_progress.store(false, Ordering::SeqCst);
        agent.on_tick();
        assert_eq!(agent.overlaps(), 1);
    }

    #[tokio::test]
    async fn each_sweep_uses_a_fresh_correlation_id() {
        let bus = test_bus();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::DriftDetected,
            "capture",
            Arc::new(Capture {
                events: Arc::clone(&events),
            }),
            SubscribeOptions::default(),
        );
        let repo = drifting_repo().await;
        let agent = DriftScheduleAgent::new(
            bus,
            DriftDetector::new(repo),
            sweep_config(),
            vec![MonitoredPair {
                sensor_id: "s1".to_string(),
                model_name: "m1".to_string(),
            }],
        );

        agent.sweep_once().await;
        agent.sweep_once().await;

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        while events.lock().unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].correlation_id, events[1].correlation_id);
    }
}

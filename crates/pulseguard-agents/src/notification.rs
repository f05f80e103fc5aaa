//! Notification agent – last hop of the Golden Path.
//!
//! Consumes `AnomalyDetected` and dispatches through the pluggable
//! [`Notifier`] seam, with two suppression layers in front of the transport:
//!
//! 1. **Evidence dedup** – an alert whose evidence hash matches a recently
//!    *dispatched* alert (within the dedup window, default 60 s) is dropped.
//! 2. **Per-sensor rate limiting** – a keyed token bucket (default 1 alert
//!    per sensor per 5 minutes, linear replenishment).
//!
//! The alert row is persisted with status `open` *before* the first dispatch
//! attempt, so a failing transport can never lose the finding: dispatch
//! failures surface as transient handler errors, the bus retries, and after
//! exhaustion the event dead-letters while the row remains.  Retry attempts
//! bypass the rate limiter — the token was consumed by the first attempt.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::debug;

use pulseguard_bus::{EventBus, HandlerError, SubscribeOptions};
use pulseguard_store::{AlertStore, StoreError};
use pulseguard_types::{AnomalyAlert, Event, EventPayload, EventType};

use crate::agent::Agent;
use crate::notifier::Notifier;

const SOURCE: &str = "agent::notification";

/// Tuning for [`NotificationAgent`].
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Transport channel handed to the notifier.
    pub channel: String,
    /// Alerts allowed per sensor per 5-minute window.
    pub per_sensor_per_5min: u32,
    /// Evidence-hash dedup window.
    pub dedup_window: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: "ops".to_string(),
            per_sensor_per_5min: 1,
            dedup_window: Duration::from_secs(60),
        }
    }
}

pub struct NotificationAgent {
    bus: EventBus,
    alerts: AlertStore,
    notifier: Arc<dyn Notifier>,
    config: NotificationConfig,
    limiter: DefaultKeyedRateLimiter<String>,
    /// Evidence hash → time of last successful dispatch.
    recent: Mutex<HashMap<u64, Instant>>,
    suppressed_duplicates: AtomicU64,
    suppressed_rate_limited: AtomicU64,
}

impl NotificationAgent {
    pub fn new(
        bus: EventBus,
        alerts: AlertStore,
        notifier: Arc<dyn Notifier>,
        config: NotificationConfig,
    ) -> Arc<Self> {
        // A zero rate would panic inside governor; clamp like every other
        // quota in this codebase.
        let rate = config.per_sensor_per_5min.max(1);
        let period = Duration::from_secs(300).div_f64(f64::from(rate));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_minute(NonZeroU32::MIN));
        Arc::new(Self {
            bus,
            alerts,
            notifier,
            config,
            limiter: RateLimiter::keyed(quota),
            recent: Mutex::new(HashMap::new()),
            suppressed_duplicates: AtomicU64::new(0),
            suppressed_rate_limited: AtomicU64::new(0),
        })
    }

    /// Alerts dropped because an identical-evidence alert was dispatched
    /// inside the dedup window.
    pub fn suppressed_duplicates(&self) -> u64 {
        self.suppressed_duplicates.load(Ordering::Relaxed)
    }

    /// Alerts persisted but not dispatched due to the per-sensor quota.
    pub fn suppressed_rate_limited(&self) -> u64 {
        self.suppressed_rate_limited.load(Ordering::Relaxed)
    }

    fn evidence_hash(alert: &AnomalyAlert) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        alert.sensor_id.hash(&mut hasher);
        alert.kind.hash(&mut hasher);
        // BTreeMap iterates in key order, so the hash is stable.
        for (k, v) in &alert.evidence {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// True when `hash` was dispatched inside the dedup window.  Prunes
    /// expired entries as a side effect.
    fn is_recent_duplicate(&self, hash: u64) -> bool {
        let now = Instant::now();
        let window = self.config.dedup_window;
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.retain(|_, dispatched| now.duration_since(*dispatched) < window);
        recent.contains_key(&hash)
    }

    fn mark_dispatched(&self, hash: u64) {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash, Instant::now());
    }

    async fn persist_open_alert(&self, alert: &AnomalyAlert) -> Result<(), HandlerError> {
        match self.alerts.insert(alert).await {
            Ok(()) => Ok(()),
            // A bus retry re-persists; the row from the first attempt wins.
            Err(StoreError::DuplicateKey) => Ok(()),
            Err(e) if e.is_transient() => Err(HandlerError::Transient(e.to_string())),
            Err(e) => Err(HandlerError::Permanent(e.to_string())),
        }
    }
}

#[async_trait]
impl Agent for NotificationAgent {
    fn name(&self) -> &str {
        "notification"
    }

    fn subscriptions(&self) -> Vec<(EventType, SubscribeOptions)> {
        vec![(EventType::AnomalyDetected, SubscribeOptions::default())]
    }

    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let EventPayload::AnomalyDetected { alert, .. } = event.payload else {
            return Err(HandlerError::Permanent(format!(
                "unexpected payload {:?}",
                event.payload.event_type()
            )));
        };

        let hash = Self::evidence_hash(&alert);
        if self.is_recent_duplicate(hash) {
            self.suppressed_duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(sensor_id = %alert.sensor_id, "duplicate alert evidence; suppressed");
            return Ok(());
        }

        // Persist before any dispatch attempt: the finding survives a dead
        // transport.
        self.persist_open_alert(&alert).await?;

        // The first attempt consumes the sensor's token; retries ride on it.
        if event.attempt <= 1
            && self.limiter.check_key(&alert.sensor_id).is_err()
        {
            self.suppressed_rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!(sensor_id = %alert.sensor_id, "per-sensor rate limit hit; alert persisted only");
            return Ok(());
        }

        let subject = format!(
            "[pulseguard] severity-{} anomaly on sensor {}",
            alert.severity, alert.sensor_id
        );
        let mut metadata = alert.evidence.clone();
        metadata.insert("alert_id".to_string(), alert.id.to_string());
        metadata.insert("severity".to_string(), alert.severity.to_string());

        self.notifier
            .send(&self.config.channel, &subject, &alert.description, &metadata)
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        self.mark_dispatched(hash);

        self.bus
            .publish(Event::new(
                SOURCE,
                event.correlation_id,
                EventPayload::NotificationDispatched {
                    alert_id: alert.id,
                    sensor_id: alert.sensor_id,
                    channel: self.config.channel.clone(),
                },
            ))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }
}

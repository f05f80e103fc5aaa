//! Typed publish/subscribe with retry, DLQ, and correlation propagation.
//!
//! # Scheduling model
//!
//! Single process, many cooperatively scheduled handlers.  [`EventBus::publish`]
//! returns once the event is accepted into the bounded dispatch queue; a
//! dispatcher task routes each event to every subscription keyed on its
//! [`EventType`], and one worker task per subscription delivers serially —
//! so events published to the same subscriber arrive in publication order
//! when `parallelism = 1`.  Backpressure is end-to-end: a slow subscriber
//! fills its delivery channel, the dispatcher blocks, the dispatch queue
//! fills, and `publish` times out with [`BusError::QueueFull`].
//!
//! # Retry protocol
//!
//! A handler returns [`HandlerError::Transient`] to request a retry (subject
//! to `max_attempts` and exponential backoff) or [`HandlerError::Permanent`]
//! to dead-letter immediately.  The attempt counter increments on the event
//! copy delivered to that subscriber; other subscribers are unaffected.
//! Exhausted or cancelled deliveries land on the subscriber-scoped
//! [`DeadLetterQueue`] with the final error and the full correlation ID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info_span, warn, Instrument};

use pulseguard_types::{Event, EventType};

use crate::dlq::{DeadLetter, DeadLetterQueue};
use crate::BusError;

// ─────────────────────────────────────────────────────────────────────────────
// Public contract
// ─────────────────────────────────────────────────────────────────────────────

/// How a delivery attempt failed, from the bus's point of view.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// Worth retrying: network blip, timeout, dependency briefly down.
    Transient(String),
    /// Will not succeed on retry (schema mismatch, integrity violation).
    /// Goes straight to the DLQ.
    Permanent(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Transient(msg) => write!(f, "transient: {msg}"),
            HandlerError::Permanent(msg) => write!(f, "permanent: {msg}"),
        }
    }
}

/// A subscriber body.  Implementations must re-enter the correlation context
/// of the delivered event; the bus opens a span carrying `correlation_id`
/// around every invocation so `tracing` output is linked automatically.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

/// Per-subscription delivery policy.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Total delivery attempts before the event is dead-lettered.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_min: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Worker tasks for this subscription.  Values above 1 trade
    /// publication-order delivery for throughput.
    pub parallelism: usize,
    /// Whether exhausted deliveries are retained on the DLQ.
    pub dlq_on_exhaust: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(6),
            parallelism: 1,
            dlq_on_exhaust: true,
        }
    }
}

/// Bus-wide tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Dispatch-queue capacity (also each subscription's channel bound).
    pub queue_capacity: usize,
    /// How long `publish` blocks on a full queue before `QueueFull`.
    pub publish_timeout: Duration,
    /// How long `shutdown` waits for in-flight deliveries to settle.
    pub grace_period: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            publish_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(pub u64);

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    /// Exhausted deliveries discarded because `dlq_on_exhaust` was off.
    pub dropped: u64,
    pub queue_full_rejections: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internals
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Metrics {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    queue_full_rejections: AtomicU64,
}

struct Subscription {
    id: SubscriptionId,
    name: String,
    options: SubscribeOptions,
    handler: Arc<dyn EventHandler>,
}

/// Routing entry: the sender half lives only here, so removing the entry on
/// unsubscribe closes the channel and lets the workers drain out.
#[derive(Clone)]
struct Route {
    sub: Arc<Subscription>,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    queue_tx: mpsc::Sender<Event>,
    routes: RwLock<HashMap<EventType, Vec<Route>>>,
    next_id: AtomicU64,
    metrics: Metrics,
    dlq: Arc<DeadLetterQueue>,
    closing: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    /// Events admitted but not yet resolved (delivered, dead-lettered, or
    /// found subscriber-less).  Drives the shutdown drain.
    in_flight: AtomicI64,
    config: BusConfig,
}

/// The bus.  Clone freely — all clones share one dispatcher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Build the bus and spawn its dispatcher task.  Must be called from
    /// within a Tokio runtime.
    pub fn new(config: BusConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (cancel_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            queue_tx,
            routes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: Metrics::default(),
            dlq: Arc::new(DeadLetterQueue::new()),
            closing: AtomicBool::new(false),
            cancel_tx,
            in_flight: AtomicI64::new(0),
            config,
        });
        tokio::spawn(dispatch_loop(Arc::clone(&inner), queue_rx));
        Self { inner }
    }

    /// Accept `event` into the dispatch queue.
    ///
    /// # Errors
    ///
    /// [`BusError::QueueFull`] when the queue stayed full past the publish
    /// timeout; [`BusError::ShuttingDown`] once [`shutdown`](Self::shutdown)
    /// has begun.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        match self
            .inner
            .queue_tx
            .send_timeout(event, self.inner.config.publish_timeout)
            .await
        {
            Ok(()) => {
                self.inner.metrics.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.inner
                    .metrics
                    .queue_full_rejections
                    .fetch_add(1, Ordering::Relaxed);
                Err(BusError::QueueFull(self.inner.config.publish_timeout))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(BusError::ShuttingDown)
            }
        }
    }

    /// Register `handler` for `event_type` under the label `name` (used in
    /// logs and DLQ entries) and spawn its worker task(s).
    pub fn subscribe(
        &self,
        event_type: EventType,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let parallelism = options.parallelism.max(1);
        let sub = Arc::new(Subscription {
            id,
            name: name.into(),
            options,
            handler,
        });
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        self.inner
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type)
            .or_default()
            .push(Route {
                sub: Arc::clone(&sub),
                tx,
            });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..parallelism {
            tokio::spawn(worker_loop(
                Arc::clone(&self.inner),
                Arc::clone(&sub),
                Arc::clone(&rx),
            ));
        }
        debug!(subscriber = %sub.name, event_type = %event_type, id = id.0, "subscribed");
        id
    }

    /// Stop dispatching new events to `id`.  Deliveries already queued or in
    /// flight run to completion.  Returns `false` when the ID is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut routes = self.inner.routes.write().unwrap_or_else(|e| e.into_inner());
        let mut found = false;
        for entries in routes.values_mut() {
            let before = entries.len();
            entries.retain(|r| r.sub.id != id);
            found |= entries.len() < before;
        }
        found
    }

    /// Drain for the configured grace period, then cancel stragglers.
    /// Cancelled in-flight deliveries are treated as failed attempts and
    /// dead-lettered.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.inner.config.grace_period;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.inner.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "bus grace period expired with deliveries in flight");
        }
        let _ = self.inner.cancel_tx.send(true);
        // Give cancelled workers a beat to record their dead letters.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// The subscriber-scoped dead-letter queue.
    pub fn dlq(&self) -> Arc<DeadLetterQueue> {
        Arc::clone(&self.inner.dlq)
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> BusMetricsSnapshot {
        let m = &self.inner.metrics;
        BusMetricsSnapshot {
            published: m.published.load(Ordering::Relaxed),
            delivered: m.delivered.load(Ordering::Relaxed),
            handler_failures: m.handler_failures.load(Ordering::Relaxed),
            retries: m.retries.load(Ordering::Relaxed),
            dead_lettered: m.dead_lettered.load(Ordering::Relaxed),
            dropped: m.dropped.load(Ordering::Relaxed),
            queue_full_rejections: m.queue_full_rejections.load(Ordering::Relaxed),
        }
    }

    /// Whether the bus is accepting publications (readiness probe).
    pub fn is_accepting(&self) -> bool {
        !self.inner.closing.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

async fn dispatch_loop(inner: Arc<Inner>, mut queue_rx: mpsc::Receiver<Event>) {
    let mut cancel = inner.cancel_tx.subscribe();
    loop {
        let event = tokio::select! {
            e = queue_rx.recv() => match e {
                Some(e) => e,
                None => break,
            },
            _ = wait_cancelled(&mut cancel) => break,
        };

        // Snapshot matching routes; the lock is never held across an await.
        let targets: Vec<Route> = {
            let routes = inner.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.get(&event.event_type()).cloned().unwrap_or_default()
        };

        let mut routed: i64 = 0;
        for route in &targets {
            // Bounded send: a slow subscriber backpressures the whole queue.
            let send = tokio::select! {
                r = route.tx.send(event.clone()) => r.is_ok(),
                _ = wait_cancelled(&mut cancel) => false,
            };
            if send {
                routed += 1;
            }
        }
        // One admission becomes `routed` deliveries.
        inner.in_flight.fetch_add(routed - 1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

async fn worker_loop(
    inner: Arc<Inner>,
    sub: Arc<Subscription>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
) {
    let mut cancel = inner.cancel_tx.subscribe();
    loop {
        let event = {
            let mut guard = rx.lock().await;
            tokio::select! {
                e = guard.recv() => match e {
                    Some(e) => e,
                    None => break, // unsubscribed and drained
                },
                _ = wait_cancelled(&mut cancel) => break,
            }
        };
        deliver(&inner, &sub, &mut cancel, event).await;
    }
}

async fn deliver(
    inner: &Inner,
    sub: &Subscription,
    cancel: &mut watch::Receiver<bool>,
    mut event: Event,
) {
    let max_attempts = sub.options.max_attempts.max(1);
    loop {
        event.attempt += 1;
        let span = info_span!(
            "bus.deliver",
            subscriber = %sub.name,
            event_type = %event.event_type(),
            correlation_id = %event.correlation_id,
            attempt = event.attempt,
        );
        let outcome = tokio::select! {
            r = sub.handler.handle(event.clone()).instrument(span) => Some(r),
            _ = wait_cancelled(cancel) => None,
        };

        match outcome {
            Some(Ok(())) => {
                inner.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            Some(Err(HandlerError::Permanent(reason))) => {
                inner.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                finish_dead(inner, sub, event, format!("permanent: {reason}"));
                return;
            }
            Some(Err(HandlerError::Transient(reason))) => {
                inner.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                if event.attempt >= max_attempts {
                    finish_dead(
                        inner,
                        sub,
                        event,
                        format!("exhausted after {max_attempts} attempts: {reason}"),
                    );
                    return;
                }
                let delay = backoff_delay(&sub.options, event.attempt);
                inner.metrics.retries.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subscriber = %sub.name,
                    attempt = event.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "handler failed; retrying"
                );
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = wait_cancelled(cancel) => true,
                };
                if interrupted {
                    finish_dead(inner, sub, event, "delivery cancelled during shutdown".into());
                    return;
                }
            }
            None => {
                // Cancelled mid-handler: a failed attempt by contract.
                inner.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                finish_dead(inner, sub, event, "delivery cancelled during shutdown".into());
                return;
            }
        }
    }
}

fn finish_dead(inner: &Inner, sub: &Subscription, event: Event, error: String) {
    if sub.options.dlq_on_exhaust {
        warn!(
            subscriber = %sub.name,
            event_type = %event.event_type(),
            correlation_id = %event.correlation_id,
            error = %error,
            "dead-lettering event"
        );
        inner.dlq.push(DeadLetter {
            subscription_id: sub.id,
            subscriber: sub.name.clone(),
            event,
            error,
            failed_at: chrono::Utc::now(),
        });
        inner.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
    } else {
        inner.metrics.dropped.fetch_add(1, Ordering::Relaxed);
    }
    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
}

fn backoff_delay(options: &SubscribeOptions, failed_attempt: u32) -> Duration {
    let factor = 1u32 << failed_attempt.saturating_sub(1).min(16);
    options
        .backoff_min
        .saturating_mul(factor)
        .min(options.backoff_max)
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    // Closed sender means the bus is being dropped; stop waiting either way.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pulseguard_types::{CorrelationId, EventPayload, SensorReading, SensorType};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn reading_event(value: f64) -> Event {
        let reading = SensorReading {
            sensor_id: "s1".to_string(),
            sensor_type: SensorType::Temperature,
            value,
            unit: None,
            timestamp: chrono::Utc::now(),
            quality: None,
            metadata: BTreeMap::new(),
        };
        Event::new(
            "test",
            CorrelationId::generate(),
            EventPayload::SensorReadingIngested { reading },
        )
    }

    /// Records every delivered value; optionally fails the first N attempts.
    struct Recorder {
        seen: StdMutex<Vec<f64>>,
        fail_first: u32,
        failures_injected: AtomicU64,
        permanent: bool,
        delay: Duration,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                fail_first,
                failures_injected: AtomicU64::new(0),
                permanent: false,
                delay: Duration::ZERO,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn permanent_failer() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                fail_first: u32::MAX,
                failures_injected: AtomicU64::new(0),
                permanent: true,
                delay: Duration::ZERO,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                fail_first: 0,
                failures_injected: AtomicU64::new(0),
                permanent: false,
                delay,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn values(&self) -> Vec<f64> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: Event) -> Result<(), HandlerError> {
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.failures_injected.load(Ordering::SeqCst) < u64::from(self.fail_first) {
                self.failures_injected.fetch_add(1, Ordering::SeqCst);
                return if self.permanent {
                    Err(HandlerError::Permanent("bad schema".to_string()))
                } else {
                    Err(HandlerError::Transient("flaky dependency".to_string()))
                };
            }
            if let EventPayload::SensorReadingIngested { reading } = &event.payload {
                self.seen.lock().unwrap().push(reading.value);
            }
            Ok(())
        }
    }

    fn fast_options() -> SubscribeOptions {
        SubscribeOptions {
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            ..SubscribeOptions::default()
        }
    }

    fn test_bus() -> EventBus {
        EventBus::new(BusConfig {
            queue_capacity: 64,
            publish_timeout: Duration::from_millis(200),
            grace_period: Duration::from_secs(2),
        })
    }

    async fn wait_until(deadline_ms: u64, mut probe: impl FnMut() -> bool) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        while tokio::time::Instant::now() < deadline {
            if probe() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        probe()
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = test_bus();
        let recorder = Recorder::new();
        bus.subscribe(
            EventType::SensorReadingIngested,
            "recorder",
            recorder.clone(),
            fast_options(),
        );

        bus.publish(reading_event(1.0)).await.unwrap();
        assert!(wait_until(1_000, || recorder.values() == vec![1.0]).await);
        assert_eq!(bus.metrics().delivered, 1);
    }

    #[tokio::test]
    async fn delivery_preserves_publication_order() {
        let bus = test_bus();
        let recorder = Recorder::new();
        bus.subscribe(
            EventType::SensorReadingIngested,
            "recorder",
            recorder.clone(),
            fast_options(),
        );

        for i in 0..20 {
            bus.publish(reading_event(f64::from(i))).await.unwrap();
        }
        assert!(wait_until(2_000, || recorder.values().len() == 20).await);
        let expected: Vec<f64> = (0..20).map(f64::from).collect();
        assert_eq!(recorder.values(), expected);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let bus = test_bus();
        let recorder = Recorder::failing(2);
        bus.subscribe(
            EventType::SensorReadingIngested,
            "flaky",
            recorder.clone(),
            fast_options(),
        );

        bus.publish(reading_event(7.0)).await.unwrap();
        assert!(wait_until(2_000, || recorder.values() == vec![7.0]).await);

        let metrics = bus.metrics();
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.dead_lettered, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_produce_exactly_one_dead_letter() {
        let bus = test_bus();
        let recorder = Recorder::failing(u32::MAX);
        let sub_id = bus.subscribe(
            EventType::SensorReadingIngested,
            "doomed",
            recorder,
            fast_options(),
        );

        let event = reading_event(9.0);
        let correlation = event.correlation_id;
        bus.publish(event).await.unwrap();

        assert!(wait_until(2_000, || bus.dlq().len() == 1).await);
        let letters = bus.dlq().for_subscription(sub_id);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event.correlation_id, correlation);
        assert_eq!(letters[0].event.attempt, 3);
        assert!(letters[0].error.contains("exhausted after 3 attempts"));
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let bus = test_bus();
        let recorder = Recorder::permanent_failer();
        bus.subscribe(
            EventType::SensorReadingIngested,
            "strict",
            recorder,
            fast_options(),
        );

        bus.publish(reading_event(3.0)).await.unwrap();
        assert!(wait_until(1_000, || bus.dlq().len() == 1).await);

        let letters = bus.dlq().entries();
        assert_eq!(letters[0].event.attempt, 1);
        assert!(letters[0].error.contains("permanent"));
        assert_eq!(bus.metrics().retries, 0);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_healthy_one() {
        let bus = test_bus();
        let healthy = Recorder::new();
        let doomed = Recorder::failing(u32::MAX);
        bus.subscribe(
            EventType::SensorReadingIngested,
            "healthy",
            healthy.clone(),
            fast_options(),
        );
        bus.subscribe(
            EventType::SensorReadingIngested,
            "doomed",
            doomed,
            fast_options(),
        );

        bus.publish(reading_event(5.0)).await.unwrap();
        assert!(wait_until(2_000, || healthy.values() == vec![5.0]).await);
        assert!(wait_until(2_000, || bus.dlq().len() == 1).await);
        // The healthy copy was delivered exactly once.
        assert_eq!(healthy.values(), vec![5.0]);
    }

    #[tokio::test]
    async fn subscriber_only_sees_its_event_type() {
        let bus = test_bus();
        let recorder = Recorder::new();
        bus.subscribe(
            EventType::DataValidated,
            "validated-only",
            recorder.clone(),
            fast_options(),
        );

        bus.publish(reading_event(1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.values().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_stops_new_dispatch() {
        let bus = test_bus();
        let recorder = Recorder::new();
        let id = bus.subscribe(
            EventType::SensorReadingIngested,
            "recorder",
            recorder.clone(),
            fast_options(),
        );

        bus.publish(reading_event(1.0)).await.unwrap();
        assert!(wait_until(1_000, || recorder.values().len() == 1).await);

        assert!(bus.unsubscribe(id));
        bus.publish(reading_event(2.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.values(), vec![1.0]);
        // Second unsubscribe is a no-op.
        assert!(!bus.unsubscribe(id));
    }

    #[tokio::test]
    async fn slow_subscriber_backpressures_publish_to_queue_full() {
        let bus = EventBus::new(BusConfig {
            queue_capacity: 1,
            publish_timeout: Duration::from_millis(30),
            grace_period: Duration::from_millis(100),
        });
        let slow = Recorder::slow(Duration::from_millis(500));
        bus.subscribe(
            EventType::SensorReadingIngested,
            "slow",
            slow,
            fast_options(),
        );

        let mut saw_queue_full = false;
        for i in 0..10 {
            match bus.publish(reading_event(f64::from(i))).await {
                Ok(()) => {}
                Err(BusError::QueueFull(_)) => {
                    saw_queue_full = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(saw_queue_full);
        assert!(bus.metrics().queue_full_rejections >= 1);
    }

    #[tokio::test]
    async fn parallel_fanout_overlaps_deliveries() {
        let bus = test_bus();
        let slow = Recorder::slow(Duration::from_millis(50));
        bus.subscribe(
            EventType::SensorReadingIngested,
            "parallel",
            slow.clone(),
            SubscribeOptions {
                parallelism: 4,
                ..fast_options()
            },
        );

        for i in 0..8 {
            bus.publish(reading_event(f64::from(i))).await.unwrap();
        }
        assert!(wait_until(3_000, || slow.values().len() == 8).await);
        assert!(slow.max_concurrent.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_deliveries() {
        let bus = test_bus();
        let recorder = Recorder::new();
        bus.subscribe(
            EventType::SensorReadingIngested,
            "recorder",
            recorder.clone(),
            fast_options(),
        );

        for i in 0..10 {
            bus.publish(reading_event(f64::from(i))).await.unwrap();
        }
        bus.shutdown().await;
        assert_eq!(recorder.values().len(), 10);
        assert!(matches!(
            bus.publish(reading_event(99.0)).await,
            Err(BusError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn cancelled_retry_wait_is_dead_lettered() {
        let bus = EventBus::new(BusConfig {
            queue_capacity: 8,
            publish_timeout: Duration::from_millis(100),
            grace_period: Duration::from_millis(50),
        });
        let recorder = Recorder::failing(u32::MAX);
        bus.subscribe(
            EventType::SensorReadingIngested,
            "stuck",
            recorder,
            SubscribeOptions {
                // Long enough that the event is mid-backoff at shutdown.
                backoff_min: Duration::from_secs(30),
                backoff_max: Duration::from_secs(30),
                ..SubscribeOptions::default()
            },
        );

        bus.publish(reading_event(1.0)).await.unwrap();
        // Let the first attempt fail and the backoff begin.
        assert!(wait_until(1_000, || bus.metrics().handler_failures >= 1).await);

        bus.shutdown().await;
        let letters = bus.dlq().entries();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error.contains("cancelled"));
    }

    #[tokio::test]
    async fn dlq_disabled_drops_instead_of_retaining() {
        let bus = test_bus();
        let recorder = Recorder::failing(u32::MAX);
        bus.subscribe(
            EventType::SensorReadingIngested,
            "dropper",
            recorder,
            SubscribeOptions {
                dlq_on_exhaust: false,
                ..fast_options()
            },
        );

        bus.publish(reading_event(1.0)).await.unwrap();
        assert!(wait_until(2_000, || bus.metrics().dropped == 1).await);
        assert!(bus.dlq().is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let options = SubscribeOptions::default();
        assert_eq!(backoff_delay(&options, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&options, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&options, 3), Duration::from_secs(6));
        assert_eq!(backoff_delay(&options, 10), Duration::from_secs(6));
    }
}

//! Retrain agent – consumer of `DriftDetected`.
//!
//! Gate chain, in order: globally disabled → per-model already in progress →
//! cooldown since the last completed attempt → global concurrency capacity.
//! Every refusal publishes `RetrainSkipped` with its reason and writes an
//! audit row; an accepted event publishes `RetrainScheduled`, invokes the
//! trainer under a timeout, and finishes with `RetrainCompleted` carrying
//! the outcome.
//!
//! Per-model state machine: `Idle → InProgress → Idle`, where `Idle` is
//! parameterized by the last completed attempt in the audit log (which is
//! what arms the cooldown — from the end of the attempt, regardless of
//! outcome).  The in-progress set and the global in-flight counter guarantee
//! at most one concurrent retrain per model and at most `max_concurrent`
//! overall, across any interleaving of drift events.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use pulseguard_agents::{Agent, AgentError};
use pulseguard_bus::{EventBus, HandlerError, SubscribeOptions};
use pulseguard_models::{ArtifactHandle, ModelRegistry};
use pulseguard_store::RetrainLog;
use pulseguard_types::{CorrelationId, Event, EventPayload, EventType, ModelStage,
    RetrainOutcome, RetrainRecord, RetrainSkipReason};

const SOURCE: &str = "agent::retrain";

// ─────────────────────────────────────────────────────────────────────────────
// Trainer contract
// ─────────────────────────────────────────────────────────────────────────────

/// Training failure reported by the external trainer.
#[derive(Error, Debug)]
#[error("training failed: {0}")]
pub struct TrainError(pub String);

/// What a completed training run hands back.
///
/// The trainer evaluates both the candidate and the current production
/// version on its held-out validation split, so the agent can compare
/// `primary_metric` against `baseline_metric` without re-running inference.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact: ArtifactHandle,
    pub feature_names: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    /// Candidate's primary metric on the held-out set (higher is better).
    pub primary_metric: f64,
    /// Production model's metric on the same set; `None` when no production
    /// version exists yet.
    pub baseline_metric: Option<f64>,
}

/// The external model trainer.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, model_name: &str, sensor_id: &str)
        -> Result<TrainingOutcome, TrainError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

/// Policy knobs for [`RetrainAgent`].
#[derive(Debug, Clone)]
pub struct RetrainConfig {
    /// Global kill switch.
    pub enabled: bool,
    /// Minimum interval between two completed attempts for one model.
    pub cooldown: ChronoDuration,
    /// Ceiling on simultaneously running trainer invocations.
    pub max_concurrent: usize,
    /// Trainer invocation deadline; expiry is outcome `timeout`.
    pub timeout: Duration,
    /// Candidate must beat the baseline by at least this much (and strictly)
    /// to be promoted.
    pub improvement_threshold: f64,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: ChronoDuration::hours(24),
            max_concurrent: 1,
            timeout: Duration::from_secs(60 * 60),
            improvement_threshold: 0.0,
        }
    }
}

pub struct RetrainAgent {
    bus: EventBus,
    registry: Arc<dyn ModelRegistry>,
    trainer: Arc<dyn Trainer>,
    log: RetrainLog,
    config: RetrainConfig,
    in_progress: Mutex<HashSet<String>>,
    global_in_flight: Arc<AtomicUsize>,
}

impl RetrainAgent {
    pub fn new(
        bus: EventBus,
        registry: Arc<dyn ModelRegistry>,
        trainer: Arc<dyn Trainer>,
        log: RetrainLog,
        config: RetrainConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry,
            trainer,
            log,
            config,
            in_progress: Mutex::new(HashSet::new()),
            global_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Currently running trainer invocations (tests, metrics).
    pub fn in_flight(&self) -> usize {
        self.global_in_flight.load(Ordering::SeqCst)
    }

    async fn publish(&self, correlation_id: CorrelationId, payload: EventPayload) {
        if let Err(e) = self
            .bus
            .publish(Event::new(SOURCE, correlation_id, payload))
            .await
        {
            // Audit events are best-effort; losing one must not wedge the
            // per-model state machine.
            error!(error = %e, "failed to publish retrain event");
        }
    }

    async fn record(&self, record: RetrainRecord) {
        if let Err(e) = self.log.record(&record).await {
            error!(error = %e, model = %record.model_name, "failed to write retrain record");
        }
    }

    async fn skip(
        &self,
        correlation_id: CorrelationId,
        model_name: &str,
        triggered_by: Uuid,
        reason: RetrainSkipReason,
        next_eligible_at: Option<DateTime<Utc>>,
    ) {
        info!(model = %model_name, reason = %reason, "retrain skipped");
        self.publish(
            correlation_id,
            EventPayload::RetrainSkipped {
                model_name: model_name.to_string(),
                reason,
                next_eligible_at,
            },
        )
        .await;
        let now = Utc::now();
        self.record(RetrainRecord {
            model_name: model_name.to_string(),
            triggered_by_event_id: triggered_by,
            started_at: now,
            ended_at: Some(now),
            outcome: RetrainOutcome::Skipped,
            new_version: None,
            reason_if_skipped: Some(reason.to_string()),
        })
        .await;
    }

    /// Try to move `model_name` from `Idle` to `InProgress`, honoring the
    /// per-model and global limits.  Returns the refusal reason on failure.
    fn acquire(&self, model_name: &str) -> Result<(), RetrainSkipReason> {
        let mut in_progress = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());
        if in_progress.contains(model_name) {
            return Err(RetrainSkipReason::InProgress);
        }
        let max = self.config.max_concurrent.max(1);
        let acquired = self
            .global_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            });
        if acquired.is_err() {
            return Err(RetrainSkipReason::Capacity);
        }
        in_progress.insert(model_name.to_string());
        Ok(())
    }

    fn release(&self, model_name: &str) {
        self.in_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(model_name);
        self.global_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run the trainer and settle the attempt.  The caller has already
    /// acquired the in-progress slot; this always releases it.
    async fn run_attempt(
        &self,
        correlation_id: CorrelationId,
        model_name: &str,
        sensor_id: &str,
        triggered_by: Uuid,
    ) {
        let started_at = Utc::now();
        self.publish(
            correlation_id,
            EventPayload::RetrainScheduled {
                model_name: model_name.to_string(),
                triggered_by_event_id: triggered_by,
            },
        )
        .await;

        let trained =
            tokio::time::timeout(self.config.timeout, self.trainer.train(model_name, sensor_id))
                .await;

        let (outcome, new_version, error) = match trained {
            Ok(Ok(result)) => self.settle_success(model_name, result).await,
            Ok(Err(e)) => {
                warn!(model = %model_name, error = %e, "training failed");
                (RetrainOutcome::Failure, None, Some(e.to_string()))
            }
            Err(_) => {
                warn!(model = %model_name, timeout_s = self.config.timeout.as_secs(),
                    "training timed out");
                (
                    RetrainOutcome::Timeout,
                    None,
                    Some(format!(
                        "trainer exceeded {}s deadline",
                        self.config.timeout.as_secs()
                    )),
                )
            }
        };

        self.release(model_name);

        self.publish(
            correlation_id,
            EventPayload::RetrainCompleted {
                model_name: model_name.to_string(),
                outcome,
                new_version,
                error: error.clone(),
            },
        )
        .await;
        self.record(RetrainRecord {
            model_name: model_name.to_string(),
            triggered_by_event_id: triggered_by,
            started_at,
            // Cooldown arms from the end of the attempt, whatever happened.
            ended_at: Some(Utc::now()),
            outcome,
            new_version,
            reason_if_skipped: None,
        })
        .await;
    }

    /// Register and stage the candidate when it beats the baseline.
    async fn settle_success(
        &self,
        model_name: &str,
        result: TrainingOutcome,
    ) -> (RetrainOutcome, Option<u32>, Option<String>) {
        let improved = match result.baseline_metric {
            // Strict improvement, by at least the configured margin.
            Some(baseline) => {
                let delta = result.primary_metric - baseline;
                delta > 0.0 && delta >= self.config.improvement_threshold
            }
            // No production baseline: the first trained model wins.
            None => true,
        };
        if !improved {
            info!(
                model = %model_name,
                candidate = result.primary_metric,
                baseline = ?result.baseline_metric,
                "candidate did not improve on production; rejected"
            );
            return (RetrainOutcome::RejectedNoImprovement, None, None);
        }

        let content_hash = result.artifact.content_hash();
        let registered = self
            .registry
            .register(
                model_name,
                result.artifact,
                result.feature_names,
                result.metrics,
                content_hash,
            )
            .await;
        let meta = match registered {
            Ok(meta) => meta,
            Err(e) => {
                return (
                    RetrainOutcome::Failure,
                    None,
                    Some(format!("registry register: {e}")),
                );
            }
        };
        if let Err(e) = self
            .registry
            .transition(model_name, meta.version, ModelStage::Staging)
            .await
        {
            return (
                RetrainOutcome::Failure,
                Some(meta.version),
                Some(format!("registry transition: {e}")),
            );
        }
        info!(model = %model_name, version = meta.version, "candidate promoted to staging");
        (RetrainOutcome::Success, Some(meta.version), None)
    }
}

#[async_trait]
impl Agent for RetrainAgent {
    fn name(&self) -> &str {
        "retrain"
    }

    fn subscriptions(&self) -> Vec<(EventType, SubscribeOptions)> {
        vec![(EventType::DriftDetected, SubscribeOptions::default())]
    }

    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let EventPayload::DriftDetected { report } = event.payload else {
            return Err(HandlerError::Permanent(format!(
                "unexpected payload {:?}",
                event.payload.event_type()
            )));
        };
        let model_name = report.model_name.clone();
        let correlation_id = event.correlation_id;

        if !self.config.enabled {
            self.skip(
                correlation_id,
                &model_name,
                event.event_id,
                RetrainSkipReason::Disabled,
                None,
            )
            .await;
            return Ok(());
        }

        // Cooldown reads the audit log, so it survives restarts.
        match self.log.last_completed(&model_name).await {
            Ok(Some(last)) => {
                if let Some(ended_at) = last.ended_at {
                    let eligible_at = ended_at + self.config.cooldown;
                    if Utc::now() < eligible_at {
                        self.skip(
                            correlation_id,
                            &model_name,
                            event.event_id,
                            RetrainSkipReason::Cooldown,
                            Some(eligible_at),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => {
                return Err(HandlerError::Transient(e.to_string()));
            }
            Err(e) => return Err(HandlerError::Permanent(e.to_string())),
        }

        if let Err(reason) = self.acquire(&model_name) {
            self.skip(correlation_id, &model_name, event.event_id, reason, None)
                .await;
            return Ok(());
        }

        self.run_attempt(correlation_id, &model_name, &report.sensor_id, event.event_id)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulseguard_bus::{BusConfig, EventHandler};
    use pulseguard_models::InMemoryModelRegistry;
    use pulseguard_store::Database;
    use pulseguard_types::DriftReport;

    struct StubTrainer {
        delay: Duration,
        primary_metric: f64,
        baseline_metric: Option<f64>,
        fail: bool,
        invocations: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl StubTrainer {
        fn new(primary: f64, baseline: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                primary_metric: primary,
                baseline_metric: baseline,
                fail: false,
                invocations: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn slow(primary: f64, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                primary_metric: primary,
                baseline_metric: None,
                fail: false,
                invocations: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                primary_metric: 0.0,
                baseline_metric: None,
                fail: true,
                invocations: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Trainer for StubTrainer {
        async fn train(
            &self,
            _model_name: &str,
            _sensor_id: &str,
        ) -> Result<TrainingOutcome, TrainError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(TrainError("no convergence".to_string()));
            }
            Ok(TrainingOutcome {
                artifact: ArtifactHandle::band(0.0, 100.0),
                feature_names: vec!["value".to_string()],
                metrics: BTreeMap::from([("f1".to_string(), self.primary_metric)]),
                primary_metric: self.primary_metric,
                baseline_metric: self.baseline_metric,
            })
        }
    }

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

    fn capture(bus: &EventBus, event_type: EventType) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            event_type,
            format!("capture::{event_type}"),
            Arc::new(Capture {
                events: Arc::clone(&events),
            }),
            SubscribeOptions::default(),
        );
        events
    }

    async fn wait_len(events: &Arc<Mutex<Vec<Event>>>, n: usize) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while events.lock().unwrap().len() < n && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        events.lock().unwrap().clone()
    }

    fn test_bus() -> EventBus {
        EventBus::new(BusConfig {
            queue_capacity: 64,
            publish_timeout: Duration::from_millis(200),
            grace_period: Duration::from_millis(500),
        })
    }

    fn drift_event(model_name: &str) -> Event {
        Event::new(
            "test",
            CorrelationId::generate(),
            EventPayload::DriftDetected {
                report: DriftReport {
                    sensor_id: "s1".to_string(),
                    model_name: model_name.to_string(),
                    reference_count: 200,
                    current_count: 200,
                    ks_statistic: Some(0.6),
                    p_value: Some(0.001),
                    threshold: 0.05,
                    drift_detected: true,
                    insufficient_data: false,
                    evaluated_at: Utc::now(),
                    correlation_id: CorrelationId::generate(),
                },
            },
        )
    }

    fn fast_config() -> RetrainConfig {
        RetrainConfig {
            timeout: Duration::from_secs(5),
            ..RetrainConfig::default()
        }
    }

    struct Fixture {
        bus: EventBus,
        registry: Arc<InMemoryModelRegistry>,
        log: RetrainLog,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        Fixture {
            bus: test_bus(),
            registry: Arc::new(InMemoryModelRegistry::new()),
            log: db.retrain_log(),
        }
    }

    #[tokio::test]
    async fn successful_retrain_promotes_to_staging() {
        let f = fixture();
        let trainer = StubTrainer::new(0.9, Some(0.8));
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            fast_config(),
        );
        let scheduled = capture(&f.bus, EventType::RetrainScheduled);
        let completed = capture(&f.bus, EventType::RetrainCompleted);

        agent.handle(drift_event("m1")).await.unwrap();

        assert_eq!(trainer.calls(), 1);
        assert_eq!(wait_len(&scheduled, 1).await.len(), 1);
        let completed = wait_len(&completed, 1).await;
        match &completed[0].payload {
            EventPayload::RetrainCompleted {
                outcome,
                new_version,
                ..
            } => {
                assert_eq!(*outcome, RetrainOutcome::Success);
                assert_eq!(*new_version, Some(1));
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let versions = f.registry.list_versions("m1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].stage, ModelStage::Staging);

        let record = f.log.last_completed("m1").await.unwrap().unwrap();
        assert_eq!(record.outcome, RetrainOutcome::Success);
        assert_eq!(agent.in_flight(), 0);
    }

    #[tokio::test]
    async fn disabled_config_skips_without_training() {
        let f = fixture();
        let trainer = StubTrainer::new(0.9, None);
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            RetrainConfig {
                enabled: false,
                ..fast_config()
            },
        );
        let skipped = capture(&f.bus, EventType::RetrainSkipped);

        agent.handle(drift_event("m1")).await.unwrap();

        assert_eq!(trainer.calls(), 0);
        let skipped = wait_len(&skipped, 1).await;
        match &skipped[0].payload {
            EventPayload::RetrainSkipped { reason, .. } => {
                assert_eq!(*reason, RetrainSkipReason::Disabled);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_drift_event_inside_cooldown_is_skipped() {
        let f = fixture();
        let trainer = StubTrainer::new(0.9, None);
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            fast_config(),
        );
        let skipped = capture(&f.bus, EventType::RetrainSkipped);

        // First event trains; second, minutes later, hits the cooldown.
        agent.handle(drift_event("m1")).await.unwrap();
        agent.handle(drift_event("m1")).await.unwrap();

        assert_eq!(trainer.calls(), 1);
        let skipped = wait_len(&skipped, 1).await;
        match &skipped[0].payload {
            EventPayload::RetrainSkipped {
                reason,
                next_eligible_at,
                ..
            } => {
                assert_eq!(*reason, RetrainSkipReason::Cooldown);
                assert!(next_eligible_at.is_some());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn cooldown_arms_even_after_failure() {
        let f = fixture();
        let trainer = StubTrainer::failing();
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            fast_config(),
        );
        let skipped = capture(&f.bus, EventType::RetrainSkipped);

        agent.handle(drift_event("m1")).await.unwrap();
        agent.handle(drift_event("m1")).await.unwrap();

        // The failed attempt still started the cooldown clock.
        assert_eq!(trainer.calls(), 1);
        assert_eq!(wait_len(&skipped, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_events_for_same_model_train_once() {
        let f = fixture();
        let trainer = StubTrainer::slow(0.9, Duration::from_millis(200));
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            RetrainConfig {
                max_concurrent: 4,
                ..fast_config()
            },
        );

        let first = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.handle(drift_event("m1")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.handle(drift_event("m1")).await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(trainer.calls(), 1);
    }

    #[tokio::test]
    async fn global_capacity_bounds_concurrent_trainers() {
        let f = fixture();
        let trainer = StubTrainer::slow(0.9, Duration::from_millis(150));
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            RetrainConfig {
                max_concurrent: 2,
                ..fast_config()
            },
        );
        let skipped = capture(&f.bus, EventType::RetrainSkipped);

        let mut handles = Vec::new();
        for i in 0..5 {
            let agent = Arc::clone(&agent);
            let model = format!("m{i}");
            handles.push(tokio::spawn(async move {
                agent.handle(drift_event(&model)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(trainer.max_concurrent.load(Ordering::SeqCst) <= 2);
        // The overflow events were refused for capacity.
        let skipped = wait_len(&skipped, 3).await;
        assert!(skipped.iter().all(|e| matches!(
            e.payload,
            EventPayload::RetrainSkipped {
                reason: RetrainSkipReason::Capacity,
                ..
            }
        )));
        assert_eq!(agent.in_flight(), 0);
    }

    #[tokio::test]
    async fn trainer_timeout_is_reported_as_timeout_outcome() {
        let f = fixture();
        let trainer = StubTrainer::slow(0.9, Duration::from_millis(500));
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            RetrainConfig {
                timeout: Duration::from_millis(50),
                ..RetrainConfig::default()
            },
        );
        let completed = capture(&f.bus, EventType::RetrainCompleted);

        agent.handle(drift_event("m1")).await.unwrap();

        let completed = wait_len(&completed, 1).await;
        match &completed[0].payload {
            EventPayload::RetrainCompleted { outcome, error, .. } => {
                assert_eq!(*outcome, RetrainOutcome::Timeout);
                assert!(error.as_deref().unwrap().contains("deadline"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(agent.in_flight(), 0);
        let record = f.log.last_completed("m1").await.unwrap().unwrap();
        assert_eq!(record.outcome, RetrainOutcome::Timeout);
    }

    #[tokio::test]
    async fn non_improving_candidate_is_rejected() {
        let f = fixture();
        let trainer = StubTrainer::new(0.7, Some(0.8));
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            fast_config(),
        );
        let completed = capture(&f.bus, EventType::RetrainCompleted);

        agent.handle(drift_event("m1")).await.unwrap();

        let completed = wait_len(&completed, 1).await;
        match &completed[0].payload {
            EventPayload::RetrainCompleted { outcome, .. } => {
                assert_eq!(*outcome, RetrainOutcome::RejectedNoImprovement);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        // The rejected candidate was never registered.
        assert!(f.registry.list_versions("m1").await.is_err());
    }

    #[tokio::test]
    async fn equal_metric_is_not_an_improvement() {
        let f = fixture();
        let trainer = StubTrainer::new(0.8, Some(0.8));
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer.clone(),
            f.log.clone(),
            fast_config(),
        );
        let completed = capture(&f.bus, EventType::RetrainCompleted);

        agent.handle(drift_event("m1")).await.unwrap();

        let completed = wait_len(&completed, 1).await;
        assert!(matches!(
            completed[0].payload,
            EventPayload::RetrainCompleted {
                outcome: RetrainOutcome::RejectedNoImprovement,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn training_failure_records_failure_outcome() {
        let f = fixture();
        let trainer = StubTrainer::failing();
        let agent = RetrainAgent::new(
            f.bus.clone(),
            f.registry.clone(),
            trainer,
            f.log.clone(),
            fast_config(),
        );
        let completed = capture(&f.bus, EventType::RetrainCompleted);

        agent.handle(drift_event("m1")).await.unwrap();

        let completed = wait_len(&completed, 1).await;
        match &completed[0].payload {
            EventPayload::RetrainCompleted { outcome, error, .. } => {
                assert_eq!(*outcome, RetrainOutcome::Failure);
                assert!(error.as_deref().unwrap().contains("no convergence"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}

//! Anomaly-detection agent – third hop of the Golden Path.
//!
//! Consumes `DataValidated`, loads the active anomaly model for the sensor's
//! domain through the registry client (warm-cached per `(model_name,
//! version)`), builds the feature vector in the exact order dictated by the
//! model's persisted feature list, and publishes `AnomalyDetected` when the
//! score exceeds the configured threshold.  Below-threshold readings are
//! dropped silently.
//!
//! Two failure classes are fatal for the event and dead-letter it:
//!
//! - **Feature schema mismatch** – the model asks for a feature the serving
//!   path cannot build.  This is the training/serving drift tripwire.
//! - **Integrity violation** – the artifact's content hash no longer matches
//!   the registry's record.  The version is quarantined before the event is
//!   given up on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use pulseguard_bus::{EventBus, HandlerError, SubscribeOptions};
use pulseguard_models::{ModelCache, ModelError, ModelRegistry};
use pulseguard_types::{AlertStatus, AnomalyAlert, Event, EventPayload, EventType, ModelStage,
    SensorReading};

use crate::agent::Agent;

const SOURCE: &str = "agent::anomaly_detection";

/// Tuning for [`AnomalyDetectionAgent`].
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Scores strictly above this value raise an alert.
    pub score_threshold: f64,
    /// Warm-cache capacity (loaded artifacts).
    pub cache_size: usize,
    /// Model name is `{model_prefix}{sensor_type}`.
    pub model_prefix: String,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.8,
            cache_size: 8,
            model_prefix: "anomaly-".to_string(),
        }
    }
}

pub struct AnomalyDetectionAgent {
    bus: EventBus,
    registry: Arc<dyn ModelRegistry>,
    cache: ModelCache,
    config: AnomalyConfig,
    schema_mismatches: AtomicU64,
    integrity_violations: AtomicU64,
}

impl AnomalyDetectionAgent {
    pub fn new(
        bus: EventBus,
        registry: Arc<dyn ModelRegistry>,
        config: AnomalyConfig,
    ) -> Arc<Self> {
        let cache = ModelCache::new(config.cache_size);
        Arc::new(Self {
            bus,
            registry,
            cache,
            config,
            schema_mismatches: AtomicU64::new(0),
            integrity_violations: AtomicU64::new(0),
        })
    }

    /// Events dead-lettered because the model's feature schema could not be
    /// satisfied.
    pub fn schema_mismatches(&self) -> u64 {
        self.schema_mismatches.load(Ordering::Relaxed)
    }

    /// Artifact loads refused due to content-hash mismatch.
    pub fn integrity_violations(&self) -> u64 {
        self.integrity_violations.load(Ordering::Relaxed)
    }

    /// Serving-side feature vector, in the model's persisted order.
    ///
    /// Returns the offending feature name when the model asks for something
    /// this path cannot compute.
    fn build_features(
        reading: &SensorReading,
        feature_names: &[String],
    ) -> Result<Vec<f64>, String> {
        feature_names
            .iter()
            .map(|name| match name.as_str() {
                "value" => Ok(reading.value),
                "quality" => Ok(reading.quality.unwrap_or(1.0)),
                "hour_of_day" => {
                    use chrono::Timelike;
                    Ok(f64::from(reading.timestamp.hour()))
                }
                "day_of_week" => {
                    use chrono::Datelike;
                    Ok(f64::from(reading.timestamp.weekday().num_days_from_monday()))
                }
                unknown => Err(unknown.to_string()),
            })
            .collect()
    }

    fn severity_for(score: f64) -> u8 {
        // Map (threshold, 1.0] onto 1..=5.
        match score {
            s if s >= 0.95 => 5,
            s if s >= 0.9 => 4,
            s if s >= 0.85 => 3,
            s if s >= 0.8 => 2,
            _ => 1,
        }
    }
}

#[async_trait]
impl Agent for AnomalyDetectionAgent {
    fn name(&self) -> &str {
        "anomaly_detection"
    }

    fn subscriptions(&self) -> Vec<(EventType, SubscribeOptions)> {
        vec![(EventType::DataValidated, SubscribeOptions::default())]
    }

    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let EventPayload::DataValidated { reading, .. } = event.payload else {
            return Err(HandlerError::Permanent(format!(
                "unexpected payload {:?}",
                event.payload.event_type()
            )));
        };

        let model_name = format!("{}{}", self.config.model_prefix, reading.sensor_type);
        let active = match self.registry.get_active(&model_name).await {
            Ok(active) => active,
            Err(ModelError::NotFound(_)) => {
                // No model serves this domain; nothing to score.
                debug!(model = %model_name, sensor_id = %reading.sensor_id, "no active model");
                return Ok(());
            }
            Err(e) => return Err(HandlerError::Transient(e.to_string())),
        };

        let scorer = match self.cache.get(&active.name, active.version) {
            Some(scorer) => scorer,
            None => {
                // Load outside the cache lock; insert double-checks.
                match self.registry.load_artifact(&active.name, active.version).await {
                    Ok(loaded) => self.cache.insert(&active.name, active.version, loaded),
                    Err(e @ ModelError::IntegrityViolation { .. }) => {
                        self.integrity_violations.fetch_add(1, Ordering::Relaxed);
                        warn!(model = %active.name, version = active.version,
                            "artifact integrity violation; quarantining version");
                        if let Err(te) = self
                            .registry
                            .transition(&active.name, active.version, ModelStage::Quarantined)
                            .await
                        {
                            warn!(model = %active.name, error = %te, "quarantine transition failed");
                        }
                        return Err(HandlerError::Permanent(e.to_string()));
                    }
                    Err(e) => return Err(HandlerError::Transient(e.to_string())),
                }
            }
        };

        let features = match Self::build_features(&reading, &active.feature_names) {
            Ok(features) => features,
            Err(unknown) => {
                self.schema_mismatches.fetch_add(1, Ordering::Relaxed);
                return Err(HandlerError::Permanent(format!(
                    "feature schema mismatch: model '{}' v{} requires unknown feature '{}'",
                    active.name, active.version, unknown
                )));
            }
        };

        let score = scorer.score(&features);
        if score <= self.config.score_threshold {
            return Ok(());
        }

        let alert = AnomalyAlert {
            id: uuid::Uuid::new_v4(),
            sensor_id: reading.sensor_id.clone(),
            kind: "model_score".to_string(),
            severity: Self::severity_for(score),
            confidence: score.clamp(0.0, 1.0),
            description: format!(
                "{} reading {} scored {:.3} against model {} v{} (threshold {:.2})",
                reading.sensor_type,
                reading.value,
                score,
                active.name,
                active.version,
                self.config.score_threshold
            ),
            evidence: BTreeMap::from([
                ("value".to_string(), reading.value.to_string()),
                ("score".to_string(), format!("{score:.6}")),
                (
                    "threshold".to_string(),
                    self.config.score_threshold.to_string(),
                ),
                ("model".to_string(), format!("{}:{}", active.name, active.version)),
            ]),
            recommended_actions: vec![
                format!("inspect sensor {}", reading.sensor_id),
                "review recent readings for the asset".to_string(),
            ],
            status: AlertStatus::Open,
            created_at: chrono::Utc::now(),
            updated_at: None,
        };

        self.bus
            .publish(Event::new(
                SOURCE,
                event.correlation_id,
                EventPayload::AnomalyDetected {
                    alert,
                    model_name: active.name,
                    model_version: active.version,
                    score,
                },
            ))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{capture, test_bus, validated_event};
    use pulseguard_models::{ArtifactHandle, InMemoryModelRegistry};

    async fn registry_with_band_model(
        feature_names: Vec<String>,
    ) -> Arc<InMemoryModelRegistry> {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let artifact = ArtifactHandle::band(0.0, 100.0);
        let hash = artifact.content_hash();
        let meta = registry
            .register("anomaly-temperature", artifact, feature_names, BTreeMap::new(), hash)
            .await
            .unwrap();
        registry
            .transition("anomaly-temperature", meta.version, ModelStage::Production)
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn in_band_reading_is_dropped_silently() {
        let bus = test_bus();
        let registry = registry_with_band_model(vec!["value".to_string()]).await;
        let agent =
            AnomalyDetectionAgent::new(bus.clone(), registry, AnomalyConfig::default());
        let detected = capture(&bus, EventType::AnomalyDetected);

        agent.handle(validated_event("s1", 22.5)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(detected.events().is_empty());
    }

    #[tokio::test]
    async fn out_of_band_reading_raises_alert() {
        let bus = test_bus();
        let registry = registry_with_band_model(vec!["value".to_string()]).await;
        let agent =
            AnomalyDetectionAgent::new(bus.clone(), registry, AnomalyConfig::default());
        let detected = capture(&bus, EventType::AnomalyDetected);

        let event = validated_event("s1", 150.0);
        let correlation = event.correlation_id;
        agent.handle(event).await.unwrap();

        let events = detected.wait_for(1, 1_000).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, correlation);
        match &events[0].payload {
            EventPayload::AnomalyDetected { alert, score, .. } => {
                assert_eq!(alert.sensor_id, "s1");
                assert_eq!(alert.status, AlertStatus::Open);
                assert!(*score > 0.8);
                assert!(alert.severity >= 1 && alert.severity <= 5);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_model_feature_is_schema_mismatch() {
        let bus = test_bus();
        let registry =
            registry_with_band_model(vec!["value".to_string(), "voltage_rms".to_string()])
                .await;
        let agent =
            AnomalyDetectionAgent::new(bus.clone(), registry, AnomalyConfig::default());

        let err = agent.handle(validated_event("s1", 1.0)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(ref msg) if msg.contains("voltage_rms")));
        assert_eq!(agent.schema_mismatches(), 1);
    }

    #[tokio::test]
    async fn missing_model_is_a_silent_no_op() {
        let bus = test_bus();
        let registry = Arc::new(InMemoryModelRegistry::new());
        let agent =
            AnomalyDetectionAgent::new(bus.clone(), registry, AnomalyConfig::default());
        agent.handle(validated_event("s1", 150.0)).await.unwrap();
    }

    #[tokio::test]
    async fn integrity_violation_quarantines_and_dead_letters() {
        let bus = test_bus();
        let registry = Arc::new(InMemoryModelRegistry::new());
        let artifact = ArtifactHandle::band(0.0, 100.0);
        let meta = registry
            .register(
                "anomaly-temperature",
                artifact,
                vec!["value".to_string()],
                BTreeMap::new(),
                "tampered".to_string(),
            )
            .await
            .unwrap();
        registry
            .transition("anomaly-temperature", meta.version, ModelStage::Production)
            .await
            .unwrap();
        let agent = AnomalyDetectionAgent::new(
            bus.clone(),
            registry.clone(),
            AnomalyConfig::default(),
        );

        let err = agent.handle(validated_event("s1", 1.0)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
        assert_eq!(agent.integrity_violations(), 1);
        let versions = registry.list_versions("anomaly-temperature").await.unwrap();
        assert_eq!(versions[0].stage, ModelStage::Quarantined);
    }

    #[tokio::test]
    async fn artifact_is_cached_across_events() {
        let bus = test_bus();
        let registry = registry_with_band_model(vec!["value".to_string()]).await;
        let agent =
            AnomalyDetectionAgent::new(bus.clone(), registry, AnomalyConfig::default());

        agent.handle(validated_event("s1", 10.0)).await.unwrap();
        assert_eq!(agent.cache.len(), 1);
        agent.handle(validated_event("s1", 20.0)).await.unwrap();
        assert_eq!(agent.cache.len(), 1);
    }

    #[tokio::test]
    async fn feature_vector_follows_model_order() {
        let reading = crate::testutil::sample_reading("s1", 42.0);
        let features = AnomalyDetectionAgent::build_features(
            &reading,
            &["quality".to_string(), "value".to_string()],
        )
        .unwrap();
        assert_eq!(features, vec![1.0, 42.0]);
    }

    #[test]
    fn severity_scales_with_score() {
        assert_eq!(AnomalyDetectionAgent::severity_for(0.81), 2);
        assert_eq!(AnomalyDetectionAgent::severity_for(0.9), 4);
        assert_eq!(AnomalyDetectionAgent::severity_for(1.0), 5);
    }
}

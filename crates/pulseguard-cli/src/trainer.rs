//! Built-in band trainer.
//!
//! Production deployments point the retrain agent at a real training
//! service; this trainer keeps single-node installations self-contained.
//! It fits an operating band from the sensor's recent history (mean ± 4σ on
//! a training split) and scores candidate and production models on the
//! held-out tail, so the retrain agent's improvement gate compares like
//! with like.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use pulseguard_mlops::{TrainError, Trainer, TrainingOutcome};
use pulseguard_models::{ArtifactHandle, ModelError, ModelRegistry};
use pulseguard_store::ReadingRepository;

/// History window the trainer fits on.
const TRAINING_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);
/// Upper bound on fitted rows.
const SAMPLE_CAP: usize = 5_000;
/// Minimum usable history.
const MIN_SAMPLES: usize = 10;
/// Band half-width in standard deviations.
const SIGMA_FACTOR: f64 = 4.0;

pub struct BandTrainer {
    repo: ReadingRepository,
    registry: Arc<dyn ModelRegistry>,
}

impl BandTrainer {
    pub fn new(repo: ReadingRepository, registry: Arc<dyn ModelRegistry>) -> Arc<Self> {
        Arc::new(Self { repo, registry })
    }

    /// Fraction of `holdout` the production model considers normal (score
    /// 0).  `None` when no servable version exists.
    async fn baseline_coverage(&self, model_name: &str, holdout: &[f64]) -> Option<f64> {
        let active = match self.registry.get_active(model_name).await {
            Ok(active) => active,
            Err(ModelError::NotFound(_)) => return None,
            Err(_) => return None,
        };
        let scorer = self
            .registry
            .load_artifact(&active.name, active.version)
            .await
            .ok()?;
        let inliers = holdout
            .iter()
            .filter(|&&v| scorer.score(&[v]) == 0.0)
            .count();
        Some(inliers as f64 / holdout.len() as f64)
    }
}

#[async_trait]
impl Trainer for BandTrainer {
    async fn train(
        &self,
        model_name: &str,
        sensor_id: &str,
    ) -> Result<TrainingOutcome, TrainError> {
        let readings = self
            .repo
            .recent(sensor_id, TRAINING_WINDOW, SAMPLE_CAP)
            .await
            .map_err(|e| TrainError(format!("history read: {e}")))?;
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        if values.len() < MIN_SAMPLES {
            return Err(TrainError(format!(
                "only {} readings for sensor '{sensor_id}' ({MIN_SAMPLES} required)",
                values.len()
            )));
        }

        // Chronological split: fit on the head, score on the tail.
        let split = (values.len() * 4) / 5;
        let (train, holdout) = values.split_at(split.max(1).min(values.len() - 1));

        let n = train.len() as f64;
        let mean = train.iter().sum::<f64>() / n;
        let variance = train.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let sigma = variance.sqrt();
        // A dead-constant sensor still gets a non-degenerate band.
        let half_width = (SIGMA_FACTOR * sigma).max(mean.abs() * 0.01).max(1e-6);
        let (low, high) = (mean - half_width, mean + half_width);

        let artifact = ArtifactHandle::band(low, high);
        let candidate_metric = holdout
            .iter()
            .filter(|&&v| (low..=high).contains(&v))
            .count() as f64
            / holdout.len() as f64;
        let baseline_metric = self.baseline_coverage(model_name, holdout).await;

        debug!(
            model = %model_name,
            sensor_id = %sensor_id,
            low,
            high,
            candidate_metric,
            baseline = ?baseline_metric,
            "band fit complete"
        );

        Ok(TrainingOutcome {
            artifact,
            feature_names: vec!["value".to_string()],
            metrics: BTreeMap::from([
                ("holdout_coverage".to_string(), candidate_metric),
                ("band_low".to_string(), low),
                ("band_high".to_string(), high),
            ]),
            primary_metric: candidate_metric,
            baseline_metric,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use pulseguard_models::InMemoryModelRegistry;
    use pulseguard_store::Database;
    use pulseguard_types::{Sensor, SensorReading, SensorStatus, SensorType};

    async fn seeded_repo(count: usize, base: f64) -> ReadingRepository {
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
        for i in 0..count {
            repo.insert(&SensorReading {
                sensor_id: "s1".to_string(),
                sensor_type: SensorType::Temperature,
                value: base + ((i % 10) as f64) * 0.1,
                unit: None,
                timestamp: now - ChronoDuration::minutes(count as i64 - i as i64),
                quality: None,
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn fits_a_band_around_recent_history() {
        let repo = seeded_repo(100, 20.0).await;
        let trainer = BandTrainer::new(repo, Arc::new(InMemoryModelRegistry::new()));

        let outcome = trainer.train("anomaly-temperature", "s1").await.unwrap();
        assert_eq!(outcome.feature_names, vec!["value".to_string()]);
        // All values lie in [20.0, 20.9]; the holdout must be fully covered.
        assert_eq!(outcome.primary_metric, 1.0);
        assert!(outcome.baseline_metric.is_none());
        let low = outcome.metrics["band_low"];
        let high = outcome.metrics["band_high"];
        assert!(low < 20.0 && high > 20.9);
    }

    #[tokio::test]
    async fn refuses_to_fit_on_thin_history() {
        let repo = seeded_repo(3, 20.0).await;
        let trainer = BandTrainer::new(repo, Arc::new(InMemoryModelRegistry::new()));
        let err = trainer.train("anomaly-temperature", "s1").await.unwrap_err();
        assert!(err.to_string().contains("readings"));
    }

    #[tokio::test]
    async fn constant_history_yields_nondegenerate_band() {
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
        for i in 0..50i64 {
            repo.insert(&SensorReading {
                sensor_id: "s1".to_string(),
                sensor_type: SensorType::Temperature,
                value: 5.0,
                unit: None,
                timestamp: now - ChronoDuration::minutes(50 - i),
                quality: None,
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        }
        let trainer = BandTrainer::new(repo, Arc::new(InMemoryModelRegistry::new()));

        let outcome = trainer.train("anomaly-temperature", "s1").await.unwrap();
        let low = outcome.metrics["band_low"];
        let high = outcome.metrics["band_high"];
        assert!(high > low);
        assert!((low..=high).contains(&5.0));
    }

    #[tokio::test]
    async fn scores_against_the_production_baseline() {
        let repo = seeded_repo(100, 20.0).await;
        let registry = Arc::new(InMemoryModelRegistry::new());
        // Production band that misses the data entirely: baseline 0.
        let artifact = ArtifactHandle::band(100.0, 200.0);
        let hash = artifact.content_hash();
        let meta = registry
            .register(
                "anomaly-temperature",
                artifact,
                vec!["value".to_string()],
                BTreeMap::new(),
                hash,
            )
            .await
            .unwrap();
        registry
            .transition(
                "anomaly-temperature",
                meta.version,
                pulseguard_types::ModelStage::Production,
            )
            .await
            .unwrap();

        let trainer = BandTrainer::new(repo, registry);
        let outcome = trainer.train("anomaly-temperature", "s1").await.unwrap();
        assert_eq!(outcome.baseline_metric, Some(0.0));
        assert!(outcome.primary_metric > outcome.baseline_metric.unwrap());
    }
}

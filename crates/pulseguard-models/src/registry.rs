//! The registry client contract and its in-memory reference implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use pulseguard_types::{ModelStage, ModelVersion};

use crate::ModelError;

// ─────────────────────────────────────────────────────────────────────────────
// Artifacts
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque artifact payload handed to [`ModelRegistry::register`].
///
/// The runtime never inspects the bytes; only the registry's loader does.
/// [`ArtifactHandle::content_hash`] is the hex SHA-256 the caller is expected
/// to pass alongside registration, and the value verified on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub bytes: Vec<u8>,
}

impl ArtifactHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// A band scorer: readings inside `[low, high]` score 0, readings beyond
    /// the band score up to 1 proportionally to the excess.
    pub fn band(low: f64, high: f64) -> Self {
        Self::from_spec(&ScorerSpec::Band { low, high })
    }

    /// A constant scorer, useful for wiring tests (always/never flags).
    pub fn constant(score: f64) -> Self {
        Self::from_spec(&ScorerSpec::Constant { score })
    }

    fn from_spec(spec: &ScorerSpec) -> Self {
        // Serialization of a closed enum cannot fail.
        let bytes = serde_json::to_vec(spec).unwrap_or_default();
        Self { bytes }
    }

    /// Hex SHA-256 of the payload.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The inference callable produced by [`ModelRegistry::load_artifact`].
///
/// `score` takes the feature vector built in the model's persisted
/// feature-name order and returns an anomaly score; the caller compares it
/// against its configured threshold.
pub trait ArtifactScorer: Send + Sync + std::fmt::Debug {
    fn score(&self, features: &[f64]) -> f64;
}

/// Wire shape of the in-memory artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ScorerSpec {
    Band { low: f64, high: f64 },
    Constant { score: f64 },
}

#[derive(Debug)]
struct BandScorer {
    low: f64,
    high: f64,
}

impl ArtifactScorer for BandScorer {
    fn score(&self, features: &[f64]) -> f64 {
        let Some(&value) = features.first() else {
            return 0.0;
        };
        let span = (self.high - self.low).abs();
        let excess = (self.low - value).max(value - self.high).max(0.0);
        if span <= f64::EPSILON {
            return if excess > 0.0 { 1.0 } else { 0.0 };
        }
        // Full score once the excess reaches a quarter of the band width.
        (excess / (0.25 * span)).min(1.0)
    }
}

#[derive(Debug)]
struct ConstantScorer {
    score: f64,
}

impl ArtifactScorer for ConstantScorer {
    fn score(&self, _features: &[f64]) -> f64 {
        self.score
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Narrow client interface to the model registry.
///
/// The registry is the sole mutator of model stages.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// The version tagged `Production`, or the latest `Staging` when no
    /// production version exists.
    async fn get_active(&self, model_name: &str) -> Result<ModelVersion, ModelError>;

    /// All versions of a model, ascending by version number.
    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersion>, ModelError>;

    /// Register a new version (stage `None`).  `content_hash` is recorded
    /// verbatim and checked by [`load_artifact`](Self::load_artifact).
    async fn register(
        &self,
        model_name: &str,
        artifact: ArtifactHandle,
        feature_names: Vec<String>,
        metrics: BTreeMap<String, f64>,
        content_hash: String,
    ) -> Result<ModelVersion, ModelError>;

    /// Move a version to `target_stage`.  Promoting to `Production` archives
    /// the previous production version.
    async fn transition(
        &self,
        model_name: &str,
        version: u32,
        target_stage: ModelStage,
    ) -> Result<(), ModelError>;

    /// Deserialize the artifact into an inference callable.  May be slow on
    /// first call; callers cache the result.
    ///
    /// # Errors
    ///
    /// [`ModelError::IntegrityViolation`] when the stored payload no longer
    /// matches the registered `content_hash`.
    async fn load_artifact(
        &self,
        model_name: &str,
        version: u32,
    ) -> Result<Arc<dyn ArtifactScorer>, ModelError>;

    /// Cheap reachability probe for the readiness endpoint.
    async fn ping(&self) -> Result<(), ModelError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

struct StoredVersion {
    meta: ModelVersion,
    artifact: ArtifactHandle,
    #[allow(dead_code)]
    metrics: BTreeMap<String, f64>,
}

/// Reference registry for tests and single-node demo runs.
#[derive(Clone, Default)]
pub struct InMemoryModelRegistry {
    models: Arc<Mutex<HashMap<String, Vec<StoredVersion>>>>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelRegistry for InMemoryModelRegistry {
    async fn get_active(&self, model_name: &str) -> Result<ModelVersion, ModelError> {
        let models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        let versions = models
            .get(model_name)
            .ok_or_else(|| ModelError::NotFound(model_name.to_string()))?;
        let production = versions
            .iter()
            .filter(|v| v.meta.stage == ModelStage::Production)
            .max_by_key(|v| v.meta.version);
        let candidate = production.or_else(|| {
            versions
                .iter()
                .filter(|v| v.meta.stage == ModelStage::Staging)
                .max_by_key(|v| v.meta.version)
        });
        candidate
            .map(|v| v.meta.clone())
            .ok_or_else(|| ModelError::NotFound(model_name.to_string()))
    }

    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersion>, ModelError> {
        let models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        let versions = models
            .get(model_name)
            .ok_or_else(|| ModelError::NotFound(model_name.to_string()))?;
        let mut metas: Vec<ModelVersion> = versions.iter().map(|v| v.meta.clone()).collect();
        metas.sort_by_key(|m| m.version);
        Ok(metas)
    }

    async fn register(
        &self,
        model_name: &str,
        artifact: ArtifactHandle,
        feature_names: Vec<String>,
        metrics: BTreeMap<String, f64>,
        content_hash: String,
    ) -> Result<ModelVersion, ModelError> {
        let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        let versions = models.entry(model_name.to_string()).or_default();
        let next = versions.iter().map(|v| v.meta.version).max().unwrap_or(0) + 1;
        let meta = ModelVersion {
            name: model_name.to_string(),
            version: next,
            stage: ModelStage::None,
            feature_names,
            content_hash,
        };
        versions.push(StoredVersion {
            meta: meta.clone(),
            artifact,
            metrics,
        });
        info!(model = %model_name, version = next, "registered model version");
        Ok(meta)
    }

    async fn transition(
        &self,
        model_name: &str,
        version: u32,
        target_stage: ModelStage,
    ) -> Result<(), ModelError> {
        let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        let versions = models
            .get_mut(model_name)
            .ok_or_else(|| ModelError::NotFound(model_name.to_string()))?;
        if !versions.iter().any(|v| v.meta.version == version) {
            return Err(ModelError::VersionNotFound {
                name: model_name.to_string(),
                version,
            });
        }
        if target_stage == ModelStage::Production {
            for v in versions.iter_mut() {
                if v.meta.stage == ModelStage::Production {
                    v.meta.stage = ModelStage::Archived;
                }
            }
        }
        for v in versions.iter_mut() {
            if v.meta.version == version {
                v.meta.stage = target_stage;
            }
        }
        info!(model = %model_name, version, stage = %target_stage, "transitioned model stage");
        Ok(())
    }

    async fn load_artifact(
        &self,
        model_name: &str,
        version: u32,
    ) -> Result<Arc<dyn ArtifactScorer>, ModelError> {
        let (artifact, expected_hash) = {
            let models = self.models.lock().unwrap_or_else(|e| e.into_inner());
            let versions = models
                .get(model_name)
                .ok_or_else(|| ModelError::NotFound(model_name.to_string()))?;
            let stored = versions
                .iter()
                .find(|v| v.meta.version == version)
                .ok_or_else(|| ModelError::VersionNotFound {
                    name: model_name.to_string(),
                    version,
                })?;
            (stored.artifact.clone(), stored.meta.content_hash.clone())
        };

        if artifact.content_hash() != expected_hash {
            return Err(ModelError::IntegrityViolation {
                name: model_name.to_string(),
                version,
            });
        }

        let spec: ScorerSpec = serde_json::from_slice(&artifact.bytes)
            .map_err(|e| ModelError::Unavailable(format!("artifact decode: {e}")))?;
        Ok(match spec {
            ScorerSpec::Band { low, high } => {
                Arc::new(BandScorer { low, high }) as Arc<dyn ArtifactScorer>
            }
            ScorerSpec::Constant { score } => Arc::new(ConstantScorer { score }),
        })
    }

    async fn ping(&self) -> Result<(), ModelError> {
        Ok(())
    }
}

//! On-demand drift evaluation.
//!
//! Reads two adjacent windows of a sensor's values from the repository —
//! reference `[now − 2W, now − W)` and current `[now − W, now]` — and runs
//! the two-sample KS test over the `value` field.  Short windows produce an
//! `insufficient_data` report instead of a statistical verdict, and a zero
//! window length answers without touching the repository at all.

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, instrument};

use pulseguard_store::{ReadingRepository, StoreError};
use pulseguard_types::{CorrelationId, DriftReport};

use crate::stats::ks_two_sample;

/// One drift evaluation request.
#[derive(Debug, Clone)]
pub struct DriftRequest {
    pub sensor_id: String,
    pub model_name: String,
    pub window_minutes: u32,
    pub p_value_threshold: f64,
    pub min_samples: usize,
    /// Per-window row cap, bounding the sort cost.
    pub hard_cap: usize,
}

impl DriftRequest {
    pub const DEFAULT_P_VALUE_THRESHOLD: f64 = 0.05;
    pub const DEFAULT_MIN_SAMPLES: usize = 30;
    pub const DEFAULT_HARD_CAP: usize = 100_000;

    pub fn new(
        sensor_id: impl Into<String>,
        model_name: impl Into<String>,
        window_minutes: u32,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            model_name: model_name.into(),
            window_minutes,
            p_value_threshold: Self::DEFAULT_P_VALUE_THRESHOLD,
            min_samples: Self::DEFAULT_MIN_SAMPLES,
            hard_cap: Self::DEFAULT_HARD_CAP,
        }
    }
}

/// KS-based drift detector over the time-series repository.
#[derive(Clone)]
pub struct DriftDetector {
    repo: ReadingRepository,
}

impl DriftDetector {
    pub fn new(repo: ReadingRepository) -> Self {
        Self { repo }
    }

    /// Evaluate one request.  Every report carries `evaluated_at` and the
    /// caller's correlation ID.
    #[instrument(name = "drift.check", skip(self, request),
        fields(sensor_id = %request.sensor_id, model = %request.model_name,
               correlation_id = %correlation_id))]
    pub async fn check(
        &self,
        request: &DriftRequest,
        correlation_id: CorrelationId,
    ) -> Result<DriftReport, StoreError> {
        let insufficient = |reference_count: usize, current_count: usize| DriftReport {
            sensor_id: request.sensor_id.clone(),
            model_name: request.model_name.clone(),
            reference_count,
            current_count,
            ks_statistic: None,
            p_value: None,
            threshold: request.p_value_threshold,
            drift_detected: false,
            insufficient_data: true,
            evaluated_at: Utc::now(),
            correlation_id,
        };

        if request.window_minutes == 0 {
            return Ok(insufficient(0, 0));
        }

        let now = Utc::now();
        let window = ChronoDuration::minutes(i64::from(request.window_minutes));
        let reference = self
            .repo
            .values_range(
                &request.sensor_id,
                now - window - window,
                now - window,
                false,
                request.hard_cap,
            )
            .await?;
        let current = self
            .repo
            .values_range(&request.sensor_id, now - window, now, true, request.hard_cap)
            .await?;

        // An empty window must never reach the statistical test, whatever
        // `min_samples` says.
        let required = request.min_samples.max(1);
        if reference.len() < required || current.len() < required {
            debug!(
                reference = reference.len(),
                current = current.len(),
                required,
                "insufficient data for drift evaluation"
            );
            return Ok(insufficient(reference.len(), current.len()));
        }

        let Some(ks) = ks_two_sample(&reference, &current) else {
            return Ok(insufficient(reference.len(), current.len()));
        };

        Ok(DriftReport {
            sensor_id: request.sensor_id.clone(),
            model_name: request.model_name.clone(),
            reference_count: reference.len(),
            current_count: current.len(),
            ks_statistic: Some(ks.statistic),
            p_value: Some(ks.p_value),
            threshold: request.p_value_threshold,
            drift_detected: ks.p_value < request.p_value_threshold,
            insufficient_data: false,
            evaluated_at: Utc::now(),
            correlation_id,
        })
    }
}

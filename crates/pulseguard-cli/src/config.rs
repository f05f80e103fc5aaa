//! Environment-driven runtime configuration.
//!
//! Every knob is a CLI flag with an environment variable twin, so container
//! deployments configure the process purely through the environment.

use std::time::Duration;

use pulseguard_mlops::MonitoredPair;

/// Console log output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable compact lines.
    Text,
    /// Newline-delimited JSON for log aggregators.
    Json,
}

/// Configuration for the `pulseguard` runtime.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "pulseguard", about = "PulseGuard predictive-maintenance core runtime")]
pub struct Config {
    /// Host to bind the API on.
    #[arg(long, default_value = "0.0.0.0", env = "PULSEGUARD_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "PULSEGUARD_PORT")]
    pub port: u16,

    /// SQLite database path, or ":memory:" for an ephemeral demo instance
    /// (seeds the in-memory model registry with band models).
    #[arg(long, default_value = "pulseguard.db", env = "PULSEGUARD_DB")]
    pub db: String,

    /// Console log output shape.
    #[arg(long, value_enum, default_value = "text", env = "PULSEGUARD_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// OTLP collector base URL (e.g. `http://localhost:4318`).  Span export
    /// is disabled when unset.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Idempotency-key reservation TTL in seconds.
    #[arg(long, default_value_t = 600, env = "TTL_IDEMPOTENCY_SECONDS")]
    pub ttl_idempotency_seconds: u64,

    /// Event-bus dispatch-queue capacity.
    #[arg(long, default_value_t = 10_000, env = "BUS_QUEUE_CAPACITY")]
    pub bus_queue_capacity: usize,

    /// Delivery attempts per subscriber before dead-lettering.
    #[arg(long, default_value_t = 3, env = "BUS_DEFAULT_MAX_ATTEMPTS")]
    pub bus_default_max_attempts: u32,

    /// First retry delay in milliseconds.
    #[arg(long, default_value_t = 2_000, env = "BUS_BACKOFF_MIN_MS")]
    pub bus_backoff_min_ms: u64,

    /// Retry delay ceiling in milliseconds.
    #[arg(long, default_value_t = 6_000, env = "BUS_BACKOFF_MAX_MS")]
    pub bus_backoff_max_ms: u64,

    /// Cron expression driving the scheduled drift sweeps (UTC).
    #[arg(long, default_value = "0 */6 * * *", env = "DRIFT_SCHEDULE")]
    pub drift_schedule: String,

    /// p-value below which drift is declared.
    #[arg(long, default_value_t = 0.05, env = "DRIFT_P_VALUE_THRESHOLD")]
    pub drift_p_value_threshold: f64,

    /// Minimum readings per window for a statistical verdict.
    #[arg(long, default_value_t = 30, env = "DRIFT_MIN_SAMPLES")]
    pub drift_min_samples: usize,

    /// Window length (minutes) used by the scheduled drift sweeps.
    #[arg(long, default_value_t = 360, env = "DRIFT_WINDOW_MINUTES")]
    pub drift_window_minutes: u32,

    /// Monitored pairs for scheduled drift checks, as a comma-separated
    /// list of `sensor_id:model_name`.
    #[arg(long, default_value = "", env = "DRIFT_MONITORED")]
    pub drift_monitored: String,

    /// Per-API-key request budget for POST /v1/ml/check_drift.
    #[arg(long, default_value_t = 10, env = "DRIFT_RATE_PER_MINUTE")]
    pub drift_rate_per_minute: u32,

    /// Global retraining kill switch.
    #[arg(long, default_value_t = true, env = "RETRAIN_ENABLED")]
    pub retrain_enabled: bool,

    /// Minimum hours between two completed retrains of one model.
    #[arg(long, default_value_t = 24, env = "RETRAIN_COOLDOWN_HOURS")]
    pub retrain_cooldown_hours: u32,

    /// Ceiling on simultaneously running trainer invocations.
    #[arg(long, default_value_t = 1, env = "RETRAIN_MAX_CONCURRENT")]
    pub retrain_max_concurrent: usize,

    /// Trainer invocation deadline in minutes.
    #[arg(long, default_value_t = 60, env = "RETRAIN_TIMEOUT_MINUTES")]
    pub retrain_timeout_minutes: u64,

    /// Alerts allowed per sensor per 5-minute window.
    #[arg(long, default_value_t = 1, env = "NOTIFY_PER_SENSOR_RATE_PER_5MIN")]
    pub notify_per_sensor_rate_per_5min: u32,

    /// Bootstrap unknown sensors on first sight instead of rejecting.
    #[arg(long, default_value_t = true, env = "PULSEGUARD_AUTO_REGISTER_SENSORS")]
    pub auto_register_sensors: bool,

    /// Anomaly scores strictly above this value raise an alert.
    #[arg(long, default_value_t = 0.8, env = "ANOMALY_SCORE_THRESHOLD")]
    pub anomaly_score_threshold: f64,

    /// Warm model-cache capacity.
    #[arg(long, default_value_t = 8, env = "MODEL_CACHE_SIZE")]
    pub model_cache_size: usize,

    /// Sensor-reading retention horizon in days (external store policy).
    #[arg(long, default_value_t = 180, env = "READINGS_RETENTION_DAYS")]
    pub readings_retention_days: u32,

    /// Days after which the external store compresses readings.
    #[arg(long, default_value_t = 7, env = "READINGS_COMPRESS_AFTER_DAYS")]
    pub readings_compress_after_days: u32,
}

impl Config {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_idempotency_seconds)
    }

    pub fn bus_backoff_min(&self) -> Duration {
        Duration::from_millis(self.bus_backoff_min_ms)
    }

    pub fn bus_backoff_max(&self) -> Duration {
        Duration::from_millis(self.bus_backoff_max_ms)
    }

    pub fn retrain_cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.retrain_cooldown_hours))
    }

    pub fn retrain_timeout(&self) -> Duration {
        Duration::from_secs(self.retrain_timeout_minutes * 60)
    }

    pub fn in_memory_db(&self) -> bool {
        self.db == ":memory:"
    }

    /// Parse `DRIFT_MONITORED`.  Malformed entries are reported, not
    /// silently dropped.
    pub fn monitored_pairs(&self) -> Result<Vec<MonitoredPair>, String> {
        let mut pairs = Vec::new();
        for entry in self
            .drift_monitored
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let Some((sensor_id, model_name)) = entry.split_once(':') else {
                return Err(format!(
                    "DRIFT_MONITORED entry '{entry}' is not 'sensor_id:model_name'"
                ));
            };
            if sensor_id.is_empty() || model_name.is_empty() {
                return Err(format!("DRIFT_MONITORED entry '{entry}' has an empty side"));
            }
            pairs.push(MonitoredPair {
                sensor_id: sensor_id.to_string(),
                model_name: model_name.to_string(),
            });
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn defaults() -> Config {
        Config::parse_from(["pulseguard"])
    }

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = defaults();
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.ttl_idempotency_seconds, 600);
        assert_eq!(config.bus_queue_capacity, 10_000);
        assert_eq!(config.bus_default_max_attempts, 3);
        assert_eq!(config.bus_backoff_min_ms, 2_000);
        assert_eq!(config.bus_backoff_max_ms, 6_000);
        assert_eq!(config.drift_schedule, "0 */6 * * *");
        assert_eq!(config.drift_p_value_threshold, 0.05);
        assert_eq!(config.drift_min_samples, 30);
        assert_eq!(config.retrain_cooldown_hours, 24);
        assert_eq!(config.retrain_max_concurrent, 1);
        assert_eq!(config.retrain_timeout_minutes, 60);
        assert_eq!(config.notify_per_sensor_rate_per_5min, 1);
    }

    #[test]
    fn monitored_pairs_parses_a_list() {
        let mut config = defaults();
        config.drift_monitored = "s1:anomaly-temperature, s2:anomaly-vibration".to_string();
        let pairs = config.monitored_pairs().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].sensor_id, "s1");
        assert_eq!(pairs[1].model_name, "anomaly-vibration");
    }

    #[test]
    fn monitored_pairs_empty_string_is_empty() {
        assert!(defaults().monitored_pairs().unwrap().is_empty());
    }

    #[test]
    fn monitored_pairs_rejects_malformed_entries() {
        let mut config = defaults();
        config.drift_monitored = "justasensor".to_string();
        assert!(config.monitored_pairs().is_err());

        config.drift_monitored = "s1:".to_string();
        assert!(config.monitored_pairs().is_err());
    }

    #[test]
    fn duration_accessors_convert_units() {
        let config = defaults();
        assert_eq!(config.idempotency_ttl(), Duration::from_secs(600));
        assert_eq!(config.retrain_timeout(), Duration::from_secs(3_600));
        assert_eq!(config.retrain_cooldown(), chrono::Duration::hours(24));
    }

    #[test]
    fn in_memory_db_detection() {
        let mut config = defaults();
        assert!(!config.in_memory_db());
        config.db = ":memory:".to_string();
        assert!(config.in_memory_db());
    }
}

//! `pulseguard` – the runtime binary.
//!
//! Wires the whole stack from environment-driven configuration:
//!
//! 1. SQLite-backed stores (readings, alerts, retrain log, idempotency).
//! 2. The event bus.
//! 3. The Golden Path agents plus the drift-schedule and retrain agents.
//! 4. The axum API (`/v1/data/ingest`, `/v1/ml/check_drift`,
//!    `/v1/alerts/{id}/feedback`, `/health`, `/health/ready`).
//!
//! Shutdown on Ctrl-C is ordered: the HTTP server drains first, then the
//! agents stop, then the bus drains its in-flight deliveries.

mod config;
mod telemetry;
mod trainer;

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use pulseguard_agents::{
    AcquisitionAgent, AgentRegistry, AnomalyConfig, AnomalyDetectionAgent, LogNotifier,
    NotificationAgent, NotificationConfig, ValidationAgent,
};
use pulseguard_api::{router, AppState, IngestConfig, IngestService};
use pulseguard_bus::{BusConfig, EventBus, SubscribeOptions};
use pulseguard_mlops::{
    CronSchedule, DriftDetector, DriftScheduleAgent, RetrainAgent, RetrainConfig, ScheduleConfig,
};
use pulseguard_models::{ArtifactHandle, InMemoryModelRegistry, ModelRegistry};
use pulseguard_store::{Database, IdempotencyStore, MemoryIdempotencyStore, RetentionPolicy};
use pulseguard_types::{ModelStage, SensorType};

use crate::config::Config;

fn main() {
    let config = Config::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("[pulseguard] failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    let telemetry = telemetry::Telemetry::install(&config);
    let result = runtime.block_on(run(config));
    if let Err(e) = &result {
        error!(error = %e, "fatal error");
    }
    // Flush the span pipeline before the exit path skips destructors.
    telemetry.shutdown();
    if result.is_err() {
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    info!(db = %config.db, port = config.port, "starting pulseguard runtime");

    // ── Stores ────────────────────────────────────────────────────────────
    let db = if config.in_memory_db() {
        Database::open_in_memory()?
    } else {
        Database::open(&config.db)?
    };

    // Multi-replica deployments share the SQLite-backed reservation table;
    // a single ephemeral node keeps reservations in memory.
    let idempotency: Arc<dyn IdempotencyStore> = if config.in_memory_db() {
        Arc::new(MemoryIdempotencyStore::new())
    } else {
        let store = db.idempotency();
        // Hourly reclaim of expired reservations.  Reservation correctness
        // never depends on this running.
        let sweeper = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3_600));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = sweeper.sweep().await {
                    warn!(error = %e, "idempotency sweep failed");
                }
            }
        });
        Arc::new(store)
    };

    // Daily retention sweep; compression itself belongs to the external
    // store, the horizon is enforced here.
    {
        let repo = db.readings();
        let policy = RetentionPolicy {
            retention_days: config.readings_retention_days,
            compress_after_days: config.readings_compress_after_days,
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 3_600));
            loop {
                interval.tick().await;
                match repo.apply_retention(policy).await {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "retention sweep removed expired readings");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
            }
        });
    }

    // ── Bus ───────────────────────────────────────────────────────────────
    let bus = EventBus::new(BusConfig {
        queue_capacity: config.bus_queue_capacity,
        publish_timeout: Duration::from_secs(2),
        grace_period: Duration::from_secs(10),
    });

    // ── Model registry ────────────────────────────────────────────────────
    let models = Arc::new(InMemoryModelRegistry::new());
    if config.in_memory_db() {
        seed_demo_models(&models).await?;
        info!("demo model registry seeded (in-memory run)");
    }
    let models: Arc<dyn ModelRegistry> = models;

    // ── API surface ───────────────────────────────────────────────────────
    let ingest = IngestService::new(
        db.readings(),
        Arc::clone(&idempotency),
        bus.clone(),
        IngestConfig {
            idempotency_ttl: config.idempotency_ttl(),
            auto_register_sensors: config.auto_register_sensors,
            ..IngestConfig::default()
        },
    );
    let detector = DriftDetector::new(db.readings());
    let state = AppState::new(
        ingest,
        detector.clone(),
        db.alerts(),
        bus.clone(),
        db.clone(),
        Arc::clone(&models),
        config.drift_rate_per_minute,
    );
    let app = router(state);

    // ── Agents ────────────────────────────────────────────────────────────
    let registry = AgentRegistry::new(bus.clone()).with_delivery_defaults(SubscribeOptions {
        max_attempts: config.bus_default_max_attempts,
        backoff_min: config.bus_backoff_min(),
        backoff_max: config.bus_backoff_max(),
        ..SubscribeOptions::default()
    });
    registry.register(AcquisitionAgent::new(
        bus.clone(),
        db.readings(),
        config.auto_register_sensors,
    ))?;
    registry.register(ValidationAgent::new(bus.clone()))?;
    registry.register(AnomalyDetectionAgent::new(
        bus.clone(),
        Arc::clone(&models),
        AnomalyConfig {
            score_threshold: config.anomaly_score_threshold,
            cache_size: config.model_cache_size,
            ..AnomalyConfig::default()
        },
    ))?;
    registry.register(NotificationAgent::new(
        bus.clone(),
        db.alerts(),
        Arc::new(LogNotifier::new()),
        NotificationConfig {
            per_sensor_per_5min: config.notify_per_sensor_rate_per_5min,
            ..NotificationConfig::default()
        },
    ))?;

    let schedule = CronSchedule::parse(&config.drift_schedule)?;
    let pairs = config.monitored_pairs()?;
    if pairs.is_empty() {
        info!("DRIFT_MONITORED is empty; scheduled sweeps will be no-ops");
    }
    registry.register(DriftScheduleAgent::new(
        bus.clone(),
        detector,
        ScheduleConfig {
            schedule,
            window_minutes: config.drift_window_minutes,
            p_value_threshold: config.drift_p_value_threshold,
            min_samples: config.drift_min_samples,
        },
        pairs,
    ))?;
    registry.register(RetrainAgent::new(
        bus.clone(),
        Arc::clone(&models),
        trainer::BandTrainer::new(db.readings(), Arc::clone(&models)),
        db.retrain_log(),
        RetrainConfig {
            enabled: config.retrain_enabled,
            cooldown: config.retrain_cooldown(),
            max_concurrent: config.retrain_max_concurrent,
            timeout: config.retrain_timeout(),
            improvement_threshold: 0.0,
        },
    ))?;

    registry.start_all().await?;

    // ── Serve ─────────────────────────────────────────────────────────────
    let listener =
        tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(host = %config.host, port = config.port, "API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Ordered shutdown ──────────────────────────────────────────────────
    info!("HTTP drained; stopping agents");
    registry.stop_all().await;
    bus.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl-C handler");
        return;
    }
    info!("Ctrl-C received; beginning graceful shutdown");
}

/// Seed band models for the common sensor domains so an in-memory demo run
/// exercises the full Golden Path out of the box.
async fn seed_demo_models(models: &InMemoryModelRegistry) -> Result<(), Box<dyn Error>> {
    let bands = [
        (SensorType::Temperature, -20.0, 100.0),
        (SensorType::Vibration, 0.0, 5.0),
        (SensorType::Pressure, 0.0, 10.0),
        (SensorType::Voltage, 0.0, 480.0),
    ];
    for (sensor_type, low, high) in bands {
        let name = format!("anomaly-{sensor_type}");
        let artifact = ArtifactHandle::band(low, high);
        let hash = artifact.content_hash();
        let meta = models
            .register(
                &name,
                artifact,
                vec!["value".to_string()],
                BTreeMap::new(),
                hash,
            )
            .await?;
        models
            .transition(&name, meta.version, ModelStage::Production)
            .await?;
    }
    Ok(())
}

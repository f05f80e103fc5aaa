//! `pulseguard-mlops` – the model lifecycle control loop.
//!
//! - [`stats`] – two-sample Kolmogorov–Smirnov test.
//! - [`detector`] – on-demand drift evaluation over two repository windows.
//! - [`schedule`] – cron-driven periodic drift checks across monitored
//!   `(sensor, model)` pairs, with overlap skipping.
//! - [`retrain`] – the drift-event consumer that retrains under cooldown and
//!   concurrency policies and promotes improved models to staging.

pub mod detector;
pub mod retrain;
pub mod schedule;
pub mod stats;

pub use detector::{DriftDetector, DriftRequest};
pub use retrain::{RetrainAgent, RetrainConfig, Trainer, TrainError, TrainingOutcome};
pub use schedule::{CronError, CronSchedule, DriftScheduleAgent, MonitoredPair, ScheduleConfig};
pub use stats::{ks_two_sample, KsResult};

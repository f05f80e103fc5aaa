//! `pulseguard-agents` – the analytical agents and their lifecycle.
//!
//! - [`agent`] – the [`Agent`] capability trait and health bookkeeping.
//! - [`registry`] – [`AgentRegistry`]: registration, bus wiring, orchestrated
//!   start/stop with rollback, and the health report.
//! - The Golden Path four: [`acquisition`], [`validation`], [`anomaly`],
//!   [`notification`] – ingestion → enrichment → validation → anomaly
//!   detection → notification, each a bus subscriber.
//! - [`notifier`] – the pluggable outbound transport seam.
//!
//! Agents hold no cross-event state beyond their own cooldown or dedup
//! bookkeeping; everything durable lives behind `pulseguard-store`.

pub mod acquisition;
pub mod agent;
pub mod anomaly;
pub mod notification;
pub mod notifier;
pub mod registry;
pub mod validation;

#[cfg(test)]
pub(crate) mod testutil;

pub use acquisition::AcquisitionAgent;
pub use agent::{Agent, AgentHealth, AgentStatus};
pub use anomaly::{AnomalyConfig, AnomalyDetectionAgent};
pub use notification::{NotificationAgent, NotificationConfig};
pub use notifier::{LogNotifier, Notifier, NotifyError};
pub use registry::AgentRegistry;
pub use validation::ValidationAgent;

use thiserror::Error;

/// Lifecycle and wiring failures.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The registered-agent set is fixed once `start_all` has returned.
    #[error("agent registration is closed after start_all")]
    RegistrationClosed,

    /// An agent refused to start; startup was rolled back.
    #[error("agent '{name}' failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    /// An agent failed to stop cleanly.
    #[error("agent '{name}' failed to stop: {reason}")]
    StopFailed { name: String, reason: String },
}

//! The agent capability trait and per-agent health bookkeeping.
//!
//! Agents are polymorphic over `{start, stop, subscriptions, handle}`; the
//! registry wires `subscriptions()` to the bus and tracks health from the
//! outcome of every delivered event, so agent implementations stay free of
//! monitoring concerns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use pulseguard_bus::{HandlerError, SubscribeOptions};
use pulseguard_types::{Event, EventType};

use crate::AgentError;

/// Reported condition of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Started and the most recent delivery succeeded (or none arrived yet).
    Healthy,
    /// Started but the most recent delivery failed.
    Degraded,
    /// Not started, or stopped.
    Down,
}

/// Health snapshot for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub status: AgentStatus,
    pub last_error: Option<String>,
    pub last_successful_event_at: Option<DateTime<Utc>>,
}

/// A long-lived analytical worker driven by bus subscriptions.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable name, used as the bus subscriber label and the health-map key.
    fn name(&self) -> &str;

    /// Which event types this agent consumes, with per-subscription policy.
    fn subscriptions(&self) -> Vec<(EventType, SubscribeOptions)>;

    /// Bring up any internal resources.  Most pipeline agents are stateless
    /// and default to a no-op.
    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Release internal resources / stop background loops.
    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Process one delivered event.  Returning
    /// [`HandlerError::Transient`] requests a bus retry;
    /// [`HandlerError::Permanent`] dead-letters the copy immediately.
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

/// Mutable health bookkeeping, owned by the registry, written by the bus
/// handler adapter around every delivery.
#[derive(Default)]
pub(crate) struct HealthState {
    started: AtomicBool,
    last_delivery_failed: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl HealthState {
    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    pub(crate) fn record_success(&self) {
        self.last_delivery_failed.store(false, Ordering::SeqCst);
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    pub(crate) fn record_failure(&self, error: &HandlerError) {
        self.last_delivery_failed.store(true, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
    }

    pub(crate) fn snapshot(&self) -> AgentHealth {
        let status = if !self.started.load(Ordering::SeqCst) {
            AgentStatus::Down
        } else if self.last_delivery_failed.load(Ordering::SeqCst) {
            AgentStatus::Degraded
        } else {
            AgentStatus::Healthy
        };
        AgentHealth {
            status,
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            last_successful_event_at: *self
                .last_success
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }
}

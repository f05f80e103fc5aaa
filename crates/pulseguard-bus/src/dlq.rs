//! Subscriber-scoped dead-letter queue.
//!
//! When a delivery exhausts its retry budget (or fails permanently, or is
//! cancelled during shutdown), the event copy lands here together with the
//! failure reason and the full correlation ID, so an operator can pinpoint
//! the precise step of loss and replay by hand if needed.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use pulseguard_types::Event;

use crate::bus::SubscriptionId;

/// One dead-lettered delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub subscription_id: SubscriptionId,
    /// Human-readable subscriber label (agent name).
    pub subscriber: String,
    /// The per-subscriber event copy, `attempt` counting the failed tries.
    pub event: Event,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// The wire dump used when a dead letter is persisted or exported.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": format!("dead letter serialization failed: {e}") })
        })
    }
}

/// Process-wide holding area, scoped per subscriber via the entries'
/// [`SubscriptionId`].
#[derive(Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, letter: DeadLetter) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter);
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Entries for one subscriber.
    pub fn for_subscription(&self, id: SubscriptionId) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| l.subscription_id == id)
            .cloned()
            .collect()
    }

    /// Remove and return everything (operator replay).
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Correlation identifiers.
//!
//! A [`CorrelationId`] ties together every log line, outbound event, and
//! downstream agent invocation that stems from one logical operation
//! (typically one ingestion request or one scheduled drift run).
//!
//! Propagation is always **explicit**: the ID rides on the [`Event`] header
//! and is a parameter of every orchestrator entry point.  When work is handed
//! off to another task the ID is captured at dispatch time and re-entered as
//! a tracing span field at the receiving end.  There are no thread-locals and
//! no implicit propagation across process boundaries.
//!
//! [`Event`]: crate::event::Event

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request/workflow identifier carried across sync and async boundaries.
///
/// Absence never fails: callers that have no inbound ID call
/// [`CorrelationId::generate`] and continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Mint a fresh UUIDv4 correlation ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an inbound header value, falling back to a generated ID when
    /// the value is absent or not a UUID.
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(Self)
            .unwrap_or_else(Self::generate)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_yields_distinct_ids() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn from_header_parses_valid_uuid() {
        let id = Uuid::new_v4();
        let parsed = CorrelationId::from_header(Some(&id.to_string()));
        assert_eq!(parsed.as_uuid(), id);
    }

    #[test]
    fn from_header_generates_on_missing_value() {
        // Must never fail – a missing header yields a fresh ID.
        let a = CorrelationId::from_header(None);
        let b = CorrelationId::from_header(None);
        assert_ne!(a, b);
    }

    #[test]
    fn from_header_generates_on_garbage() {
        let id = CorrelationId::from_header(Some("not-a-uuid"));
        // Parsing failed, but we still got a usable ID.
        assert_ne!(id.as_uuid(), Uuid::nil());
    }

    #[test]
    fn serde_is_transparent() {
        let id = CorrelationId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

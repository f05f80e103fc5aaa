//! Pluggable outbound notification transport.
//!
//! The runtime never speaks to e-mail, Slack, or pagers directly.  It calls
//! [`Notifier::send`]; adapters translate into the specific protocol of the
//! outside world.  [`LogNotifier`] is the built-in adapter that writes the
//! notification to the structured log, which is enough for demo runs and
//! tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Dispatch failure.  The bus's retry policy applies; once the budget is
/// exhausted the event dead-letters while the alert row stays persisted.
#[derive(Error, Debug)]
#[error("notification dispatch failed: {0}")]
pub struct NotifyError(pub String);

/// Every outbound transport adapter implements this.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        subject: &str,
        body: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), NotifyError>;
}

/// Transport that writes notifications to the structured log.
#[derive(Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        channel: &str,
        subject: &str,
        body: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), NotifyError> {
        info!(
            channel = %channel,
            subject = %subject,
            body = %body,
            metadata = %serde_json::to_string(metadata).unwrap_or_default(),
            "notification dispatched"
        );
        Ok(())
    }
}

//! `pulseguard-bus` – the nervous system of the runtime.
//!
//! An in-process, typed, retrying publish/subscribe bus:
//!
//! - [`bus`] – bounded dispatch queue, per-subscriber worker tasks, retry
//!   with exponential backoff, Transient/Permanent failure classification,
//!   publication-order delivery at `parallelism = 1`, graceful drain.
//! - [`dlq`] – subscriber-scoped dead-letter queue holding the event copy,
//!   the final error, and the originating correlation ID.
//!
//! Events are in-process values: there is no durable cross-process delivery
//! and no exactly-once guarantee.  At-least-once plus idempotent consumers
//! is the contract.

pub mod bus;
pub mod dlq;

pub use bus::{BusConfig, BusMetricsSnapshot, EventBus, EventHandler, HandlerError,
    SubscribeOptions, SubscriptionId};
pub use dlq::{DeadLetter, DeadLetterQueue};

use thiserror::Error;

/// Errors surfaced to publishers.
#[derive(Error, Debug)]
pub enum BusError {
    /// The dispatch queue stayed full past the publish timeout.  The caller
    /// should shed load (the ingestion endpoint maps this to 503).
    #[error("dispatch queue full after {0:?}")]
    QueueFull(std::time::Duration),

    /// The bus is draining; no new events are accepted.
    #[error("bus is shutting down")]
    ShuttingDown,
}

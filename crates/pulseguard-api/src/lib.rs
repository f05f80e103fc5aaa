//! `pulseguard-api` – the write entry point and its HTTP adapters.
//!
//! [`ingest`] holds the ingestion orchestrator, callable without any HTTP
//! stack (tests drive it directly); [`http`] is the thin axum adapter layer
//! that maps it — plus the drift, alert-feedback, and health endpoints —
//! onto the wire contract.

pub mod http;
pub mod ingest;

pub use http::{router, AppState};
pub use ingest::{IngestConfig, IngestError, IngestOutcome, IngestRequest, IngestService};

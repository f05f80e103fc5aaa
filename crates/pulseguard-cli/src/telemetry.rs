//! Logging and span export for the runtime.
//!
//! One subscriber stack serves the whole process: an `EnvFilter` (from
//! `RUST_LOG`, default `info`), an optional OTLP span layer when
//! [`Config::otlp_endpoint`] is set, and a console formatter shaped by
//! [`Config::log_format`].  The bus delivery spans and the
//! `#[instrument]`-ed ingestion and drift operations all flow through this
//! stack, so a collector can reconstruct a whole Golden Path pass — or a
//! drift sweep and the retrain it triggered — from one correlation ID.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{Config, LogFormat};

/// Handle over the installed pipeline.
///
/// Call [`Telemetry::shutdown`] once the bus has drained so the final spans
/// of the run reach the collector; dropping the handle flushes as a
/// fallback.
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Install the global subscriber per the runtime configuration.  Must
    /// run before the Tokio runtime starts processing: the span exporter is
    /// synchronous and the subscriber can only be set once.
    pub fn install(config: &Config) -> Self {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let provider = build_provider(config.otlp_endpoint.as_deref());
        let span_layer = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("pulseguard")));
        let console = match config.log_format {
            LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
            LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
        };
        tracing_subscriber::registry()
            .with(filter)
            .with(span_layer)
            .with(console)
            .init();
        Self { provider }
    }

    /// Flush pending span batches and tear down the exporter.
    pub fn shutdown(mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[pulseguard] span exporter shutdown error: {e}");
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Build the OTLP provider for `endpoint`.  `None` disables span export;
/// an exporter that fails to initialise degrades to console-only logging
/// rather than refusing to start the runtime.
fn build_provider(endpoint: Option<&str>) -> Option<SdkTracerProvider> {
    let endpoint = endpoint?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[pulseguard] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name("pulseguard".to_string())
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // Synchronous exporter: installation happens before the Tokio
            // runtime exists, so a batch exporter has nowhere to spawn.
            .with_simple_exporter(exporter)
            .build(),
    )
}

//! Structured JSON logging for the storage gateway core, plus an optional
//! OpenTelemetry tracer for callers that enable the `otel` feature.
//!
//! Every crate in this workspace emits diagnostics through `tracing`; this
//! crate only wires up *where those events go* (a JSON-formatted subscriber
//! filtered by `RUST_LOG`), never `println!`/`eprintln!`.

#![deny(unsafe_code)]

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Errors raised while initializing telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// OpenTelemetry tracer pipeline setup failed.
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Default `RUST_LOG` directive applied when the environment variable is unset.
pub const DEFAULT_LOG_DIRECTIVE: &str = "info";

/// Initialize structured JSON logging with an `RUST_LOG`-driven filter.
///
/// Idempotent: a second call after a subscriber is already installed is a
/// no-op rather than a panic, since multiple crates in a binary may each
/// attempt to initialize logging during startup.
pub fn init_json_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize an OpenTelemetry OTLP tracer exporting spans under `service_name`.
///
/// Gated behind the `otel` feature; callers who don't need distributed
/// tracing export (e.g. most tests) never pull in the OpenTelemetry stack.
#[cfg(feature = "otel")]
pub fn init_otel_tracer(service_name: &str) -> Result<(), TelemetryError> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace as sdktrace;
    use opentelemetry_sdk::{runtime, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_owned())]);
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    Ok(())
}

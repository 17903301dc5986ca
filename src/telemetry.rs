//! OpenTelemetry tracing export
//!
//! Spans are exported over OTLP/gRPC to the collector named by
//! `OTEL_EXPORTER_OTLP_ENDPOINT`. W3C trace context from incoming requests is
//! picked up by the webhook's `extract_trace_context` middleware.

use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

use crate::error::{Error, Result};

pub const SERVICE_NAME: &str = "secrets-decryption-webhook";

/// Environment variable that switches OTLP export on.
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Install the OTLP pipeline and return a layer for `subscriber`.
pub fn init_telemetry<S>(_subscriber: &S) -> Result<OpenTelemetryLayer<S, trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::Telemetry(e.to_string()))?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush pending spans.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

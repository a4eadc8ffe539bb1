use opentelemetry::{global, KeyValue};
use opentelemetry::sdk::{propagation::TraceContextPropagator, Resource, trace as sdktrace};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use tracing_subscriber::fmt::format::FmtSpan;

/// Install the global subscriber: env-filtered fmt output, plus an OTLP trace
/// exporter when an endpoint is configured.
pub fn init_telemetry(service_name: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    // Explicitly set default info if RUST_LOG is empty
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    let Some(endpoint) = otlp_endpoint else {
        Registry::default().with(env_filter).with(fmt_layer).init();
        return Ok(());
    };

    global::set_text_map_propagator(TraceContextPropagator::new());

    let trace_config = sdktrace::config()
        .with_resource(Resource::new(vec![KeyValue::new("service.name", service_name.to_string())]));

    // 4317 is the gRPC port; anything else is treated as OTLP/HTTP.
    let tracer = if endpoint.contains("4317") {
        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint);

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(trace_config)
            .install_batch(opentelemetry::runtime::Tokio)?
    } else {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint)
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary);

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(trace_config)
            .install_batch(opentelemetry::runtime::Tokio)?
    };

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Ok(())
}

pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

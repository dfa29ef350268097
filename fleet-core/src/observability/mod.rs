//! Observability: tracing, metrics and health.
//!
//! Tracing goes to stderr through `tracing-subscriber`, and to an OTLP
//! collector when `FLEET_OTLP_ENABLED` or `OTEL_EXPORTER_OTLP_ENDPOINT` is
//! set. Metrics are served by a Prometheus listener when a port is given.

use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod health;
pub mod metrics;

fn otlp_enabled() -> bool {
    std::env::var("FLEET_OTLP_ENABLED").is_ok()
        || std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

fn otlp_endpoint() -> String {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string())
}

/// `RUST_LOG` when set, the configured level otherwise.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Batch-exporting OTLP tracer tagged with the service name and version.
fn otlp_tracer(
    service: &'static str,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer, opentelemetry::trace::TraceError> {
    let resource = Resource::new(vec![
        opentelemetry::KeyValue::new("service.name", service),
        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
}

/// Install the global subscriber and, with `metrics_port`, the Prometheus
/// exporter. Call once, early in `main`.
pub fn init(
    service: &'static str,
    log_level: &str,
    metrics_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let fmt = tracing_subscriber::fmt::layer().with_target(true).with_level(true);
    let subscriber = tracing_subscriber::registry().with(env_filter(log_level)).with(fmt);

    if otlp_enabled() {
        let endpoint = otlp_endpoint();
        let tracer = otlp_tracer(service, &endpoint)?;
        subscriber.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
        tracing::info!(service, %endpoint, "Tracing initialized with OTLP export");
    } else {
        subscriber.init();
        tracing::debug!(service, "Tracing initialized (set FLEET_OTLP_ENABLED=1 to export)");
    }

    if let Some(port) = metrics_port {
        PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port)).install()?;
        self::metrics::register_core_metrics();
        tracing::info!(port, "Prometheus metrics listener started");
    }

    Ok(())
}

/// Flush pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

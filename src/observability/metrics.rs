//! OpenTelemetry metrics for requests and the admission window.
//!
//! Key metrics:
//! - tether_rpc_total: Counter of submitted requests
//! - tether_rpc_latency_seconds: Histogram from submission to resolution
//! - tether_window_in_flight: Gauge of items currently outstanding
//! - tether_window_completed_total: Counter of completed items by outcome

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Tether metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Total number of submitted requests.
    pub rpc_total: Counter<u64>,
    /// Histogram of request latency in seconds.
    pub rpc_latency: Histogram<f64>,
    /// Number of window items currently outstanding.
    pub window_in_flight: Gauge<i64>,
    /// Total number of completed window items.
    pub window_completed: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            rpc_total: meter
                .u64_counter("tether_rpc_total")
                .with_description("Total number of submitted requests")
                .with_unit("1")
                .init(),
            rpc_latency: meter
                .f64_histogram("tether_rpc_latency_seconds")
                .with_description("Latency from submission to resolution")
                .with_unit("s")
                .init(),
            window_in_flight: meter
                .i64_gauge("tether_window_in_flight")
                .with_description("Window items submitted but not yet completed")
                .with_unit("1")
                .init(),
            window_completed: meter
                .u64_counter("tether_window_completed_total")
                .with_description("Completed window items by outcome")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to create OTLP exporter, using no-op metrics"
                    );
                    install_manual_reader();
                }
            }
        } else {
            install_manual_reader();
        }

        let meter = global::meter("tether");
        Metrics::new(&meter)
    });
}

/// Metrics are recorded but never exported.
fn install_manual_reader() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record a submitted request.
pub fn record_submit(topic: &str) {
    if let Some(m) = METRICS.get() {
        m.rpc_total
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }
}

/// Record the resolution of a request.
pub fn record_rpc(topic: &str, latency_seconds: f64, ok: bool) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("topic", topic.to_string()),
            KeyValue::new("outcome", if ok { "ok" } else { "error" }),
        ];
        m.rpc_latency.record(latency_seconds, &attrs);
    }
}

/// Record the number of outstanding window items.
pub fn record_in_flight(in_flight: usize) {
    if let Some(m) = METRICS.get() {
        m.window_in_flight.record(in_flight as i64, &[]);
    }
}

/// Record a completed window item.
pub fn record_completion(success: bool) {
    if let Some(m) = METRICS.get() {
        let outcome = if success { "success" } else { "failure" };
        m.window_completed
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

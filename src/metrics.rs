use opentelemetry::metrics::MeterProvider;
use opentelemetry::metrics::{Counter, Histogram, ObservableGauge};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::periodic_reader_with_async_runtime::PeriodicReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::Resource;
use std::sync::{atomic::AtomicU64, Arc};
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    pub requests: Counter<u64>,
    pub errors: Counter<u64>,
    pub latency_ms: Histogram<f64>,
    pub account_switches: Counter<u64>,
    _inflight: ObservableGauge<i64>,
}

pub struct MetricsExporterConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

pub fn init_metrics(
    service_name: String,
    exporter: MetricsExporterConfig,
    inflight_count: Arc<AtomicU64>,
) -> Result<Metrics, String> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(exporter.endpoint)
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_millis(exporter.timeout_ms))
        .build()
        .map_err(|e| format!("metrics exporter init error: {}", e))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();

    let meter = provider.meter("poolgate");
    opentelemetry::global::set_meter_provider(provider);

    let requests = meter
        .u64_counter("ai.gateway.requests")
        .with_description("Total requests")
        .build();
    let errors = meter
        .u64_counter("ai.gateway.errors")
        .with_description("Total errors")
        .build();
    let latency_ms = meter
        .f64_histogram("ai.gateway.latency_ms")
        .with_unit("ms")
        .with_description("Request latency in ms")
        .build();
    let account_switches = meter
        .u64_counter("ai.gateway.account_switches")
        .with_description("Failover account switches")
        .build();
    let inflight = meter
        .i64_observable_gauge("ai.gateway.inflight")
        .with_description("In-flight requests")
        .with_callback(move |observer| {
            let value = inflight_count.load(std::sync::atomic::Ordering::Relaxed) as i64;
            observer.observe(value, &[]);
        })
        .build();

    Ok(Metrics {
        requests,
        errors,
        latency_ms,
        account_switches,
        _inflight: inflight,
    })
}

pub fn init_metrics_noop(inflight_count: Arc<AtomicU64>) -> Metrics {
    let meter = opentelemetry::global::meter("poolgate");
    let requests = meter.u64_counter("ai.gateway.requests").build();
    let errors = meter.u64_counter("ai.gateway.errors").build();
    let latency_ms = meter.f64_histogram("ai.gateway.latency_ms").build();
    let account_switches = meter.u64_counter("ai.gateway.account_switches").build();
    let inflight = meter
        .i64_observable_gauge("ai.gateway.inflight")
        .with_callback(move |observer| {
            let value = inflight_count.load(std::sync::atomic::Ordering::Relaxed) as i64;
            observer.observe(value, &[]);
        })
        .build();

    Metrics {
        requests,
        errors,
        latency_ms,
        account_switches,
        _inflight: inflight,
    }
}

//! Logs, traces and metrics for the worker process.
//!
//! Console logs are always on, rendered pretty or as JSON lines depending on
//! `--log-format`, and filtered through `RUST_LOG` (default `info`). Cargo
//! features layer OpenTelemetry export on top:
//!
//! - `tracing`: every worker's watch loop and final check run inside a span.
//!   The span context is injected as W3C `traceparent` into each outgoing
//!   health call, so the target can attribute the requests to the worker.
//! - `metrics`: `targets_added`, `targets_removed` and `worker_stream_errors`
//!   counters and the `live_workers` gauge.
//! - `stdout`, `honeycomb`: where spans and metrics are shipped. Honeycomb
//!   is configured through `HONEYCOMB_API_KEY`, `HONEYCOMB_DATASET`,
//!   `HONEYCOMB_ENDPOINT` and `HONEYCOMB_COMPRESSION`.
//!
//! ```bash
//! cargo run --features tracing,metrics,honeycomb -- --target 10.0.0.1:9095
//! ```
//!
//! Every metric helper below compiles to a no-op without `metrics`.

#[cfg(all(
    any(feature = "honeycomb", feature = "stdout"),
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!("The 'honeycomb' and 'stdout' exporters need 'tracing' or 'metrics' enabled.");

use dispatch_worker_core::{Connector, WorkerPoolManager};
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::KeyValue;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semconv;

#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Meter, ObservableGauge};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
const SERVICE_NAME: &str = "dispatch-worker";

/// Console log rendering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Exporter pipelines that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Failures are reported on stderr
    /// since the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global subscriber and, with the matching features, the
/// OpenTelemetry tracer and meter providers.
pub fn init_telemetry(format: LogFormat) -> anyhow::Result<TelemetryProviders> {
    let pretty = (format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .pretty()
    });
    let json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .json()
            .with_current_span(true)
            .flatten_event(true)
    });

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(pretty)
        .with(json);

    #[cfg(feature = "tracing")]
    let (registry, tracer_provider) = {
        use opentelemetry::trace::TracerProvider as _;

        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let tracer_provider = tracer_provider()?;
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());

        let tracer = tracer_provider.tracer_with_scope(scope());
        let registry = registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer)
                .with_error_records_to_exceptions(true),
        );
        (registry, tracer_provider)
    };

    #[cfg(feature = "metrics")]
    let meter_provider = {
        let meter_provider = meter_provider()?;
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        Metrics::install(opentelemetry::global::meter_with_scope(scope()));
        meter_provider
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn scope() -> opentelemetry::InstrumentationScope {
    opentelemetry::InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semconv::SCHEMA_URL)
        .build()
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semconv::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semconv::SCHEMA_URL,
        )
        .build()
}

/// Connection settings for Honeycomb's OTLP/gRPC intake, shared by the span
/// and metric exporters.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    endpoint: String,
    compression: opentelemetry_otlp::Compression,
    metadata: MetadataMap,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    const EXPORT_TIMEOUT: core::time::Duration = core::time::Duration::from_secs(10);

    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use core::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?
                .parse()
                .context("invalid HONEYCOMB_API_KEY")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?
                .parse()
                .context("invalid HONEYCOMB_DATASET")?,
        );

        let compression = var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase();
        let compression = opentelemetry_otlp::Compression::from_str(&compression)?;

        Ok(Self {
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression,
            metadata,
        })
    }

    fn configure<B>(&self, builder: B) -> B
    where
        B: opentelemetry_otlp::WithExportConfig + opentelemetry_otlp::WithTonicConfig,
    {
        builder
            .with_tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
            .with_metadata(self.metadata.clone())
            .with_compression(self.compression)
            .with_timeout(Self::EXPORT_TIMEOUT)
            .with_endpoint(self.endpoint.clone())
            .with_protocol(opentelemetry_otlp::Protocol::Grpc)
    }
}

#[cfg(feature = "tracing")]
fn batched<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: sdktrace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(core::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "tracing")]
fn tracer_provider() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let honeycomb = Honeycomb::from_env()?;
        let exporter = honeycomb
            .configure(opentelemetry_otlp::SpanExporter::builder().with_tonic())
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
fn meter_provider() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(core::time::Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let honeycomb = Honeycomb::from_env()?;
        let exporter = honeycomb
            .configure(opentelemetry_otlp::MetricExporter::builder().with_tonic())
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()
            .context("failed to build metric exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

/// Writes the current span's context into outgoing request metadata.
#[cfg(feature = "tracing")]
pub fn inject_trace_context(metadata: &mut MetadataMap) {
    use opentelemetry::propagation::Injector;
    use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    struct MetadataInjector<'a>(&'a mut MetadataMap);

    impl Injector for MetadataInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            if let (Ok(key), Ok(value)) = (
                AsciiMetadataKey::from_bytes(key.as_bytes()),
                AsciiMetadataValue::try_from(value.as_str()),
            ) {
                self.0.insert(key, value);
            }
        }
    }

    let context = tracing::Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut MetadataInjector(metadata));
    });
}

#[cfg(not(feature = "tracing"))]
pub fn inject_trace_context(_metadata: &mut MetadataMap) {}

#[cfg(feature = "metrics")]
struct Metrics {
    meter: Meter,
    targets_added: Counter<u64>,
    targets_removed: Counter<u64>,
    worker_stream_errors: Counter<u64>,
    live_workers: OnceLock<ObservableGauge<u64>>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Metrics> = OnceLock::new();

#[cfg(feature = "metrics")]
impl Metrics {
    fn install(meter: Meter) {
        let counter = |name: &'static str, description: &'static str| {
            meter.u64_counter(name).with_description(description).build()
        };

        let _ = METRICS.set(Self {
            targets_added: counter("targets_added", "Dispatch targets registered with the pool"),
            targets_removed: counter("targets_removed", "Dispatch targets removed from the pool"),
            worker_stream_errors: counter(
                "worker_stream_errors",
                "Failed or broken worker streams to a target",
            ),
            live_workers: OnceLock::new(),
            meter: meter.clone(),
        });
    }

    fn add(select: impl FnOnce(&Self) -> &Counter<u64>) {
        if let Some(metrics) = METRICS.get() {
            select(metrics).add(1, &[]);
        }
    }
}

#[cfg(feature = "metrics")]
pub fn increment_targets_added() {
    Metrics::add(|m| &m.targets_added);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_targets_added() {}

#[cfg(feature = "metrics")]
pub fn increment_targets_removed() {
    Metrics::add(|m| &m.targets_removed);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_targets_removed() {}

#[cfg(feature = "metrics")]
pub fn increment_worker_stream_errors() {
    Metrics::add(|m| &m.worker_stream_errors);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_worker_stream_errors() {}

/// Live worker count of `pool`, or zero once the pool has been dropped.
///
/// Holds only a weak reference so the gauge never keeps the pool alive.
#[cfg(any(feature = "metrics", test))]
pub fn live_workers_of<K>(
    pool: &Arc<WorkerPoolManager<K>>,
) -> impl Fn() -> usize + Send + Sync + 'static
where
    K: Connector,
{
    let pool: std::sync::Weak<WorkerPoolManager<K>> = Arc::downgrade(pool);
    move || pool.upgrade().map_or(0, |pool| pool.live_concurrency())
}

/// Reports `pool`'s live worker count on every metrics collection.
///
/// Only the first registration takes effect.
#[cfg(feature = "metrics")]
pub fn observe_live_workers<K>(pool: &Arc<WorkerPoolManager<K>>)
where
    K: Connector,
{
    let Some(metrics) = METRICS.get() else {
        return;
    };
    let live = live_workers_of(pool);
    let _ = metrics.live_workers.set(
        metrics
            .meter
            .u64_observable_gauge("live_workers")
            .with_description("Workers currently running across all targets")
            .with_callback(move |observer| observer.observe(live() as u64, &[]))
            .build(),
    );
}

#[cfg(not(feature = "metrics"))]
pub fn observe_live_workers<K>(_pool: &Arc<WorkerPoolManager<K>>)
where
    K: Connector,
{
}

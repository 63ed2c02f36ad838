use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use thiserror::Error;
use tracing::{Dispatch, Subscriber};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::{EnvFilter, Layer as _};

const DEFAULT_OTLP_ENDPOINT: &str = "http://otel-collector:4317";
const LOCAL_OTLP_ENDPOINT: &str = "http://localhost:4317";
const DEFAULT_LOG_FILTER: &str = "trace,h2=error,tonic=error,tower=error,tower_http=error";

/// Telemetry settings of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: String,
    pub log_filter: String,
    pub json_logs: bool,
}

impl TelemetryConfig {
    /// Load the telemetry configuration from environment variables.
    ///
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector endpoint. Defaults to the
    ///   local collector when `APP_ENV=local`.
    /// - `RUST_LOG`: log filter directives. Spans are not affected.
    /// - `LOG_FORMAT`: `json` for json formatted logs.
    pub fn from_env(service_name: &str) -> Self {
        Self::from_lookup(service_name, |key| std::env::var(key).ok())
    }

    /// Load the telemetry configuration from the given variable lookup.
    pub fn from_lookup<F>(service_name: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let otlp_endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|| {
            match lookup("APP_ENV").as_deref() {
                Some("local") => LOCAL_OTLP_ENDPOINT.to_string(),
                _ => DEFAULT_OTLP_ENDPOINT.to_string(),
            }
        });

        Self {
            service_name: service_name.to_string(),
            otlp_endpoint,
            log_filter: lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            json_logs: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        }
    }
}

/// The installed telemetry pipeline.
#[derive(Debug)]
pub struct Telemetry {
    provider: SdkTracerProvider,
    dispatch: Dispatch,
}

impl Telemetry {
    /// Returns the dispatcher spans should be recorded on.
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }

    /// Flushes pending spans and shuts the exporter down.
    pub fn shutdown(self) -> Result<(), TelemetryError> {
        self.provider.shutdown()?;
        Ok(())
    }
}

/// Initializes OpenTelemetry tracing and logging.
///
/// Spans are exported to the configured OTLP collector. The subscriber is
/// installed as the global default for log events and returned for explicit
/// injection into [`RequestTracer`](crate::RequestTracer).
pub fn init_tracer(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    let span_exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .with_batch_exporter(span_exporter)
        .build();

    let tracer = provider.tracer(config.service_name.clone());
    let subscriber = build_subscriber(config, tracer)?;

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_global_default(dispatch.clone())?;

    Ok(Telemetry { provider, dispatch })
}

/// Composes the log and span pipeline.
///
/// The log filter only applies to log output. Request spans always reach the
/// OpenTelemetry layer so the sampler can decide on them.
fn build_subscriber(
    config: &TelemetryConfig,
    tracer: SdkTracer,
) -> Result<impl Subscriber + Send + Sync + 'static, TelemetryError> {
    let env_filter = EnvFilter::try_new(&config.log_filter)?;

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok(tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(otel_layer))
}

/// Error for [`init_tracer`] and [`Telemetry::shutdown`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("failed to build span exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install subscriber: {0}")]
    Subscriber(#[from] tracing::dispatcher::SetGlobalDefaultError),

    #[error("failed to shut down tracer provider: {0}")]
    Shutdown(#[from] OTelSdkError),
}

//! Logging and optional OpenTelemetry tracing for the trend bot.
//!
//! Console logs always go through a `tracing-subscriber` fmt layer filtered
//! by `RUST_LOG`. When an OTLP endpoint is configured, spans are also
//! exported through `tracing-opentelemetry`.
//!
//! # Example
//!
//! ```ignore
//! use trend_bot::observability::{init_tracing, TracingConfig};
//!
//! let guard = init_tracing(&TracingConfig::default())?;
//! // ... run ...
//! guard.shutdown();
//! ```
//!
//! # Key Spans
//!
//! - `rebalance.cycle` - One full rebalance
//! - `broker.call` - A broker request through the reliability layer

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchSpanProcessor, Sampler, SdkTracerProvider};
use std::time::Duration;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "trend_bot=info";

/// Configuration for logging and tracing.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// OTLP endpoint URL (e.g., "http://localhost:4317"). `None` disables export.
    pub otlp_endpoint: Option<String>,
    /// Service name for resource attributes.
    pub service_name: String,
    /// Service version for resource attributes.
    pub service_version: String,
    /// Sampling ratio (0.0 to 1.0).
    pub sampling_ratio: f64,
    /// Maximum batch size for span export.
    pub batch_size: usize,
    /// Scheduled delay between batch exports.
    pub batch_timeout: Duration,
    /// Whether to enable console logging layer.
    pub enable_console: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "trend-bot".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            sampling_ratio: 1.0,
            batch_size: 512,
            batch_timeout: Duration::from_secs(5),
            enable_console: true,
        }
    }
}

impl TracingConfig {
    /// Export spans to `endpoint`.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Set the service name.
    #[must_use]
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }
}

/// Error type for tracing operations.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    /// Failed to create OTLP exporter.
    #[error("failed to create OTLP exporter: {0}")]
    ExporterError(String),
    /// Failed to initialize tracing subscriber.
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberError(String),
}

/// Tracer provider handle for graceful shutdown.
#[derive(Debug)]
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// Shutdown the tracer provider, flushing any pending spans.
    pub fn shutdown(self) {
        if let Some(provider) = self.provider
            && let Err(e) = provider.shutdown()
        {
            tracing::error!(error = %e, "Failed to shutdown tracer provider");
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the OTLP exporter cannot be built or a global
/// subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<TracingGuard, TracingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let provider = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| build_provider(config, endpoint))
        .transpose()?;
    let otel_layer = provider
        .as_ref()
        .map(|p| OpenTelemetryLayer::new(p.tracer(config.service_name.clone())));
    let console_layer = config.enable_console.then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| TracingError::SubscriberError(e.to_string()))?;

    match &config.otlp_endpoint {
        Some(endpoint) => tracing::info!(
            endpoint = %endpoint,
            service = %config.service_name,
            "OpenTelemetry tracing initialized"
        ),
        None => tracing::debug!("OTLP export disabled, console logging only"),
    }

    Ok(TracingGuard { provider })
}

fn build_provider(
    config: &TracingConfig,
    endpoint: &str,
) -> Result<SdkTracerProvider, TracingError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TracingError::ExporterError(e.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", config.service_version.clone()),
        ])
        .build();

    let batch_processor = BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            opentelemetry_sdk::trace::BatchConfigBuilder::default()
                .with_max_export_batch_size(config.batch_size)
                .with_scheduled_delay(config.batch_timeout)
                .build(),
        )
        .build();

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(Sampler::TraceIdRatioBased(config.sampling_ratio))
        .with_span_processor(batch_processor)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.service_name, "trend-bot");
        assert!((config.sampling_ratio - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.batch_size, 512);
        assert!(config.enable_console);
    }

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::default()
            .with_endpoint("http://otel:4317")
            .service_name("crypto-bot");

        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://otel:4317"));
        assert_eq!(config.service_name, "crypto-bot");
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<tracing_subscriber::filter::Directive>().is_ok());
    }

    #[test]
    fn test_tracing_error_display() {
        let err = TracingError::ExporterError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}

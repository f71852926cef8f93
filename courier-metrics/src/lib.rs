//! OpenTelemetry metrics for the courier dispatch engine
//!
//! Metrics are pushed via OTLP to an OpenTelemetry Collector, which can expose
//! them in Prometheus format for scraping.
//!
//! Recording is fire-and-forget: callers go through [`try_metrics`], which
//! returns `None` until [`init_metrics`] has run, so an engine without metrics
//! configured pays only for an atomic load per call site.
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_metrics(&MetricsConfig::default())?;
//!
//! if let Some(metrics) = courier_metrics::try_metrics() {
//!     metrics.dispatch.record_retry("bulk_retry");
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod error;
mod exporter;

pub use config::MetricsConfig;
pub use dispatch::{DispatchMetrics, LANES};
pub use error::MetricsError;
use once_cell::sync::OnceCell;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub dispatch: DispatchMetrics,
}

/// Initialize the metrics system
///
/// Must be called once at startup before any metrics are recorded. If metrics
/// are disabled in the config, this is a no-op.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::meter_provider(config)?;
    opentelemetry::global::set_meter_provider(provider);

    let dispatch = DispatchMetrics::new(
        config.max_domain_cardinality,
        config.high_priority_domains.clone(),
    )?;

    METRICS_INSTANCE
        .set(Metrics { dispatch })
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// Get the global metrics instance, if metrics were initialized
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}

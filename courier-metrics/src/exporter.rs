//! OTLP metrics exporter

use std::time::Duration;

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

use crate::{MetricsConfig, MetricsError};

/// Meter provider pushing to `config.endpoint` every `config.export_interval_secs`
///
/// # Errors
///
/// Returns an error if the OTLP exporter cannot be built.
pub fn meter_provider(config: &MetricsConfig) -> Result<SdkMeterProvider, MetricsError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(config.endpoint.as_str())
        .with_timeout(Duration::from_secs(config.export_timeout_secs))
        .build()
        .map_err(|e| MetricsError::OpenTelemetry(e.to_string()))?;

    let interval = Duration::from_secs(config.export_interval_secs.max(1));
    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    Ok(SdkMeterProvider::builder().with_reader(reader).build())
}

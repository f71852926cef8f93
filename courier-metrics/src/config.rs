//! Metrics configuration

use serde::Deserialize;

/// Configuration for metrics collection and export
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable or disable metrics collection
    ///
    /// When disabled every recording call is a no-op.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// OTLP/HTTP endpoint metrics are pushed to
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// How often collected metrics are pushed (in seconds)
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// How long one push may take before it is abandoned (in seconds)
    #[serde(default = "default_export_timeout")]
    pub export_timeout_secs: u64,

    /// Maximum number of distinct domains used as a metric attribute.
    ///
    /// Domains seen after the limit is reached are reported as `other`.
    #[serde(default = "default_max_domain_cardinality")]
    pub max_domain_cardinality: usize,

    /// Domains that always keep their own attribute value, regardless of the
    /// cardinality limit
    #[serde(default)]
    pub high_priority_domains: Vec<String>,
}

const fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://localhost:4318/v1/metrics".to_string()
}

const fn default_export_interval() -> u64 {
    15
}

const fn default_export_timeout() -> u64 {
    10
}

const fn default_max_domain_cardinality() -> usize {
    1000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            export_interval_secs: default_export_interval(),
            export_timeout_secs: default_export_timeout(),
            max_domain_cardinality: default_max_domain_cardinality(),
            high_priority_domains: Vec::new(),
        }
    }
}

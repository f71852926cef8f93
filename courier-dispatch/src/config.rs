//! Engine configuration
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```ron
//! (
//!     workers: (max_workers: 32, tick_interval_ms: 50),
//!     retry: (max_retries: 5),
//!     slots: (bulk_max_in_flight: 4),
//!     addresses: (
//!         source_addresses: ["192.0.2.10", "192.0.2.11"],
//!         domain_sessions: {"slow.example": 1},
//!     ),
//! )
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    address::AddressPoolConfig,
    permit::ResourceWaitConfig,
    policy::{HoldConfig, RetryAdmissionConfig, RetryPolicy},
    sender::RecipientPolicy,
    slots::SlotConfig,
};

fn default_max_workers() -> usize {
    num_cpus::get() * 4
}

const fn default_tick_interval() -> u64 {
    100
}

const fn default_shutdown_timeout() -> u64 {
    30
}

/// Worker pool and tick settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent send operations.
    ///
    /// Default: four per CPU
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How often the scheduler runs (in milliseconds)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Most batches one tick may dispatch; unbounded when unset
    #[serde(default)]
    pub max_dispatch_per_tick: Option<usize>,

    /// How long shutdown waits for running attempts (in seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            tick_interval_ms: default_tick_interval(),
            max_dispatch_per_tick: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        // A zero period would make `tokio::time::interval` panic
        Duration::from_millis(if self.tick_interval_ms == 0 {
            1
        } else {
            self.tick_interval_ms
        })
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub hold: HoldConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub retry_admission: RetryAdmissionConfig,

    #[serde(default)]
    pub resource_wait: ResourceWaitConfig,

    #[serde(default)]
    pub addresses: AddressPoolConfig,

    #[serde(default)]
    pub slots: SlotConfig,

    #[serde(default)]
    pub recipients: RecipientPolicy,
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::TrafficClass;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: DispatchConfig = ron::from_str("()").expect("Invalid RON");

        assert_eq!(config.workers.max_workers, num_cpus::get() * 4);
        assert_eq!(config.workers.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.workers.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.retry_admission.cap_percent, 30);
        assert_eq!(config.resource_wait.timeout_code, 451);
        assert_eq!(config.addresses.cooldown_triggers.get(&421), Some(&1));
        assert_eq!(config.recipients.retry_excluded_codes, vec![550, 551, 552, 553, 554]);
        assert_eq!(config.slots.limit(TrafficClass::Bulk), None);
        assert_eq!(config.hold.max_hold(config.workers.tick_interval()), Duration::from_millis(200));
    }

    #[test]
    fn test_partial_document() {
        let config: DispatchConfig = ron::from_str(
            r#"(
                workers: (max_workers: 8, tick_interval_ms: 50, max_dispatch_per_tick: Some(4)),
                retry: (max_retries: 5, multiplier: 3.0),
                slots: (max_in_flight: 6, bulk_max_in_flight: 2),
                addresses: (
                    source_addresses: ["192.0.2.10", "192.0.2.11"],
                    sessions_per_address: 4,
                    domain_sessions: {"slow.example": 1},
                ),
                hold: (max_hold_ms: Some(500)),
            )"#,
        )
        .expect("Invalid RON");

        assert_eq!(config.workers.max_workers, 8);
        assert_eq!(config.workers.max_dispatch_per_tick, Some(4));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.slots.limit(TrafficClass::Bulk), Some(2));
        assert_eq!(config.slots.limit(TrafficClass::Realtime), Some(6));
        assert_eq!(
            config.addresses.source_addresses,
            vec![
                "192.0.2.10".parse::<IpAddr>().expect("address"),
                "192.0.2.11".parse::<IpAddr>().expect("address"),
            ]
        );
        assert_eq!(config.addresses.domain_sessions.get("slow.example"), Some(&1));
        assert_eq!(config.addresses.cooldown_secs, 60);
        assert_eq!(config.hold.max_hold(Duration::from_millis(50)), Duration::from_millis(500));
    }
}

//! Source address leasing with cooldown
//!
//! Every attempt leases one source address from the pool for the duration
//! of its session. Each address carries a bounded number of concurrent
//! sessions per destination domain, and the least-loaded address wins.
//!
//! Remote hosts that throttle an address answer with specific status codes.
//! Each such code has a threshold: once an address collects that many
//! consecutive trigger failures it cools down and is skipped until the
//! cooldown expires. Any success resets the streak.
//!
//! ```text
//! triggers: {421: 1, 450: 2, 451: 2}, cooldown: 60s
//!
//! t=0s:   451 → streak 1 (below threshold)
//! t=1s:   451 → streak 2 → cooled until t=61s
//! t=1-61: address skipped by try_acquire
//! t=61s:  address eligible again, streak starts from zero
//! ```

use std::net::{IpAddr, Ipv4Addr};

use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use courier_common::{Domain, SharedClock, tracing};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Configuration for the source address pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPoolConfig {
    /// Addresses sessions may originate from
    #[serde(default = "default_source_addresses")]
    pub source_addresses: Vec<IpAddr>,

    /// Concurrent sessions per address per destination domain
    #[serde(default = "default_sessions_per_address")]
    pub sessions_per_address: usize,

    /// Per-domain overrides of `sessions_per_address`
    #[serde(default)]
    pub domain_sessions: AHashMap<String, usize>,

    /// How long a cooled address is skipped (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Status codes that count towards cooldown, with their thresholds
    #[serde(default = "default_cooldown_triggers")]
    pub cooldown_triggers: AHashMap<u16, u32>,
}

impl Default for AddressPoolConfig {
    fn default() -> Self {
        Self {
            source_addresses: default_source_addresses(),
            sessions_per_address: default_sessions_per_address(),
            domain_sessions: AHashMap::default(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_triggers: default_cooldown_triggers(),
        }
    }
}

impl AddressPoolConfig {
    fn capacity(&self, domain: &Domain) -> usize {
        self.domain_sessions
            .get(domain.as_str())
            .copied()
            .unwrap_or(self.sessions_per_address)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs.min(i64::MAX as u64) as i64)
    }
}

fn default_source_addresses() -> Vec<IpAddr> {
    // Let the OS pick the source
    vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]
}

const fn default_sessions_per_address() -> usize {
    2
}

const fn default_cooldown_secs() -> u64 {
    60
}

fn default_cooldown_triggers() -> AHashMap<u16, u32> {
    [(421, 1), (450, 2), (451, 2)].into_iter().collect()
}

/// A source address held by one attempt
///
/// Not `Clone`: handing the lease back to [`AddressLeaseAllocator::release`]
/// consumes it, so it can only be released once.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressLease {
    index: usize,
    address: IpAddr,
    domain: Domain,
}

impl AddressLease {
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }
}

/// Point-in-time view of one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressStats {
    pub address: IpAddr,
    pub active_leases: usize,
    pub failure_streak: u32,
    pub cooled_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AddressState {
    leases: AHashMap<Domain, usize>,
    total: usize,
    failure_streak: u32,
    cooled_until: Option<DateTime<Utc>>,
}

impl AddressState {
    fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.cooled_until.is_some_and(|until| now < until)
    }

    fn leases_for(&self, domain: &Domain) -> usize {
        self.leases.get(domain).copied().unwrap_or(0)
    }
}

/// Leases source addresses to attempts
#[derive(Debug)]
pub struct AddressLeaseAllocator {
    config: AddressPoolConfig,
    addresses: Vec<IpAddr>,
    state: Mutex<Vec<AddressState>>,
    clock: SharedClock,
}

impl AddressLeaseAllocator {
    #[must_use]
    pub fn new(config: AddressPoolConfig, clock: SharedClock) -> Self {
        let addresses = config.source_addresses.clone();
        let state = addresses.iter().map(|_| AddressState::default()).collect();

        Self {
            config,
            addresses,
            state: Mutex::new(state),
            clock,
        }
    }

    /// Lease the least-loaded usable address for `domain`.
    ///
    /// Returns `None` if every address is cooling down or at capacity for
    /// the domain. Ties go to the address listed first.
    #[must_use]
    pub fn try_acquire(&self, domain: &Domain) -> Option<AddressLease> {
        let now = self.clock.now();
        let capacity = self.config.capacity(domain);
        let mut state = self.state.lock();

        let index = state
            .iter()
            .enumerate()
            .filter(|(_, address)| !address.is_cooling(now))
            .filter(|(_, address)| address.leases_for(domain) < capacity)
            .min_by_key(|(_, address)| address.leases_for(domain))
            .map(|(index, _)| index)?;

        let address = &mut state[index];
        if address.cooled_until.is_some_and(|until| now >= until) {
            address.cooled_until = None;
        }
        *address.leases.entry(domain.clone()).or_insert(0) += 1;
        address.total += 1;

        Some(AddressLease {
            index,
            address: self.addresses[index],
            domain: domain.clone(),
        })
    }

    /// Hand a lease back
    pub fn release(&self, lease: AddressLease) {
        let mut state = self.state.lock();
        let Some(address) = state.get_mut(lease.index) else {
            return;
        };

        if let Some(count) = address.leases.get_mut(&lease.domain) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                address.leases.remove(&lease.domain);
            }
        }
        address.total = address.total.saturating_sub(1);
    }

    /// Feed the outcome of an attempt into the address's cooldown tracking.
    ///
    /// Returns `true` if this result put the address into cooldown.
    pub fn record_batch_result(
        &self,
        lease: &AddressLease,
        status_code: Option<u16>,
        had_any_success: bool,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(address) = state.get_mut(lease.index) else {
            return false;
        };

        if had_any_success {
            address.failure_streak = 0;
            return false;
        }

        let Some(threshold) = status_code.and_then(|code| self.config.cooldown_triggers.get(&code))
        else {
            return false;
        };

        address.failure_streak += 1;
        if address.failure_streak < *threshold {
            return false;
        }

        let until = self.clock.now() + self.config.cooldown();
        address.cooled_until = Some(until);
        address.failure_streak = 0;

        tracing::warn!(
            address = %lease.address,
            domain = %lease.domain,
            code = ?status_code,
            until = %until,
            "Source address cooling down after repeated throttling"
        );

        true
    }

    /// Total leases outstanding across all addresses
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.state.lock().iter().map(|address| address.total).sum()
    }

    /// Leases outstanding for `domain`
    #[must_use]
    pub fn active_leases_for(&self, domain: &Domain) -> usize {
        self.state
            .lock()
            .iter()
            .map(|address| address.leases_for(domain))
            .sum()
    }

    #[must_use]
    pub fn is_cooling(&self, address: IpAddr) -> bool {
        let now = self.clock.now();
        self.addresses
            .iter()
            .zip(self.state.lock().iter())
            .any(|(candidate, state)| *candidate == address && state.is_cooling(now))
    }

    #[must_use]
    pub fn stats(&self) -> Vec<AddressStats> {
        let now = self.clock.now();
        self.addresses
            .iter()
            .zip(self.state.lock().iter())
            .map(|(address, state)| AddressStats {
                address: *address,
                active_leases: state.total,
                failure_streak: state.failure_streak,
                cooled_until: state.cooled_until.filter(|until| now < *until),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::Arc};

    use courier_common::ManualClock;

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn allocator(addresses: Vec<IpAddr>, clock: Arc<ManualClock>) -> AddressLeaseAllocator {
        AddressLeaseAllocator::new(
            AddressPoolConfig {
                source_addresses: addresses,
                ..AddressPoolConfig::default()
            },
            clock,
        )
    }

    #[test]
    fn test_least_loaded_address_wins() {
        let pool = allocator(vec![ip(1), ip(2)], Arc::new(ManualClock::new()));
        let domain = Domain::new("example.com");

        let first = pool.try_acquire(&domain);
        let second = pool.try_acquire(&domain);
        assert_eq!(first.as_ref().map(AddressLease::address), Some(ip(1)));
        assert_eq!(second.as_ref().map(AddressLease::address), Some(ip(2)));
        assert_eq!(pool.active_leases(), 2);
    }

    #[test]
    fn test_capacity_is_per_domain() {
        let pool = allocator(vec![ip(1)], Arc::new(ManualClock::new()));
        let a = Domain::new("a.example");
        let b = Domain::new("b.example");

        let leases: Vec<_> = (0..2).filter_map(|_| pool.try_acquire(&a)).collect();
        assert_eq!(leases.len(), 2);
        assert!(pool.try_acquire(&a).is_none(), "a.example is at capacity");
        assert!(pool.try_acquire(&b).is_some(), "b.example has its own budget");

        for lease in leases {
            pool.release(lease);
        }
        assert_eq!(pool.active_leases_for(&a), 0);
        assert_eq!(pool.active_leases(), 1);
    }

    #[test]
    fn test_domain_session_override() {
        let mut config = AddressPoolConfig {
            source_addresses: vec![ip(1)],
            ..AddressPoolConfig::default()
        };
        config.domain_sessions.insert("strict.example".to_string(), 1);
        let pool = AddressLeaseAllocator::new(config, Arc::new(ManualClock::new()));

        let strict = Domain::new("strict.example");
        assert!(pool.try_acquire(&strict).is_some());
        assert!(pool.try_acquire(&strict).is_none());
    }

    #[test]
    fn test_cooldown_threshold() {
        let clock = Arc::new(ManualClock::new());
        let pool = allocator(vec![ip(1)], clock.clone());
        let domain = Domain::new("example.com");

        let Some(lease) = pool.try_acquire(&domain) else {
            panic!("address should be available");
        };

        // 451 needs two consecutive failures
        assert!(!pool.record_batch_result(&lease, Some(451), false));
        assert!(!pool.is_cooling(ip(1)));

        // A success in between resets the streak
        assert!(!pool.record_batch_result(&lease, Some(250), true));
        assert!(!pool.record_batch_result(&lease, Some(451), false));
        assert!(!pool.is_cooling(ip(1)));

        assert!(pool.record_batch_result(&lease, Some(451), false));
        assert!(pool.is_cooling(ip(1)));
        pool.release(lease);

        assert!(pool.try_acquire(&domain).is_none(), "cooled address is skipped");

        clock.advance(Duration::seconds(59));
        assert!(pool.try_acquire(&domain).is_none());

        clock.advance(Duration::seconds(1));
        assert!(!pool.is_cooling(ip(1)));
        assert!(pool.try_acquire(&domain).is_some());
    }

    #[test]
    fn test_single_failure_trigger() {
        let pool = allocator(vec![ip(1), ip(2)], Arc::new(ManualClock::new()));
        let domain = Domain::new("example.com");

        let Some(lease) = pool.try_acquire(&domain) else {
            panic!("address should be available");
        };
        assert!(pool.record_batch_result(&lease, Some(421), false));
        pool.release(lease);

        // Only the second address is eligible now
        let next = pool.try_acquire(&domain);
        assert_eq!(next.as_ref().map(AddressLease::address), Some(ip(2)));
    }

    #[test]
    fn test_non_trigger_codes_are_ignored() {
        let pool = allocator(vec![ip(1)], Arc::new(ManualClock::new()));
        let domain = Domain::new("example.com");

        let Some(lease) = pool.try_acquire(&domain) else {
            panic!("address should be available");
        };
        for _ in 0..10 {
            assert!(!pool.record_batch_result(&lease, Some(550), false));
            assert!(!pool.record_batch_result(&lease, None, false));
        }

        let stats = pool.stats();
        assert_eq!(stats[0].failure_streak, 0);
        assert_eq!(stats[0].active_leases, 1);
        assert_eq!(stats[0].cooled_until, None);
    }

    #[test]
    fn test_trigger_codes_share_one_streak() {
        let pool = allocator(vec![ip(1)], Arc::new(ManualClock::new()));
        let domain = Domain::new("example.com");

        let Some(lease) = pool.try_acquire(&domain) else {
            panic!("address should be available");
        };

        // 450 then 451 count toward the same streak
        assert!(!pool.record_batch_result(&lease, Some(450), false));
        assert_eq!(pool.stats()[0].failure_streak, 1);
        assert!(pool.record_batch_result(&lease, Some(451), false));
        assert!(pool.is_cooling(ip(1)));
        assert_eq!(pool.stats()[0].failure_streak, 0);
    }
}

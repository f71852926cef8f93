//! Attachment slot groups
//!
//! Batches carrying attachments are expensive to transfer, so each traffic
//! class has a bounded number of slots for them. A slot is held for the
//! whole attempt and handed back when it finishes.
//!
//! # Example
//!
//! ```text
//! max_in_flight: 8, bulk_max_in_flight: 2, realtime_max_in_flight: 0
//! - Bulk attachment batches: at most 2 in flight
//! - Realtime attachment batches: at most 8 in flight (global fallback)
//! - Batches without attachments never take a slot
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::TrafficClass;

/// Configuration for attachment slots
///
/// A limit of 0 defers to `max_in_flight`; when that is also 0 the class is
/// unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Fallback limit for both classes
    #[serde(default)]
    pub max_in_flight: usize,

    #[serde(default)]
    pub realtime_max_in_flight: usize,

    #[serde(default)]
    pub bulk_max_in_flight: usize,
}

impl SlotConfig {
    /// Effective limit for `class`, or `None` if unbounded
    #[must_use]
    pub const fn limit(&self, class: TrafficClass) -> Option<usize> {
        let specific = match class {
            TrafficClass::Realtime => self.realtime_max_in_flight,
            TrafficClass::Bulk => self.bulk_max_in_flight,
        };

        match (specific, self.max_in_flight) {
            (0, 0) => None,
            (0, global) => Some(global),
            (limit, _) => Some(limit),
        }
    }
}

#[derive(Debug)]
struct SlotGroup {
    in_use: AtomicUsize,
    limit: Option<usize>,
}

impl SlotGroup {
    const fn new(limit: Option<usize>) -> Self {
        Self {
            in_use: AtomicUsize::new(0),
            limit,
        }
    }

    fn try_acquire(&self) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };

        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                (in_use < limit).then_some(in_use + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        if self.limit.is_none() {
            return;
        }

        // Never wrap below zero on an unmatched release
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use.checked_sub(1)
            });
    }
}

/// Per-class attachment slot counters
#[derive(Debug)]
pub struct SlotGroups {
    realtime: SlotGroup,
    bulk: SlotGroup,
}

impl SlotGroups {
    #[must_use]
    pub const fn new(config: &SlotConfig) -> Self {
        Self {
            realtime: SlotGroup::new(config.limit(TrafficClass::Realtime)),
            bulk: SlotGroup::new(config.limit(TrafficClass::Bulk)),
        }
    }

    const fn group(&self, class: TrafficClass) -> &SlotGroup {
        match class {
            TrafficClass::Realtime => &self.realtime,
            TrafficClass::Bulk => &self.bulk,
        }
    }

    /// Whether batches of `class` need a slot at all
    #[must_use]
    pub const fn is_limited(&self, class: TrafficClass) -> bool {
        self.group(class).limit.is_some()
    }

    /// Take a slot for `class` if one is free
    #[must_use]
    pub fn try_acquire(&self, class: TrafficClass) -> bool {
        self.group(class).try_acquire()
    }

    pub fn release(&self, class: TrafficClass) {
        self.group(class).release();
    }

    #[must_use]
    pub fn in_use(&self, class: TrafficClass) -> usize {
        self.group(class).in_use.load(Ordering::Acquire)
    }
}

//! Monotonic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::instruments::Instrument;
use crate::metrics::MetricSettings;

/// Counts events. Increments are non-negative; the accumulated count is
/// returned (and optionally reset) by snapshots.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Adds one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `times`.
    pub fn increment_by(&self, times: u64) {
        self.value.fetch_add(times, Ordering::Relaxed);
    }

    /// The count accumulated since the last reset.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self, reset: bool) -> u64 {
        if reset {
            self.value.swap(0, Ordering::Relaxed)
        } else {
            self.value.load(Ordering::Relaxed)
        }
    }
}

impl Instrument for Counter {
    fn create(_settings: &MetricSettings) -> Self {
        Counter::default()
    }
}

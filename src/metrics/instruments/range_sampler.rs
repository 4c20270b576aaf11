//! Range samplers: distributions of a sampled concurrent-token count.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::metrics::digest::Digest;
use crate::metrics::instruments::Instrument;
use crate::metrics::{MetricSettings, RangeSnapshot};

/// Counts tokens acquired and released by in-flight work and records the
/// observed count into a distribution on every scheduled refresh.
#[derive(Debug)]
pub struct RangeSampler {
    current: AtomicI64,
    last_sampled: AtomicI64,
    digest: Mutex<Digest>,
}

impl RangeSampler {
    /// Acquires one token.
    pub fn increment(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquires `tokens` tokens.
    pub fn increment_by(&self, tokens: i64) {
        self.current.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Releases one token.
    pub fn decrement(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
    }

    /// Releases `tokens` tokens.
    pub fn decrement_by(&self, tokens: i64) {
        self.current.fetch_sub(tokens, Ordering::Relaxed);
    }

    /// The current token count.
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Records the current token count into the distribution. Invoked by
    /// the registry's refresh scheduler at the configured
    /// `auto_update_interval`.
    pub fn sample(&self) {
        let observed = self.current.load(Ordering::Relaxed);
        self.last_sampled.store(observed, Ordering::Relaxed);
        self.digest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(observed.max(0) as u64);
    }

    pub(crate) fn snapshot(&self, reset: bool) -> RangeSnapshot {
        RangeSnapshot {
            distribution: self
                .digest
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .snapshot(reset),
            last: self.last_sampled.load(Ordering::Relaxed),
        }
    }
}

impl Instrument for RangeSampler {
    fn create(settings: &MetricSettings) -> Self {
        RangeSampler {
            current: AtomicI64::new(0),
            last_sampled: AtomicI64::new(0),
            digest: Mutex::new(Digest::new(
                &settings.dynamic_range.clone().unwrap_or_default(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_capture_the_token_count() {
        let sampler = RangeSampler::create(&MetricSettings::default());
        sampler.increment_by(3);
        sampler.sample();
        sampler.decrement();
        sampler.sample();

        let snapshot = sampler.snapshot(true);
        assert_eq!(snapshot.distribution.count, 2);
        assert_eq!(snapshot.distribution.max, 3);
        assert_eq!(snapshot.last, 2);
    }

    #[test]
    fn negative_counts_are_clamped_to_zero_in_the_distribution() {
        let sampler = RangeSampler::create(&MetricSettings::default());
        sampler.decrement_by(5);
        sampler.sample();

        let snapshot = sampler.snapshot(false);
        assert_eq!(snapshot.last, -5);
        assert_eq!(snapshot.distribution.count, 1);
        assert_eq!(snapshot.distribution.max, 1); // clamped to range floor
    }

    #[test]
    fn reset_keeps_current_and_last() {
        let sampler = RangeSampler::create(&MetricSettings::default());
        sampler.increment();
        sampler.sample();
        let _ = sampler.snapshot(true);

        assert_eq!(sampler.current(), 1);
        assert_eq!(sampler.snapshot(false).last, 1);
    }
}

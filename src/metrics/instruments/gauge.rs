//! Instantaneous-value gauges.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::instruments::Instrument;
use crate::metrics::MetricSettings;

/// Tracks a floating-point value that can move in both directions.
/// Snapshots read the instantaneous value and never reset it.
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    /// Sets the value.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Adds `delta` (which may be negative).
    pub fn add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Adds one.
    pub fn increment(&self) {
        self.add(1.0);
    }

    /// Subtracts one.
    pub fn decrement(&self) {
        self.add(-1.0);
    }

    /// The current value.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Instrument for Gauge {
    fn create(_settings: &MetricSettings) -> Self {
        Gauge::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_add_and_read() {
        let gauge = Gauge::default();
        gauge.set(10.5);
        gauge.add(2.0);
        gauge.decrement();
        assert_eq!(gauge.value(), 11.5);
    }

    #[test]
    fn reading_does_not_reset() {
        let gauge = Gauge::default();
        gauge.set(3.0);
        assert_eq!(gauge.value(), 3.0);
        assert_eq!(gauge.value(), 3.0);
    }

    #[test]
    fn concurrent_adds_converge() {
        use std::sync::Arc;

        let gauge = Arc::new(Gauge::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gauge = gauge.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        gauge.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gauge.value(), 4_000.0);
    }
}

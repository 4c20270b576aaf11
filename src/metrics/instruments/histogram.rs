//! Histograms and timers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::metrics::digest::Digest;
use crate::metrics::instruments::Instrument;
use crate::metrics::{Distribution, MetricSettings};

/// Records non-negative values into a high-dynamic-range digest.
///
/// Recording takes a short critical section on the cell's own digest;
/// cells of other instruments (and snapshots of other instruments) are
/// never contended.
#[derive(Debug)]
pub struct Histogram {
    digest: Mutex<Digest>,
}

impl Histogram {
    /// Records one value.
    pub fn record(&self, value: u64) {
        self.digest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(value);
    }

    /// Records one value `times` times.
    pub fn record_n(&self, value: u64, times: u64) {
        self.digest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_n(value, times);
    }

    pub(crate) fn snapshot(&self, reset: bool) -> Distribution {
        self.digest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot(reset)
    }
}

impl Instrument for Histogram {
    fn create(settings: &MetricSettings) -> Self {
        Histogram {
            digest: Mutex::new(Digest::new(
                &settings.dynamic_range.clone().unwrap_or_default(),
            )),
        }
    }
}

/// A histogram of durations, recorded in nanoseconds.
#[derive(Debug)]
pub struct Timer {
    histogram: Histogram,
}

impl Timer {
    /// Records an elapsed duration.
    pub fn record(&self, elapsed: Duration) {
        self.histogram
            .record(elapsed.as_nanos().min(u64::MAX as u128) as u64);
    }

    /// Records a raw nanosecond measurement.
    pub fn record_nanos(&self, nanos: u64) {
        self.histogram.record(nanos);
    }

    /// Starts a measurement; [`StartedTimer::stop`] records it.
    pub fn start(&self) -> StartedTimer<'_> {
        StartedTimer {
            timer: self,
            from: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self, reset: bool) -> Distribution {
        self.histogram.snapshot(reset)
    }
}

impl Instrument for Timer {
    fn create(settings: &MetricSettings) -> Self {
        Timer {
            histogram: Histogram::create(settings),
        }
    }
}

/// An in-flight timer measurement.
#[derive(Debug)]
pub struct StartedTimer<'a> {
    timer: &'a Timer,
    from: Instant,
}

impl StartedTimer<'_> {
    /// Stops the measurement and records the elapsed time.
    pub fn stop(self) {
        self.timer.record(self.from.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::DynamicRange;

    fn histogram() -> Histogram {
        Histogram::create(&MetricSettings {
            dynamic_range: Some(DynamicRange {
                lowest_discernible_value: 1,
                highest_trackable_value: 1_000_000_000,
                significant_value_digits: 2,
            }),
            ..MetricSettings::default()
        })
    }

    #[test]
    fn records_show_up_in_the_distribution() {
        let histogram = histogram();
        histogram.record(100);
        histogram.record(200);
        histogram.record_n(300, 3);

        let snapshot = histogram.snapshot(true);
        assert_eq!(snapshot.count, 5);
        assert_eq!(snapshot.min, 100);
        assert!(snapshot.max >= 300);
        assert_eq!(histogram.snapshot(true).count, 0);
    }

    #[test]
    fn timer_records_nanoseconds() {
        let timer = Timer::create(&MetricSettings::default());
        timer.record(Duration::from_micros(150));

        let snapshot = timer.snapshot(false);
        assert_eq!(snapshot.count, 1);
        assert!(snapshot.min >= 149_000 && snapshot.min <= 151_000);
    }

    #[test]
    fn started_timer_measures_elapsed_time() {
        let timer = Timer::create(&MetricSettings::default());
        let started = timer.start();
        std::thread::sleep(Duration::from_millis(2));
        started.stop();

        let snapshot = timer.snapshot(false);
        assert_eq!(snapshot.count, 1);
        assert!(snapshot.min >= 1_000_000, "recorded {}", snapshot.min);
    }
}

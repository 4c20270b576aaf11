//! Wall-clock readings anchored to the monotonic clock.

use std::time::{Duration, Instant, SystemTime};

/// Produces span and snapshot timestamps.
///
/// A `Clock` pairs one wall-clock reading taken at creation with the
/// monotonic clock. Subsequent readings are the anchor plus monotonic
/// elapsed time, so timestamps taken from the same clock never go
/// backwards even if the system wall clock is adjusted, and the start and
/// finish instants of a span always satisfy `start <= finish`.
#[derive(Clone, Debug)]
pub struct Clock {
    wall_anchor: SystemTime,
    monotonic_anchor: Instant,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Clock {
        Clock {
            wall_anchor: SystemTime::now(),
            monotonic_anchor: Instant::now(),
        }
    }

    /// The current skew-corrected wall-clock time.
    pub fn now(&self) -> SystemTime {
        self.wall_anchor + self.monotonic_anchor.elapsed()
    }

    /// Nanoseconds elapsed from `earlier` to `later`, zero when the
    /// arguments are out of order (possible only when they come from
    /// different clocks).
    pub fn nanos_between(earlier: SystemTime, later: SystemTime) -> u64 {
        later
            .duration_since(earlier)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
            .min(u64::MAX as u128) as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_are_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn nanos_between_clamps_reversed_arguments() {
        let clock = Clock::new();
        let earlier = clock.now();
        let later = earlier + Duration::from_millis(5);
        assert_eq!(Clock::nanos_between(earlier, later), 5_000_000);
        assert_eq!(Clock::nanos_between(later, earlier), 0);
    }
}

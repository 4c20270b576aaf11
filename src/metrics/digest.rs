//! Compact high-dynamic-range value digest.
//!
//! Log-linear bucketing: values are split across power-of-two "buckets",
//! each linearly subdivided finely enough to keep the configured number
//! of significant decimal digits. Memory is proportional to the dynamic
//! range's magnitude, not to the number of recordings, and a snapshot can
//! reconstruct any percentile at the configured precision.

use crate::metrics::{Distribution, DistributionBucket, DynamicRange};

pub(crate) struct Digest {
    lowest: u64,
    highest: u64,
    unit_magnitude: u32,
    sub_bucket_half_count_magnitude: u32,
    sub_bucket_half_count: usize,
    sub_bucket_mask: u64,
    counts: Vec<u64>,
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
    overflow: u64,
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digest")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl Digest {
    pub(crate) fn new(range: &DynamicRange) -> Digest {
        let lowest = range.lowest_discernible_value.max(1);
        let highest = range.highest_trackable_value.max(lowest * 2);
        let digits = u32::from(range.significant_value_digits.min(5));

        // Linear subdivision fine enough for the requested precision.
        let single_unit_resolution = 2 * 10u64.pow(digits);
        let sub_bucket_count_magnitude = 64 - (single_unit_resolution - 1).leading_zeros();
        let sub_bucket_count = 1usize << sub_bucket_count_magnitude;
        let sub_bucket_half_count = sub_bucket_count / 2;
        let unit_magnitude = 63 - lowest.leading_zeros();
        let sub_bucket_mask = ((sub_bucket_count as u64) - 1) << unit_magnitude;

        // Power-of-two buckets until the highest trackable value fits.
        let mut smallest_untrackable = (sub_bucket_count as u64) << unit_magnitude;
        let mut buckets_needed = 1usize;
        while smallest_untrackable <= highest {
            if smallest_untrackable > u64::MAX / 2 {
                buckets_needed += 1;
                break;
            }
            smallest_untrackable <<= 1;
            buckets_needed += 1;
        }

        Digest {
            lowest,
            highest,
            unit_magnitude,
            sub_bucket_half_count_magnitude: sub_bucket_count_magnitude - 1,
            sub_bucket_half_count,
            sub_bucket_mask,
            counts: vec![0; (buckets_needed + 1) * sub_bucket_half_count],
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
            overflow: 0,
        }
    }

    fn bucket_index(&self, value: u64) -> usize {
        let base = 64 - self.unit_magnitude - self.sub_bucket_half_count_magnitude - 1;
        (base - (value | self.sub_bucket_mask).leading_zeros()) as usize
    }

    fn counts_index(&self, value: u64) -> usize {
        let bucket = self.bucket_index(value);
        let sub_bucket = (value >> (bucket as u32 + self.unit_magnitude)) as usize;
        let base = (bucket + 1) << self.sub_bucket_half_count_magnitude;
        base + sub_bucket - self.sub_bucket_half_count
    }

    fn value_at(&self, index: usize) -> u64 {
        let mut bucket = (index >> self.sub_bucket_half_count_magnitude) as isize - 1;
        let mut sub_bucket =
            (index & (self.sub_bucket_half_count - 1)) + self.sub_bucket_half_count;
        if bucket < 0 {
            sub_bucket -= self.sub_bucket_half_count;
            bucket = 0;
        }
        (sub_bucket as u64) << (bucket as u32 + self.unit_magnitude)
    }

    pub(crate) fn record(&mut self, value: u64) {
        self.record_n(value, 1);
    }

    pub(crate) fn record_n(&mut self, value: u64, times: u64) {
        if times == 0 {
            return;
        }
        let effective = if value > self.highest {
            self.overflow += times;
            self.highest
        } else if value < self.lowest {
            self.lowest
        } else {
            value
        };

        let index = self.counts_index(effective);
        self.counts[index] += times;
        self.count += times;
        self.sum += effective * times;
        self.min = self.min.min(effective);
        self.max = self.max.max(effective);
    }

    pub(crate) fn snapshot(&mut self, reset: bool) -> Distribution {
        let mut buckets = Vec::new();
        for (index, &count) in self.counts.iter().enumerate() {
            if count > 0 {
                buckets.push(DistributionBucket {
                    value: self.value_at(index),
                    count,
                });
            }
        }

        let snapshot = Distribution {
            count: self.count,
            min: if self.count == 0 { 0 } else { self.min },
            max: self.max,
            sum: self.sum,
            overflow: self.overflow,
            buckets,
        };

        if reset {
            self.counts.iter_mut().for_each(|c| *c = 0);
            self.count = 0;
            self.sum = 0;
            self.min = u64::MAX;
            self.max = 0;
            self.overflow = 0;
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lowest: u64, highest: u64, digits: u8) -> DynamicRange {
        DynamicRange {
            lowest_discernible_value: lowest,
            highest_trackable_value: highest,
            significant_value_digits: digits,
        }
    }

    #[test]
    fn records_resolve_within_precision() {
        let mut digest = Digest::new(&range(1, 3_600_000_000, 2));
        for value in [1u64, 7, 1_000, 123_456, 99_999_999] {
            digest.record(value);
        }
        let snapshot = digest.snapshot(false);
        assert_eq!(snapshot.count, 5);
        assert_eq!(snapshot.min, 1);

        // Every recorded value must land in a bucket within 1% (2
        // significant digits) of itself.
        for (recorded, bucket) in [1u64, 7, 1_000, 123_456, 99_999_999]
            .iter()
            .zip(snapshot.buckets.iter())
        {
            let low = *recorded as f64 * 0.99;
            let high = *recorded as f64 * 1.01;
            let got = bucket.value as f64;
            assert!(
                got >= low.floor() && got <= high.ceil(),
                "{recorded} resolved to {got}"
            );
        }
    }

    #[test]
    fn values_above_highest_clamp_and_count_as_overflow() {
        let mut digest = Digest::new(&range(1, 1_000, 2));
        digest.record(5_000_000);
        digest.record(10);

        let snapshot = digest.snapshot(false);
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.overflow, 1);
        assert!(snapshot.max <= 1_024, "max {} above range", snapshot.max);
    }

    #[test]
    fn values_below_lowest_count_at_lowest() {
        let mut digest = Digest::new(&range(100, 100_000, 2));
        digest.record(3);
        let snapshot = digest.snapshot(false);
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.min, 100);
    }

    #[test]
    fn reset_clears_state() {
        let mut digest = Digest::new(&range(1, 1_000_000, 2));
        digest.record_n(42, 10);
        let first = digest.snapshot(true);
        assert_eq!(first.count, 10);
        assert_eq!(first.sum, 420);

        let second = digest.snapshot(true);
        assert_eq!(second.count, 0);
        assert_eq!(second.min, 0);
        assert_eq!(second.max, 0);
        assert!(second.buckets.is_empty());
    }

    #[test]
    fn percentiles_come_from_the_bucket_list() {
        let mut digest = Digest::new(&range(1, 10_000, 3));
        for value in 1..=100u64 {
            digest.record(value);
        }
        let snapshot = digest.snapshot(false);

        let p50 = snapshot.percentile(50.0);
        let p99 = snapshot.percentile(99.0);
        assert!((49..=51).contains(&p50), "p50 was {p50}");
        assert!((98..=100).contains(&p99), "p99 was {p99}");
        assert_eq!(snapshot.percentile(100.0), snapshot.max);
    }
}

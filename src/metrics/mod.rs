//! Metrics: instruments, the registry and period snapshots.

pub(crate) mod digest;
pub mod instruments;
pub mod registry;

use std::time::{Duration, SystemTime};

use crate::tags::TagSet;

pub use instruments::counter::Counter;
pub use instruments::gauge::Gauge;
pub use instruments::histogram::{Histogram, StartedTimer, Timer};
pub use instruments::range_sampler::RangeSampler;
pub use registry::{Metric, MetricRegistry};

/// The kinds of instrument a metric name can be registered as.
///
/// A name is bound to its kind on first registration; registering it
/// again under a different kind is a configuration error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic count of events.
    Counter,
    /// Instantaneous floating-point value.
    Gauge,
    /// Distribution of recorded values.
    Histogram,
    /// Distribution of durations, in nanoseconds.
    Timer,
    /// Distribution of a sampled concurrent-token count.
    RangeSampler,
}

impl MetricKind {
    /// Human-readable kind name, also used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
            MetricKind::RangeSampler => "range sampler",
        }
    }

    pub(crate) fn config_key(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
            MetricKind::RangeSampler => "range-sampler",
        }
    }
}

/// Value range and precision of a histogram-backed instrument.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DynamicRange {
    /// Smallest value resolved at full precision; smaller recordings are
    /// counted here.
    pub lowest_discernible_value: u64,
    /// Largest trackable value; larger recordings clamp and count as
    /// overflow.
    pub highest_trackable_value: u64,
    /// Decimal digits of precision maintained across the range.
    pub significant_value_digits: u8,
}

impl Default for DynamicRange {
    fn default() -> Self {
        DynamicRange {
            lowest_discernible_value: 1,
            highest_trackable_value: 3_600_000_000_000,
            significant_value_digits: 2,
        }
    }
}

/// Settings attached to a metric at first registration.
///
/// Once a metric is published its settings are frozen; later
/// registrations with different settings keep the original and log a
/// warning.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct MetricSettings {
    /// What the metric measures.
    pub description: String,
    /// Measurement unit, free-form.
    pub unit: Option<String>,
    /// Interval at which the instrument refreshes itself, for range
    /// samplers and callback-updated instruments.
    pub auto_update_interval: Option<Duration>,
    /// Range and precision for histogram-backed instruments.
    pub dynamic_range: Option<DynamicRange>,
}

impl MetricSettings {
    /// Settings with just a description.
    pub fn describe(description: impl Into<String>) -> MetricSettings {
        MetricSettings {
            description: description.into(),
            ..MetricSettings::default()
        }
    }
}

/// One bucket of a [`Distribution`]: `count` recordings resolved to
/// `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DistributionBucket {
    /// Representative value of the bucket.
    pub value: u64,
    /// Recordings that fell into the bucket.
    pub count: u64,
}

/// Snapshot of a histogram-backed instrument.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Distribution {
    /// Total recordings.
    pub count: u64,
    /// Smallest recorded value (after clamping), 0 when empty.
    pub min: u64,
    /// Largest recorded value (after clamping), 0 when empty.
    pub max: u64,
    /// Sum of recorded values (after clamping).
    pub sum: u64,
    /// Recordings clamped down to the highest trackable value.
    pub overflow: u64,
    /// Non-empty buckets in ascending value order.
    pub buckets: Vec<DistributionBucket>,
}

impl Distribution {
    /// Value at or below which `percentile` percent of recordings fall,
    /// at the digest's configured precision. Returns 0 for an empty
    /// distribution.
    pub fn percentile(&self, percentile: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let rank = ((percentile / 100.0) * self.count as f64).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for bucket in &self.buckets {
            seen += bucket.count;
            if seen >= rank {
                return bucket.value;
            }
        }
        self.max
    }

    /// Arithmetic mean of recordings, 0 when empty.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// Snapshot of a range sampler: the sampled distribution plus the value
/// observed by the most recent sample.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RangeSnapshot {
    /// Distribution of sampled token counts.
    pub distribution: Distribution,
    /// Token count seen by the latest sample.
    pub last: i64,
}

/// One instrument (one tag set) inside a metric snapshot.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct InstrumentSnapshot<T> {
    /// The instrument's tag set.
    pub tags: TagSet,
    /// The instrument's value over the period.
    pub value: T,
}

/// Snapshot of all instruments of one metric.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct MetricSnapshot<T> {
    /// Metric name.
    pub name: String,
    /// The metric's frozen settings.
    pub settings: MetricSettings,
    /// Per-tag-set values.
    pub instruments: Vec<InstrumentSnapshot<T>>,
}

impl<T> MetricSnapshot<T> {
    /// The value recorded under `tags`, when present.
    pub fn value_of(&self, tags: &TagSet) -> Option<&T> {
        self.instruments
            .iter()
            .find(|i| &i.tags == tags)
            .map(|i| &i.value)
    }

    /// The value of the untagged instrument, when present.
    pub fn value(&self) -> Option<&T> {
        self.value_of(&TagSet::empty())
    }
}

/// A registry-wide dump of all metric values over one wall-clock period.
///
/// Periods tile: the `from` of each snapshot equals the `to` of the
/// previous one, and the very first period starts at registry creation.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PeriodSnapshot {
    /// Start of the period.
    pub from: SystemTime,
    /// End of the period.
    pub to: SystemTime,
    /// Counter metrics.
    pub counters: Vec<MetricSnapshot<u64>>,
    /// Gauge metrics.
    pub gauges: Vec<MetricSnapshot<f64>>,
    /// Histogram metrics.
    pub histograms: Vec<MetricSnapshot<Distribution>>,
    /// Timer metrics.
    pub timers: Vec<MetricSnapshot<Distribution>>,
    /// Range-sampler metrics.
    pub range_samplers: Vec<MetricSnapshot<RangeSnapshot>>,
}

impl PeriodSnapshot {
    /// Looks up a counter metric by name.
    pub fn counter(&self, name: &str) -> Option<&MetricSnapshot<u64>> {
        self.counters.iter().find(|m| m.name == name)
    }

    /// Looks up a gauge metric by name.
    pub fn gauge(&self, name: &str) -> Option<&MetricSnapshot<f64>> {
        self.gauges.iter().find(|m| m.name == name)
    }

    /// Looks up a histogram metric by name.
    pub fn histogram(&self, name: &str) -> Option<&MetricSnapshot<Distribution>> {
        self.histograms.iter().find(|m| m.name == name)
    }

    /// Looks up a timer metric by name.
    pub fn timer(&self, name: &str) -> Option<&MetricSnapshot<Distribution>> {
        self.timers.iter().find(|m| m.name == name)
    }

    /// Looks up a range-sampler metric by name.
    pub fn range_sampler(&self, name: &str) -> Option<&MetricSnapshot<RangeSnapshot>> {
        self.range_samplers.iter().find(|m| m.name == name)
    }
}

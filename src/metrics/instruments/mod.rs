//! Measurement instruments: the per-tag-set cells measurements land in.

pub mod counter;
pub mod gauge;
pub mod histogram;
pub mod range_sampler;

use crate::metrics::MetricSettings;

/// A measurement cell. One instance exists per (metric, tag set) pair and
/// is shared by every call site holding that pair.
pub trait Instrument: Send + Sync + 'static {
    /// Creates a cell from the metric's frozen settings.
    fn create(settings: &MetricSettings) -> Self;
}

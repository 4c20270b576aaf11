//! Sampling strategies for new traces.

use std::cell::RefCell;
use std::fmt;

use rand::{rngs, Rng, SeedableRng};

use crate::trace::tracer::SpanBuilder;
use crate::trace::SamplingDecision;

pub(crate) mod adaptive;

pub use adaptive::AdaptiveSampler;

thread_local! {
    static SAMPLER_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// Decides whether a new trace is recorded.
///
/// `decide` is consulted exactly once per local trace root, at span-build
/// time; descendants inherit the root's decision. Implementations must
/// return only [`SamplingDecision::Sample`] or
/// [`SamplingDecision::DoNotSample`] and must never block on work shared
/// with snapshotting or reconfiguration.
pub trait Sampler: Send + Sync + fmt::Debug {
    /// The sampling decision for the trace this builder would root.
    fn decide(&self, builder: &SpanBuilder) -> SamplingDecision;
}

/// Samples everything or nothing.
#[derive(Clone, Copy, Debug)]
pub struct ConstantSampler {
    decision: SamplingDecision,
}

impl ConstantSampler {
    /// Samples every trace.
    pub fn always() -> ConstantSampler {
        ConstantSampler {
            decision: SamplingDecision::Sample,
        }
    }

    /// Samples no trace.
    pub fn never() -> ConstantSampler {
        ConstantSampler {
            decision: SamplingDecision::DoNotSample,
        }
    }
}

impl Sampler for ConstantSampler {
    fn decide(&self, _builder: &SpanBuilder) -> SamplingDecision {
        self.decision
    }
}

/// Samples a configured fraction of traces.
#[derive(Clone, Copy, Debug)]
pub struct RandomSampler {
    probability: f64,
    threshold: u64,
}

impl RandomSampler {
    /// Creates a sampler with the given probability, clamped to `[0, 1]`.
    pub fn new(probability: f64) -> RandomSampler {
        let clamped = probability.clamp(0.0, 1.0);
        if clamped != probability {
            tracing::warn!(
                requested = probability,
                used = clamped,
                "random sampler probability outside [0, 1], clamping"
            );
        }
        RandomSampler {
            probability: clamped,
            threshold: probability_threshold(clamped),
        }
    }

    /// The configured probability.
    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl Sampler for RandomSampler {
    fn decide(&self, _builder: &SpanBuilder) -> SamplingDecision {
        decide_with_threshold(self.threshold)
    }
}

/// Maps a probability to the `u64` draw threshold for `draw < threshold`
/// sampling. The boundaries are exact: 0 never samples, 1 always does.
pub(crate) fn probability_threshold(probability: f64) -> u64 {
    if probability >= 1.0 {
        u64::MAX
    } else if probability <= 0.0 {
        0
    } else {
        (probability * u64::MAX as f64) as u64
    }
}

/// Bernoulli draw against a precomputed threshold, with the boundary
/// thresholds short-circuited so 0 and 1 are strict.
pub(crate) fn decide_with_threshold(threshold: u64) -> SamplingDecision {
    match threshold {
        0 => SamplingDecision::DoNotSample,
        u64::MAX => SamplingDecision::Sample,
        t => {
            let draw = SAMPLER_RNG.with(|rng| rng.borrow_mut().gen::<u64>());
            if draw < t {
                SamplingDecision::Sample
            } else {
                SamplingDecision::DoNotSample
            }
        }
    }
}

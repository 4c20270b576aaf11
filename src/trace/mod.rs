//! Distributed tracing: spans, identifiers, sampling and the tracer.

pub mod identifier;
pub(crate) mod ring;
pub mod sampler;
pub mod span;
pub mod tracer;

pub use identifier::{DoubleScheme, Identifier, IdentifierScheme, SingleScheme};
pub use sampler::{AdaptiveSampler, ConstantSampler, RandomSampler, Sampler};
pub use span::{Failure, FinishedSpan, Mark, Span, SpanKind, SpanPosition};
pub use tracer::{PreFinishHook, PreStartHook, SpanBuilder, Tracer, TracerStatus};

/// Whether the spans of a trace are recorded for reporting.
///
/// The root span of a trace decides once; descendants inherit the decision
/// verbatim. `Unknown` appears on traces joined from a remote parent whose
/// carrier did not state a decision, and triggers local re-sampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplingDecision {
    /// Spans of this trace should be buffered for reporters.
    Sample,
    /// Spans of this trace are discarded on finish.
    DoNotSample,
    /// No decision has been made yet.
    Unknown,
}

/// The trace a span belongs to: an identifier plus the sampling decision
/// shared by every span under it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Trace {
    id: Identifier,
    decision: SamplingDecision,
}

impl Trace {
    /// Builds a trace handle.
    pub fn new(id: Identifier, decision: SamplingDecision) -> Trace {
        Trace { id, decision }
    }

    /// The trace with the empty identifier and no decision.
    pub fn empty() -> Trace {
        Trace {
            id: Identifier::empty(),
            decision: SamplingDecision::Unknown,
        }
    }

    /// The trace identifier.
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// The sampling decision in force for this trace.
    pub fn decision(&self) -> SamplingDecision {
        self.decision
    }

    /// `true` when the trace identifier is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

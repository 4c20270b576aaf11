//! The adaptive sampler: converges per-operation sampling probabilities
//! toward a global throughput goal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use crate::config::Config;
use crate::trace::sampler::{decide_with_threshold, probability_threshold, Sampler};
use crate::trace::tracer::SpanBuilder;
use crate::trace::SamplingDecision;

/// Rules applied to the operations matched by a configured group.
#[derive(Clone, Debug)]
struct OperationGroup {
    name: String,
    matchers: Vec<Regex>,
    /// Definitive decision overriding the balancer, when present.
    sample: Option<SamplingDecision>,
    minimum_throughput: f64,
    maximum_throughput: f64,
}

impl OperationGroup {
    fn matches(&self, operation: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(operation))
    }
}

struct OperationState {
    /// Draw threshold published by [`AdaptiveSampler::adapt`]; decisions
    /// read this and nothing else.
    threshold: AtomicU64,
    /// Calls observed since the last adapt tick.
    calls: AtomicU64,
    /// Samples produced since the last adapt tick.
    samples: AtomicU64,
    /// Index into `groups`, when a group matched this operation.
    group: Option<usize>,
}

impl OperationState {
    fn new(group: Option<usize>, initial_threshold: u64) -> OperationState {
        OperationState {
            threshold: AtomicU64::new(initial_threshold),
            calls: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            group,
        }
    }
}

/// Balances a global per-second trace budget across the operation names
/// seen at trace roots.
///
/// Decisions are a Bernoulli draw against a per-operation threshold that
/// [`AdaptiveSampler::adapt`] republishes once per second from the
/// observed call counts; the recomputation shares no locks with the
/// decision path. Operations that have not yet been observed over a full
/// interval start fully sampled so rare operations are not starved.
pub struct AdaptiveSampler {
    throughput: f64,
    groups: Vec<OperationGroup>,
    operations: DashMap<String, Arc<OperationState>>,
}

impl AdaptiveSampler {
    /// Creates a sampler with a plain throughput goal and no groups.
    pub fn new(throughput: f64) -> AdaptiveSampler {
        AdaptiveSampler {
            throughput: throughput.max(0.0),
            groups: Vec::new(),
            operations: DashMap::new(),
        }
    }

    /// Builds the sampler from the `trace.adaptive-sampler` subtree.
    ///
    /// Group entries that fail to parse (bad regex, unknown `sample`
    /// value) are skipped with a logged warning rather than failing the
    /// whole sampler.
    pub fn from_config(config: &Config) -> AdaptiveSampler {
        let throughput = config
            .get_f64("trace.adaptive-sampler.throughput")
            .unwrap_or(600.0);

        let mut groups = Vec::new();
        for group_name in config.child_keys("trace.adaptive-sampler.groups") {
            let base = format!("trace.adaptive-sampler.groups.{group_name}");
            let mut matchers = Vec::new();
            for pattern in config.get_string_list(&format!("{base}.operations")) {
                match Regex::new(&pattern) {
                    Ok(regex) => matchers.push(regex),
                    Err(error) => tracing::warn!(
                        group = %group_name,
                        pattern = %pattern,
                        %error,
                        "skipping unparseable operation matcher"
                    ),
                }
            }
            if matchers.is_empty() {
                tracing::warn!(group = %group_name, "skipping group with no usable matchers");
                continue;
            }

            let sample = match config.get_str(&format!("{base}.sample")) {
                Some("always") => Some(SamplingDecision::Sample),
                Some("never") => Some(SamplingDecision::DoNotSample),
                Some(other) => {
                    tracing::warn!(
                        group = %group_name,
                        value = other,
                        "unknown sample rule, treating group as balanced"
                    );
                    None
                }
                None => None,
            };

            groups.push(OperationGroup {
                name: group_name,
                matchers,
                sample,
                minimum_throughput: config
                    .get_f64(&format!("{base}.minimum-throughput"))
                    .unwrap_or(0.0)
                    .max(0.0),
                maximum_throughput: config
                    .get_f64(&format!("{base}.maximum-throughput"))
                    .unwrap_or(f64::INFINITY),
            });
        }

        AdaptiveSampler {
            throughput: throughput.max(0.0),
            groups,
            operations: DashMap::new(),
        }
    }

    fn state_for(&self, operation: &str) -> Arc<OperationState> {
        if let Some(existing) = self.operations.get(operation) {
            return existing.clone();
        }
        self.operations
            .entry(operation.to_owned())
            .or_insert_with(|| {
                let group = self.groups.iter().position(|g| g.matches(operation));
                let initial = match group.and_then(|i| self.groups[i].sample) {
                    Some(SamplingDecision::DoNotSample) => 0,
                    _ => u64::MAX,
                };
                Arc::new(OperationState::new(group, initial))
            })
            .clone()
    }

    fn bounds(&self, group: Option<usize>) -> (f64, f64) {
        group
            .map(|i| {
                (
                    self.groups[i].minimum_throughput,
                    self.groups[i].maximum_throughput,
                )
            })
            .unwrap_or((0.0, f64::INFINITY))
    }

    /// Recomputes per-operation thresholds from the last interval's call
    /// counts. Scheduled once per second by the tracer; safe to call from
    /// any thread, and never blocks a concurrent decision.
    pub fn adapt(&self) {
        let mut active: Vec<(Arc<OperationState>, f64)> = Vec::new();
        let mut sampled_last_interval = 0u64;

        for entry in self.operations.iter() {
            let state = entry.value().clone();
            let calls = state.calls.swap(0, Ordering::Relaxed);
            sampled_last_interval += state.samples.swap(0, Ordering::Relaxed);

            if state.group.map(|i| self.groups[i].sample.is_some()) == Some(true) {
                continue;
            }
            if calls == 0 {
                // Idle operations stay fully sampled so a rare call gets
                // through; they contribute nothing to the budget below.
                state.threshold.store(u64::MAX, Ordering::Relaxed);
            } else {
                active.push((state, calls as f64));
            }
        }

        tracing::debug!(
            operations = self.operations.len(),
            sampled = sampled_last_interval,
            "adaptive sampler interval complete"
        );

        if active.is_empty() {
            return;
        }

        let total_calls: f64 = active.iter().map(|(_, calls)| calls).sum();
        let mut remaining = self.throughput;
        let mut allocations = vec![0.0f64; active.len()];

        for (i, (state, calls)) in active.iter().enumerate() {
            let (minimum, maximum) = self.bounds(state.group);
            let allocation = minimum.min(maximum).min(*calls);
            allocations[i] = allocation;
            remaining -= allocation;
        }
        remaining = remaining.max(0.0);

        for (i, (state, calls)) in active.iter().enumerate() {
            let (_, maximum) = self.bounds(state.group);
            let share = remaining * (calls / total_calls);
            let allocation = (allocations[i] + share).min(maximum).min(*calls);
            let probability = (allocation / calls).clamp(0.0, 1.0);
            state
                .threshold
                .store(probability_threshold(probability), Ordering::Relaxed);
        }
    }
}

impl Sampler for AdaptiveSampler {
    fn decide(&self, builder: &SpanBuilder) -> SamplingDecision {
        let state = self.state_for(builder.operation_name());
        state.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(decision) = state.group.and_then(|i| self.groups[i].sample) {
            if decision == SamplingDecision::Sample {
                state.samples.fetch_add(1, Ordering::Relaxed);
            }
            return decision;
        }

        let decision = decide_with_threshold(state.threshold.load(Ordering::Relaxed));
        if decision == SamplingDecision::Sample {
            state.samples.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }
}

impl std::fmt::Debug for AdaptiveSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSampler")
            .field("throughput", &self.throughput)
            .field(
                "groups",
                &self.groups.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

//! The tracer: span building, sampling, and the finished-span buffer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use once_cell::sync::OnceCell;

use crate::clock::Clock;
use crate::config::Config;
use crate::context::Context;
use crate::extension::FactoryRegistry;
use crate::metrics::{Metric, MetricRegistry, MetricSettings, Timer};
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::tags::{TagSetBuilder, TagValue};
use crate::trace::ring::SpanRing;
use crate::trace::sampler::{AdaptiveSampler, ConstantSampler, RandomSampler, Sampler};
use crate::trace::span::{FinishedSpan, OnFinish, SpanFlags};
use crate::trace::{
    DoubleScheme, Identifier, IdentifierScheme, Mark, SamplingDecision, SingleScheme, Span,
    SpanKind, SpanPosition, Trace,
};

/// Runs against every span builder before the span is assembled.
pub trait PreStartHook: Send + Sync {
    /// Inspect or adjust the builder. Panics are contained and logged.
    fn before_start(&self, builder: &mut SpanBuilder);
}

/// Runs against every span right before it finishes.
pub trait PreFinishHook: Send + Sync {
    /// Inspect or adjust the still-open span. Panics are contained and
    /// logged.
    fn before_finish(&self, span: &Span);
}

/// Named factories for the tracer's extension points. Built-in samplers
/// and identifier schemes are preregistered; hosts add their own before
/// configuring the tracer.
pub struct TraceExtensions {
    /// Samplers selectable via `trace.sampler`.
    pub samplers: FactoryRegistry<Arc<dyn Sampler>>,
    /// Identifier schemes selectable via `trace.identifier-scheme`.
    pub identifier_schemes: FactoryRegistry<Arc<dyn IdentifierScheme>>,
    /// Hooks selectable via `trace.hooks.pre-start`.
    pub pre_start_hooks: FactoryRegistry<Arc<dyn PreStartHook>>,
    /// Hooks selectable via `trace.hooks.pre-finish`.
    pub pre_finish_hooks: FactoryRegistry<Arc<dyn PreFinishHook>>,
}

impl TraceExtensions {
    /// A registry set with the built-in names registered.
    pub fn with_builtins() -> TraceExtensions {
        let samplers: FactoryRegistry<Arc<dyn Sampler>> = FactoryRegistry::new();
        samplers.register("always", |_| Arc::new(ConstantSampler::always()));
        samplers.register("never", |_| Arc::new(ConstantSampler::never()));
        samplers.register("random", |config: &Config| {
            let probability = config
                .get_f64("trace.random-sampler.probability")
                .unwrap_or(0.01);
            Arc::new(RandomSampler::new(probability)) as Arc<dyn Sampler>
        });
        samplers.register("adaptive", |config: &Config| {
            Arc::new(AdaptiveSampler::from_config(config)) as Arc<dyn Sampler>
        });

        let identifier_schemes: FactoryRegistry<Arc<dyn IdentifierScheme>> = FactoryRegistry::new();
        identifier_schemes.register("single", |_| Arc::new(SingleScheme::default()));
        identifier_schemes.register("double", |_| Arc::new(DoubleScheme::default()));

        TraceExtensions {
            samplers,
            identifier_schemes,
            pre_start_hooks: FactoryRegistry::new(),
            pre_finish_hooks: FactoryRegistry::new(),
        }
    }
}

impl std::fmt::Debug for TraceExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceExtensions").finish_non_exhaustive()
    }
}

/// The tracer's immutable configuration snapshot; reconfiguration swaps
/// the whole snapshot.
struct ActiveConfig {
    sampler: Arc<dyn Sampler>,
    identifier_scheme: Arc<dyn IdentifierScheme>,
    join_remote_parents_with_same_span_id: bool,
    include_error_stacktrace: bool,
    tag_with_initiator_service: bool,
    tag_with_parent_operation: bool,
    pre_start_hooks: Vec<Arc<dyn PreStartHook>>,
    pre_finish_hooks: Vec<Arc<dyn PreFinishHook>>,
}

pub(crate) struct TracerInner {
    clock: Clock,
    metrics: Arc<MetricRegistry>,
    span_metric: OnceCell<Arc<Metric<Timer>>>,
    scheduler: Arc<dyn Scheduler>,
    extensions: Arc<TraceExtensions>,
    active: RwLock<Arc<ActiveConfig>>,
    ring: RwLock<Arc<SpanRing>>,
    dropped_in_replaced_rings: AtomicU64,
    adaptive_tick: Mutex<Option<ScheduleHandle>>,
    reconfigure_lock: Mutex<()>,
    on_finish: OnFinish,
}

/// Counters and limits reported by [`Tracer::status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TracerStatus {
    /// Capacity of the finished-span buffer.
    pub queue_capacity: usize,
    /// Finished spans dropped because the buffer was full, including
    /// drops in buffers replaced by reconfiguration.
    pub dropped_spans: u64,
}

/// Creates spans and buffers the finished ones for reporters to drain.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// Builds a tracer from the given configuration.
    pub fn new(
        clock: Clock,
        metrics: Arc<MetricRegistry>,
        scheduler: Arc<dyn Scheduler>,
        extensions: Arc<TraceExtensions>,
        config: &Config,
    ) -> Tracer {
        let (active, adaptive_tick) = build_active(&extensions, scheduler.as_ref(), config);
        let queue_size = reporter_queue_size(config);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<TracerInner>| {
            let for_callback = weak.clone();
            let on_finish: OnFinish = Arc::new(move |finished: FinishedSpan| {
                if let Some(inner) = for_callback.upgrade() {
                    inner.handle_finished(finished);
                }
            });
            TracerInner {
                clock,
                metrics,
                span_metric: OnceCell::new(),
                scheduler,
                extensions,
                active: RwLock::new(active),
                ring: RwLock::new(Arc::new(SpanRing::with_capacity(queue_size))),
                dropped_in_replaced_rings: AtomicU64::new(0),
                adaptive_tick: Mutex::new(adaptive_tick),
                reconfigure_lock: Mutex::new(()),
                on_finish,
            }
        });

        Tracer { inner }
    }

    /// Starts describing a new span.
    pub fn span_builder(&self, operation_name: impl Into<String>) -> SpanBuilder {
        SpanBuilder {
            tracer: Some(self.clone()),
            operation_name: operation_name.into(),
            kind: SpanKind::Unknown,
            span_tags: TagSetBuilder::default(),
            metric_tags: TagSetBuilder::default(),
            marks: Vec::new(),
            context: None,
            parent: None,
            ignore_parent_from_context: false,
            suggested_trace_id: Identifier::empty(),
            track_metrics: true,
        }
    }

    /// Drains every finished span currently buffered. Reporters poll this
    /// on their own cadence; the tracer never pushes.
    pub fn spans(&self) -> Vec<FinishedSpan> {
        let ring = self
            .inner
            .ring
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        ring.drain()
    }

    /// Buffer capacity and loss counters.
    pub fn status(&self) -> TracerStatus {
        let ring = self
            .inner
            .ring
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        TracerStatus {
            queue_capacity: ring.capacity(),
            dropped_spans: ring.dropped()
                + self.inner.dropped_in_replaced_rings.load(Ordering::Relaxed),
        }
    }

    /// Applies a new configuration: sampler, identifier scheme, hooks,
    /// span-metric tagging and the reporter queue.
    ///
    /// Shrinking (or growing) `trace.reporter-queue-size` replaces the
    /// buffer; buffered spans are migrated best-effort and anything the
    /// new buffer cannot hold counts as dropped.
    pub fn reconfigure(&self, config: &Config) {
        let _serialize = self
            .inner
            .reconfigure_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let (active, adaptive_tick) =
            build_active(&self.inner.extensions, self.inner.scheduler.as_ref(), config);

        let previous_tick = {
            let mut slot = self
                .inner
                .adaptive_tick
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *slot, adaptive_tick)
        };
        if let Some(tick) = previous_tick {
            tick.cancel();
        }

        *self.inner.active.write().unwrap_or_else(|e| e.into_inner()) = active;

        let desired = reporter_queue_size(config);
        let current_capacity = self
            .inner
            .ring
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .capacity();
        if desired.max(2).next_power_of_two() != current_capacity {
            let replacement = Arc::new(SpanRing::with_capacity(desired));
            let old = {
                let mut slot = self.inner.ring.write().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *slot, replacement.clone())
            };
            for span in old.drain() {
                replacement.offer(span);
            }
            self.inner
                .dropped_in_replaced_rings
                .fetch_add(old.dropped(), Ordering::Relaxed);
        }
    }

    fn start_span(&self, mut builder: SpanBuilder, at: SystemTime) -> Span {
        let inner = &self.inner;
        let active = inner.active.read().unwrap_or_else(|e| e.into_inner()).clone();

        for hook in &active.pre_start_hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook.before_start(&mut builder)));
            if outcome.is_err() {
                tracing::warn!(
                    operation = %builder.operation_name,
                    "pre-start hook panicked, continuing"
                );
            }
        }

        let context = builder.context.take().unwrap_or_else(Context::current);

        if active.tag_with_initiator_service {
            if let Some(initiator) = context.tags().get("initiator.name") {
                builder
                    .metric_tags
                    .insert("initiator.name", initiator.clone());
            }
        }

        let parent = builder.parent.take().unwrap_or_else(|| {
            if builder.ignore_parent_from_context {
                Span::empty()
            } else {
                context.span().clone()
            }
        });

        let local_parent = (!parent.is_empty() && !parent.is_remote()).then(|| parent.clone());

        let join_remote_parent = parent.is_remote()
            && builder.kind == SpanKind::Server
            && active.join_remote_parents_with_same_span_id;
        let (span_id, parent_id) = if join_remote_parent {
            (parent.id(), parent.parent_id())
        } else {
            (active.identifier_scheme.new_span_id(), parent.id())
        };

        let parent_trace = parent.trace();
        let trace_id = if !parent_trace.id().is_empty() {
            parent_trace.id().clone()
        } else if !builder.suggested_trace_id.is_empty() {
            builder.suggested_trace_id.clone()
        } else {
            active.identifier_scheme.new_trace_id()
        };

        let position = if parent.is_empty() {
            SpanPosition::Root
        } else if parent.is_remote() {
            SpanPosition::LocalRoot
        } else {
            SpanPosition::Unknown
        };

        let decision = if parent.is_empty() || parent_trace.decision() == SamplingDecision::Unknown
        {
            match catch_unwind(AssertUnwindSafe(|| active.sampler.decide(&builder))) {
                Ok(SamplingDecision::Sample) => SamplingDecision::Sample,
                Ok(_) => SamplingDecision::DoNotSample,
                Err(_) => {
                    tracing::error!(
                        operation = %builder.operation_name,
                        "sampler panicked, not sampling this trace"
                    );
                    SamplingDecision::DoNotSample
                }
            }
        } else {
            parent_trace.decision()
        };

        Span::local(
            span_id,
            parent_id,
            Trace::new(trace_id, decision),
            position,
            builder.kind,
            builder.operation_name,
            at,
            inner.clock.clone(),
            builder.span_tags,
            builder.metric_tags,
            builder.marks,
            SpanFlags {
                track_metrics: builder.track_metrics,
                tag_with_parent_operation: active.tag_with_parent_operation,
                include_error_stacktrace: active.include_error_stacktrace,
            },
            local_parent.as_ref(),
            inner.on_finish.clone(),
            active.pre_finish_hooks.clone(),
        )
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("Tracer")
            .field("queue_capacity", &status.queue_capacity)
            .field("dropped_spans", &status.dropped_spans)
            .finish()
    }
}

impl Drop for TracerInner {
    fn drop(&mut self) {
        if let Some(tick) = self
            .adaptive_tick
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tick.cancel();
        }
    }
}

impl TracerInner {
    fn handle_finished(&self, span: FinishedSpan) {
        if span.trace.decision() != SamplingDecision::Sample {
            return;
        }
        if span.track_metrics {
            self.record_span_metric(&span);
        }
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner()).clone();
        ring.offer(span);
    }

    fn record_span_metric(&self, span: &FinishedSpan) {
        let elapsed = Clock::nanos_between(span.start, span.finish);
        let tags = span
            .metric_tags
            .with_tag("operation", span.operation_name.as_str())
            .with_tag("kind", span.kind.as_str())
            .with_tag("error", span.failure.is_some());

        // Registered once and cached, keeping the registry's registration
        // mutex off the span-finish path.
        let metric = self.span_metric.get_or_try_init(|| {
            self.metrics.timer(
                "span.processing-time",
                MetricSettings::describe("Time between the start and finish of spans"),
            )
        });
        match metric {
            Ok(metric) => metric.with_tags(tags).record_nanos(elapsed),
            Err(error) => tracing::error!(%error, "could not record the span metric"),
        }
    }
}

fn reporter_queue_size(config: &Config) -> usize {
    config
        .get_i64("trace.reporter-queue-size")
        .unwrap_or(4096)
        .max(1) as usize
}

fn build_active(
    extensions: &TraceExtensions,
    scheduler: &dyn Scheduler,
    config: &Config,
) -> (Arc<ActiveConfig>, Option<ScheduleHandle>) {
    let sampler_name = config.get_str("trace.sampler").unwrap_or("random");
    let (sampler, adaptive_tick): (Arc<dyn Sampler>, Option<ScheduleHandle>) = if sampler_name
        == "adaptive"
    {
        // The adaptive sampler needs its one-second adaptation tick; it
        // is wired here so reconfiguring away from it stops the tick.
        let adaptive = Arc::new(AdaptiveSampler::from_config(config));
        let ticked = adaptive.clone();
        let handle =
            scheduler.schedule_repeated(Duration::from_secs(1), Box::new(move || ticked.adapt()));
        (adaptive, Some(handle))
    } else {
        match extensions.samplers.create(sampler_name, config) {
            Ok(sampler) => (sampler, None),
            Err(error) => {
                tracing::error!(
                    %error,
                    "failed to instantiate the configured sampler, sampling 10% of traces"
                );
                (Arc::new(RandomSampler::new(0.1)), None)
            }
        }
    };

    let scheme_name = config.get_str("trace.identifier-scheme").unwrap_or("single");
    let identifier_scheme: Arc<dyn IdentifierScheme> =
        match extensions.identifier_schemes.create(scheme_name, config) {
            Ok(scheme) => scheme,
            Err(error) => {
                tracing::error!(
                    %error,
                    "failed to instantiate the configured identifier scheme, using single"
                );
                Arc::new(SingleScheme::default())
            }
        };

    let mut pre_start_hooks = Vec::new();
    for name in config.get_string_list("trace.hooks.pre-start") {
        match extensions.pre_start_hooks.create(&name, config) {
            Ok(hook) => pre_start_hooks.push(hook),
            Err(error) => tracing::error!(%error, "skipping unknown pre-start hook"),
        }
    }
    let mut pre_finish_hooks = Vec::new();
    for name in config.get_string_list("trace.hooks.pre-finish") {
        match extensions.pre_finish_hooks.create(&name, config) {
            Ok(hook) => pre_finish_hooks.push(hook),
            Err(error) => tracing::error!(%error, "skipping unknown pre-finish hook"),
        }
    }

    let active = Arc::new(ActiveConfig {
        sampler,
        identifier_scheme,
        join_remote_parents_with_same_span_id: config
            .get_bool("trace.join-remote-parents-with-same-span-id")
            .unwrap_or(false),
        include_error_stacktrace: config
            .get_bool("trace.include-error-stacktrace")
            .unwrap_or(false),
        tag_with_initiator_service: config
            .get_bool("trace.span-metric-tags.initiator-service")
            .unwrap_or(false),
        tag_with_parent_operation: config
            .get_bool("trace.span-metric-tags.parent-operation")
            .unwrap_or(false),
        pre_start_hooks,
        pre_finish_hooks,
    });

    (active, adaptive_tick)
}

/// Accumulates everything needed to start a span.
///
/// Builders are consumed by [`SpanBuilder::start`]; a started builder
/// cannot be reused.
pub struct SpanBuilder {
    tracer: Option<Tracer>,
    operation_name: String,
    kind: SpanKind,
    span_tags: TagSetBuilder,
    metric_tags: TagSetBuilder,
    marks: Vec<Mark>,
    context: Option<Context>,
    parent: Option<Span>,
    ignore_parent_from_context: bool,
    suggested_trace_id: Identifier,
    track_metrics: bool,
}

impl SpanBuilder {
    /// A builder not bound to a tracer, for exercising samplers directly.
    #[cfg(test)]
    pub(crate) fn detached(operation_name: &str) -> SpanBuilder {
        SpanBuilder {
            tracer: None,
            operation_name: operation_name.to_owned(),
            kind: SpanKind::Unknown,
            span_tags: TagSetBuilder::default(),
            metric_tags: TagSetBuilder::default(),
            marks: Vec::new(),
            context: None,
            parent: None,
            ignore_parent_from_context: false,
            suggested_trace_id: Identifier::empty(),
            track_metrics: true,
        }
    }

    /// The operation name as currently set.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Renames the operation. Mutable-reference variant for hooks.
    pub fn set_operation_name(&mut self, name: impl Into<String>) {
        self.operation_name = name.into();
    }

    /// Sets the span kind.
    pub fn kind(mut self, kind: SpanKind) -> SpanBuilder {
        self.kind = kind;
        self
    }

    /// Adds a span tag. Mutable-reference variant for hooks.
    pub fn insert_tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.span_tags.insert(key, value);
    }

    /// Adds a span tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> SpanBuilder {
        self.insert_tag(key, value);
        self
    }

    /// Adds a metric tag. Mutable-reference variant for hooks.
    pub fn insert_metric_tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.metric_tags.insert(key, value);
    }

    /// Adds a metric tag.
    pub fn metric_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> SpanBuilder {
        self.insert_metric_tag(key, value);
        self
    }

    /// Records a mark carried into the span.
    pub fn mark_at(mut self, key: impl Into<String>, instant: SystemTime) -> SpanBuilder {
        self.marks.push(Mark {
            instant,
            key: key.into(),
        });
        self
    }

    /// Uses `context` instead of the calling thread's current context.
    pub fn context(mut self, context: Context) -> SpanBuilder {
        self.context = Some(context);
        self
    }

    /// Uses `parent` instead of the span found in the effective context.
    pub fn child_of(mut self, parent: Span) -> SpanBuilder {
        self.parent = Some(parent);
        self
    }

    /// Starts a new trace even when the effective context carries a span.
    pub fn ignore_parent_from_context(mut self) -> SpanBuilder {
        self.ignore_parent_from_context = true;
        self
    }

    /// Suggests a trace identifier, used only when no parent provides
    /// one.
    pub fn trace_id(mut self, id: Identifier) -> SpanBuilder {
        self.suggested_trace_id = id;
        self
    }

    /// Controls whether the finished span feeds the span metric.
    pub fn track_metrics(mut self, enabled: bool) -> SpanBuilder {
        self.track_metrics = enabled;
        self
    }

    /// Starts the span now.
    pub fn start(self) -> Span {
        let at = match &self.tracer {
            Some(tracer) => tracer.inner.clock.now(),
            None => {
                tracing::warn!("starting a detached span builder yields the empty span");
                return Span::empty();
            }
        };
        self.start_at(at)
    }

    /// Starts the span at an explicit instant.
    pub fn start_at(mut self, at: SystemTime) -> Span {
        match self.tracer.take() {
            Some(tracer) => tracer.start_span(self, at),
            None => {
                tracing::warn!("starting a detached span builder yields the empty span");
                Span::empty()
            }
        }
    }
}

impl std::fmt::Debug for SpanBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanBuilder")
            .field("operation_name", &self.operation_name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ThreadPoolScheduler;
    use crate::tags::TagSet;

    fn test_tracer(overrides: &str) -> Tracer {
        let config = Config::from_json(overrides).unwrap();
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadPoolScheduler::new("test-tracer", 1));
        let metrics = Arc::new(MetricRegistry::new(
            Clock::new(),
            scheduler.clone(),
            Arc::new(config.clone()),
        ));
        Tracer::new(
            Clock::new(),
            metrics,
            scheduler,
            Arc::new(TraceExtensions::with_builtins()),
            &config,
        )
    }

    fn always_tracer() -> Tracer {
        test_tracer(r#"{"trace": {"sampler": "always"}}"#)
    }

    #[test]
    fn root_spans_get_fresh_identifiers() {
        let tracer = always_tracer();
        let span = tracer.span_builder("root-op").start();

        assert_eq!(span.position(), SpanPosition::Root);
        assert!(span.parent_id().is_empty());
        assert!(!span.id().is_empty());
        assert!(!span.trace().id().is_empty());
        assert_eq!(span.trace().decision(), SamplingDecision::Sample);
    }

    #[test]
    fn children_inherit_trace_and_decision() {
        let tracer = test_tracer(r#"{"trace": {"sampler": "never"}}"#);
        let root = tracer.span_builder("root").start();
        let child = tracer.span_builder("child").child_of(root.clone()).start();

        assert_eq!(child.trace().id(), root.trace().id());
        assert_eq!(child.parent_id(), root.id());
        assert_eq!(child.trace().decision(), SamplingDecision::DoNotSample);
        assert_eq!(child.position(), SpanPosition::Unknown);
    }

    #[test]
    fn remote_parent_makes_a_local_root() {
        let tracer = always_tracer();
        let remote = Span::remote(
            Identifier::from_hex("bbbbbbbbbbbbbbbb").unwrap(),
            Identifier::empty(),
            Trace::new(
                Identifier::from_hex("aaaaaaaaaaaaaaaa").unwrap(),
                SamplingDecision::Sample,
            ),
        );

        let span = tracer
            .span_builder("incoming")
            .kind(SpanKind::Server)
            .child_of(remote)
            .start();

        assert_eq!(span.position(), SpanPosition::LocalRoot);
        assert_eq!(span.trace().id().hex(), "aaaaaaaaaaaaaaaa");
        assert_eq!(span.parent_id().hex(), "bbbbbbbbbbbbbbbb");
        assert_ne!(span.id().hex(), "bbbbbbbbbbbbbbbb");
    }

    #[test]
    fn same_span_id_join_reuses_the_remote_identifiers() {
        let tracer = test_tracer(
            r#"{"trace": {"sampler": "always", "join-remote-parents-with-same-span-id": true}}"#,
        );
        let remote = Span::remote(
            Identifier::from_hex("bbbbbbbbbbbbbbbb").unwrap(),
            Identifier::from_hex("cccccccccccccccc").unwrap(),
            Trace::new(
                Identifier::from_hex("aaaaaaaaaaaaaaaa").unwrap(),
                SamplingDecision::Sample,
            ),
        );

        let server = tracer
            .span_builder("incoming")
            .kind(SpanKind::Server)
            .child_of(remote.clone())
            .start();
        assert_eq!(server.id().hex(), "bbbbbbbbbbbbbbbb");
        assert_eq!(server.parent_id().hex(), "cccccccccccccccc");

        // Only server spans join; a consumer gets its own span id.
        let consumer = tracer
            .span_builder("incoming")
            .kind(SpanKind::Consumer)
            .child_of(remote)
            .start();
        assert_ne!(consumer.id().hex(), "bbbbbbbbbbbbbbbb");
    }

    #[test]
    fn unknown_remote_decision_triggers_local_resampling() {
        let tracer = always_tracer();
        let remote = Span::remote(
            Identifier::from_hex("bbbbbbbbbbbbbbbb").unwrap(),
            Identifier::empty(),
            Trace::new(
                Identifier::from_hex("aaaaaaaaaaaaaaaa").unwrap(),
                SamplingDecision::Unknown,
            ),
        );

        let span = tracer.span_builder("incoming").child_of(remote).start();
        assert_eq!(span.trace().decision(), SamplingDecision::Sample);
    }

    #[test]
    fn suggested_trace_id_applies_only_to_roots() {
        let tracer = always_tracer();
        let suggested = Identifier::from_hex("1111111111111111").unwrap();

        let root = tracer
            .span_builder("root")
            .trace_id(suggested.clone())
            .start();
        assert_eq!(root.trace().id(), &suggested);

        let child = tracer
            .span_builder("child")
            .child_of(root.clone())
            .trace_id(Identifier::from_hex("2222222222222222").unwrap())
            .start();
        assert_eq!(child.trace().id(), &suggested);
    }

    #[test]
    fn parent_resolves_from_the_current_context() {
        let tracer = always_tracer();
        let root = tracer.span_builder("root").start();

        let _guard = Context::current().with_span(root.clone()).attach();
        let child = tracer.span_builder("child").start();
        assert_eq!(child.parent_id(), root.id());

        let detached = tracer
            .span_builder("independent")
            .ignore_parent_from_context()
            .start();
        assert!(detached.parent_id().is_empty());
        assert_ne!(detached.trace().id(), root.trace().id());
    }

    #[test]
    fn finished_spans_are_drained_in_offer_order() {
        let tracer = always_tracer();
        for i in 0..5 {
            tracer.span_builder(format!("op-{i}")).start().finish();
        }

        let spans = tracer.spans();
        assert_eq!(spans.len(), 5);
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.operation_name, format!("op-{i}"));
        }
        assert!(tracer.spans().is_empty());
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let tracer =
            test_tracer(r#"{"trace": {"sampler": "always", "reporter-queue-size": 16}}"#);
        for i in 0..1000 {
            tracer.span_builder(format!("op-{i}")).start().finish();
        }

        assert_eq!(tracer.spans().len(), 16);
        assert!(tracer.status().dropped_spans >= 984);
    }

    #[test]
    fn unsampled_spans_reach_neither_queue_nor_metric() {
        let tracer = test_tracer(r#"{"trace": {"sampler": "never"}}"#);
        let root = tracer.span_builder("quiet").start();
        let child = tracer.span_builder("quiet-child").child_of(root.clone()).start();
        child.finish();
        root.finish();

        assert!(tracer.spans().is_empty());
        let snapshot = tracer.inner.metrics.snapshot(false);
        assert!(snapshot.timer("span.processing-time").is_none());
    }

    #[test]
    fn sampled_spans_record_the_span_metric() {
        let tracer = always_tracer();
        let span = tracer.span_builder("checkout").kind(SpanKind::Server).start();
        span.finish();

        let snapshot = tracer.inner.metrics.snapshot(false);
        let metric = snapshot.timer("span.processing-time").unwrap();
        let expected_tags = TagSet::builder()
            .add("operation", "checkout")
            .add("kind", "server")
            .add("error", false)
            .build();
        let distribution = metric.value_of(&expected_tags).unwrap();
        assert_eq!(distribution.count, 1);
    }

    #[test]
    fn unknown_sampler_name_degrades_to_ten_percent() {
        let tracer = test_tracer(r#"{"trace": {"sampler": "com.example.Missing"}}"#);
        let sampled = (0..5_000)
            .filter(|i| {
                let span = tracer.span_builder(format!("op-{i}")).start();
                span.trace().decision() == SamplingDecision::Sample
            })
            .count();
        let fraction = sampled as f64 / 5_000.0;
        assert!(
            (fraction - 0.10).abs() < 0.03,
            "fallback sampled fraction was {fraction}"
        );
    }

    #[test]
    fn reconfigure_swaps_sampler_and_queue() {
        let tracer = always_tracer();
        tracer.span_builder("before").start().finish();
        assert_eq!(tracer.spans().len(), 1);

        tracer.reconfigure(
            &Config::from_json(
                r#"{"trace": {"sampler": "never", "reporter-queue-size": 8}}"#,
            )
            .unwrap(),
        );

        tracer.span_builder("after").start().finish();
        assert!(tracer.spans().is_empty());
        assert_eq!(tracer.status().queue_capacity, 8);
    }

    #[test]
    fn buffered_spans_survive_queue_replacement_up_to_capacity() {
        let tracer = always_tracer();
        for i in 0..20 {
            tracer.span_builder(format!("op-{i}")).start().finish();
        }

        tracer.reconfigure(
            &Config::from_json(
                r#"{"trace": {"sampler": "always", "reporter-queue-size": 8}}"#,
            )
            .unwrap(),
        );

        let spans = tracer.spans();
        assert_eq!(spans.len(), 8);
        assert_eq!(spans[0].operation_name, "op-0");
        assert!(tracer.status().dropped_spans >= 12);
    }

    struct RenamingHook;
    impl PreStartHook for RenamingHook {
        fn before_start(&self, builder: &mut SpanBuilder) {
            builder.set_operation_name(format!("renamed-{}", builder.operation_name()));
        }
    }

    struct PanickingHook;
    impl PreStartHook for PanickingHook {
        fn before_start(&self, _builder: &mut SpanBuilder) {
            panic!("hook exploded");
        }
    }

    #[test]
    fn pre_start_hooks_run_and_panics_are_contained() {
        let config = Config::from_json(
            r#"{"trace": {"sampler": "always", "hooks": {"pre-start": ["boom", "rename"]}}}"#,
        )
        .unwrap();
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadPoolScheduler::new("test-tracer", 1));
        let metrics = Arc::new(MetricRegistry::new(
            Clock::new(),
            scheduler.clone(),
            Arc::new(config.clone()),
        ));
        let extensions = TraceExtensions::with_builtins();
        extensions.pre_start_hooks.register("rename", |_| {
            Arc::new(RenamingHook) as Arc<dyn PreStartHook>
        });
        extensions.pre_start_hooks.register("boom", |_| {
            Arc::new(PanickingHook) as Arc<dyn PreStartHook>
        });

        let tracer = Tracer::new(
            Clock::new(),
            metrics,
            scheduler,
            Arc::new(extensions),
            &config,
        );

        let span = tracer.span_builder("op").start();
        assert_eq!(span.operation_name().as_deref(), Some("renamed-op"));
    }
}

//! Spans: timed operation records with identifiers, tags, marks and a
//! finish state.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use crate::clock::Clock;
use crate::tags::{TagSet, TagSetBuilder, TagValue};
use crate::trace::{Identifier, Trace};

/// The role a span plays in the operation it records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Handles a request from a remote client.
    Server,
    /// Issues a request to a remote server.
    Client,
    /// Publishes a message.
    Producer,
    /// Consumes a message.
    Consumer,
    /// Local processing.
    Internal,
    /// Not stated.
    Unknown,
}

impl SpanKind {
    /// Stable lowercase rendering, used as the `kind` metric tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
            SpanKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a span sits in its trace, as seen from this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanPosition {
    /// First span of the trace.
    Root,
    /// First local span under a remote parent.
    LocalRoot,
    /// Anywhere else.
    Unknown,
}

/// A point-in-time annotation on a span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mark {
    /// When the mark was recorded.
    pub instant: SystemTime,
    /// What happened.
    pub key: String,
}

/// Failure details attached to a span via [`Span::fail`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Failure {
    /// Human-readable failure message.
    pub message: Option<String>,
    /// Rendering of the underlying cause, when one was provided.
    pub cause: Option<String>,
    /// Captured backtrace, present only when the tracer is configured
    /// with `include-error-stacktrace`.
    pub stacktrace: Option<String>,
}

/// The immutable record of a finished span.
#[derive(Clone, Debug)]
pub struct FinishedSpan {
    /// Span identifier.
    pub id: Identifier,
    /// Parent span identifier; empty for roots.
    pub parent_id: Identifier,
    /// The trace this span belongs to.
    pub trace: Trace,
    /// Position within the trace.
    pub position: SpanPosition,
    /// Role of the operation.
    pub kind: SpanKind,
    /// Final operation name.
    pub operation_name: String,
    /// Start instant.
    pub start: SystemTime,
    /// Finish instant.
    pub finish: SystemTime,
    /// Tags destined for reporters.
    pub tags: TagSet,
    /// Tags applied to the span metric.
    pub metric_tags: TagSet,
    /// Point-in-time annotations, in recording order.
    pub marks: Vec<Mark>,
    /// Failure details, when the span failed.
    pub failure: Option<Failure>,
    /// Whether this span contributes to the span metric.
    pub track_metrics: bool,
}

pub(crate) type OnFinish = Arc<dyn Fn(FinishedSpan) + Send + Sync>;

pub(crate) struct LocalSpan {
    id: Identifier,
    parent_id: Identifier,
    trace: Trace,
    position: SpanPosition,
    kind: SpanKind,
    start: SystemTime,
    clock: Clock,
    track_metrics: bool,
    tag_with_parent_operation: bool,
    include_error_stacktrace: bool,
    local_parent: Option<Weak<LocalSpan>>,
    on_finish: OnFinish,
    pre_finish_hooks: Vec<Arc<dyn crate::trace::tracer::PreFinishHook>>,
    state: Mutex<OpenState>,
}

struct OpenState {
    operation_name: String,
    span_tags: TagSetBuilder,
    metric_tags: TagSetBuilder,
    marks: Vec<Mark>,
    failure: Option<Failure>,
    finished: bool,
}

struct RemoteSpan {
    id: Identifier,
    parent_id: Identifier,
    trace: Trace,
}

#[derive(Clone)]
enum Repr {
    Empty,
    Remote(Arc<RemoteSpan>),
    Local(Arc<LocalSpan>),
}

/// A handle on a span.
///
/// Spans are cheap to clone and share; all clones refer to the same
/// underlying record. A span transitions from open to finished exactly
/// once; mutation and finish calls after that point are ignored with a
/// logged warning. The empty span is the default value of the context's
/// span slot, and spans read off a carrier are *remote*: they identify a
/// parent in another process and accept no mutation.
#[derive(Clone)]
pub struct Span {
    repr: Repr,
}

/// Bundle of per-span behavior flags resolved by the tracer at build time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SpanFlags {
    pub track_metrics: bool,
    pub tag_with_parent_operation: bool,
    pub include_error_stacktrace: bool,
}

impl Span {
    /// The empty span.
    pub fn empty() -> Span {
        Span { repr: Repr::Empty }
    }

    /// A span handle standing in for a parent in another process, as read
    /// from a propagation carrier.
    pub fn remote(id: Identifier, parent_id: Identifier, trace: Trace) -> Span {
        Span {
            repr: Repr::Remote(Arc::new(RemoteSpan {
                id,
                parent_id,
                trace,
            })),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn local(
        id: Identifier,
        parent_id: Identifier,
        trace: Trace,
        position: SpanPosition,
        kind: SpanKind,
        operation_name: String,
        start: SystemTime,
        clock: Clock,
        span_tags: TagSetBuilder,
        metric_tags: TagSetBuilder,
        marks: Vec<Mark>,
        flags: SpanFlags,
        local_parent: Option<&Span>,
        on_finish: OnFinish,
        pre_finish_hooks: Vec<Arc<dyn crate::trace::tracer::PreFinishHook>>,
    ) -> Span {
        let local_parent = local_parent.and_then(|parent| match &parent.repr {
            Repr::Local(inner) => Some(Arc::downgrade(inner)),
            _ => None,
        });
        Span {
            repr: Repr::Local(Arc::new(LocalSpan {
                id,
                parent_id,
                trace,
                position,
                kind,
                start,
                clock,
                track_metrics: flags.track_metrics,
                tag_with_parent_operation: flags.tag_with_parent_operation,
                include_error_stacktrace: flags.include_error_stacktrace,
                local_parent,
                on_finish,
                pre_finish_hooks,
                state: Mutex::new(OpenState {
                    operation_name,
                    span_tags,
                    metric_tags,
                    marks,
                    failure: None,
                    finished: false,
                }),
            })),
        }
    }

    /// `true` for the empty span.
    pub fn is_empty(&self) -> bool {
        matches!(self.repr, Repr::Empty)
    }

    /// `true` when this span identifies a parent in another process.
    pub fn is_remote(&self) -> bool {
        matches!(self.repr, Repr::Remote(_))
    }

    /// The span identifier; empty for the empty span.
    pub fn id(&self) -> Identifier {
        match &self.repr {
            Repr::Empty => Identifier::empty(),
            Repr::Remote(remote) => remote.id.clone(),
            Repr::Local(local) => local.id.clone(),
        }
    }

    /// The parent span identifier; empty for roots and the empty span.
    pub fn parent_id(&self) -> Identifier {
        match &self.repr {
            Repr::Empty => Identifier::empty(),
            Repr::Remote(remote) => remote.parent_id.clone(),
            Repr::Local(local) => local.parent_id.clone(),
        }
    }

    /// The trace this span belongs to.
    pub fn trace(&self) -> Trace {
        match &self.repr {
            Repr::Empty => Trace::empty(),
            Repr::Remote(remote) => remote.trace.clone(),
            Repr::Local(local) => local.trace.clone(),
        }
    }

    /// Position within the trace. Remote and empty spans report
    /// [`SpanPosition::Unknown`].
    pub fn position(&self) -> SpanPosition {
        match &self.repr {
            Repr::Local(local) => local.position,
            _ => SpanPosition::Unknown,
        }
    }

    /// Role of the operation. Remote and empty spans report
    /// [`SpanKind::Unknown`].
    pub fn kind(&self) -> SpanKind {
        match &self.repr {
            Repr::Local(local) => local.kind,
            _ => SpanKind::Unknown,
        }
    }

    /// The current operation name of an open local span.
    pub fn operation_name(&self) -> Option<String> {
        match &self.repr {
            Repr::Local(local) => {
                Some(local.state.lock().unwrap_or_else(|e| e.into_inner()).operation_name.clone())
            }
            _ => None,
        }
    }

    fn with_open_state(&self, action: &str, f: impl FnOnce(&mut OpenState, &LocalSpan)) {
        let Repr::Local(local) = &self.repr else {
            return;
        };
        let mut state = local.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.finished {
            tracing::warn!(
                span = %local.id,
                operation = %state.operation_name,
                "ignoring {action} on a finished span"
            );
            return;
        }
        f(&mut state, local);
    }

    /// Renames the operation; ignored after finish.
    pub fn set_operation_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.with_open_state("rename", move |state, _| state.operation_name = name);
    }

    /// Adds a span tag; ignored after finish.
    pub fn tag(&self, key: impl Into<String>, value: impl Into<TagValue>) {
        let (key, value) = (key.into(), value.into());
        self.with_open_state("tag", move |state, _| state.span_tags.insert(key, value));
    }

    /// Adds a metric tag; ignored after finish.
    pub fn metric_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) {
        let (key, value) = (key.into(), value.into());
        self.with_open_state("metric tag", move |state, _| {
            state.metric_tags.insert(key, value)
        });
    }

    /// Records a mark at `instant`; ignored after finish.
    pub fn mark_at(&self, key: impl Into<String>, instant: SystemTime) {
        let key = key.into();
        self.with_open_state("mark", move |state, _| state.marks.push(Mark { instant, key }));
    }

    /// Records a mark at the current instant; ignored after finish.
    pub fn mark(&self, key: impl Into<String>) {
        let at = match &self.repr {
            Repr::Local(local) => local.clock.now(),
            _ => return,
        };
        self.mark_at(key, at);
    }

    /// Marks the span as failed; ignored after finish.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_open_state("failure", move |state, local| {
            state.failure = Some(Failure {
                message: Some(message),
                cause: None,
                stacktrace: capture_stacktrace(local.include_error_stacktrace),
            });
        });
    }

    /// Marks the span as failed with an underlying cause; ignored after
    /// finish.
    pub fn fail_with(&self, message: impl Into<String>, cause: &dyn std::error::Error) {
        let (message, cause) = (message.into(), cause.to_string());
        self.with_open_state("failure", move |state, local| {
            state.failure = Some(Failure {
                message: Some(message),
                cause: Some(cause),
                stacktrace: capture_stacktrace(local.include_error_stacktrace),
            });
        });
    }

    /// `true` once the span has been finished. Remote and empty spans are
    /// never finished.
    pub fn is_finished(&self) -> bool {
        match &self.repr {
            Repr::Local(local) => local.state.lock().unwrap_or_else(|e| e.into_inner()).finished,
            _ => false,
        }
    }

    /// Finishes the span at the current instant of the tracer's clock.
    ///
    /// Only the first finish takes effect; later calls are ignored with a
    /// logged warning.
    pub fn finish(&self) {
        let at = match &self.repr {
            Repr::Local(local) => local.clock.now(),
            _ => return,
        };
        self.finish_at(at);
    }

    /// Finishes the span at an explicit instant.
    pub fn finish_at(&self, at: SystemTime) {
        let Repr::Local(local) = &self.repr else {
            return;
        };

        {
            let state = local.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.finished {
                tracing::warn!(
                    span = %local.id,
                    operation = %state.operation_name,
                    "span finished more than once, keeping the first finish"
                );
                return;
            }
        }

        // Hooks observe the still-open span; their panics are contained.
        for hook in &local.pre_finish_hooks {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook.before_finish(self)));
            if outcome.is_err() {
                tracing::warn!(span = %local.id, "pre-finish hook panicked, continuing");
            }
        }

        let finished = {
            let mut state = local.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.finished {
                // Lost a finish race after the hooks ran; the winner's
                // record stands.
                return;
            }
            state.finished = true;

            let mut metric_tags = std::mem::take(&mut state.metric_tags);
            if local.tag_with_parent_operation {
                if let Some(parent) = local.local_parent.as_ref().and_then(Weak::upgrade) {
                    let parent_state = parent.state.lock().unwrap_or_else(|e| e.into_inner());
                    metric_tags.insert("parentOperation", parent_state.operation_name.as_str());
                }
            }

            FinishedSpan {
                id: local.id.clone(),
                parent_id: local.parent_id.clone(),
                trace: local.trace.clone(),
                position: local.position,
                kind: local.kind,
                operation_name: std::mem::take(&mut state.operation_name),
                start: local.start,
                finish: at.max(local.start),
                tags: std::mem::take(&mut state.span_tags).build(),
                metric_tags: metric_tags.build(),
                marks: std::mem::take(&mut state.marks),
                failure: state.failure.take(),
                track_metrics: local.track_metrics,
            }
        };

        (local.on_finish)(finished);
    }
}

impl Default for Span {
    fn default() -> Self {
        Span::empty()
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Empty => f.write_str("Span(empty)"),
            Repr::Remote(remote) => f
                .debug_struct("Span")
                .field("remote", &true)
                .field("id", &remote.id)
                .field("trace", &remote.trace)
                .finish(),
            Repr::Local(local) => f
                .debug_struct("Span")
                .field("id", &local.id)
                .field("parent_id", &local.parent_id)
                .field("trace", &local.trace)
                .field("kind", &local.kind)
                .field("position", &local.position)
                .finish(),
        }
    }
}

fn capture_stacktrace(enabled: bool) -> Option<String> {
    if enabled {
        Some(std::backtrace::Backtrace::force_capture().to_string())
    } else {
        None
    }
}

//! B3 trace propagation entries, multi-header and single-header.

use crate::context::Context;
use crate::propagation::http::{HeaderReader, HeaderWriter, HttpEntryReader, HttpEntryWriter};
use crate::trace::{Identifier, SamplingDecision, Span, Trace};

const X_B3_TRACE_ID: &str = "X-B3-TraceId";
const X_B3_SPAN_ID: &str = "X-B3-SpanId";
const X_B3_PARENT_SPAN_ID: &str = "X-B3-ParentSpanId";
const X_B3_SAMPLED: &str = "X-B3-Sampled";
const B3_SINGLE: &str = "b3";

fn render_decision(decision: SamplingDecision) -> Option<&'static str> {
    match decision {
        SamplingDecision::Sample => Some("1"),
        SamplingDecision::DoNotSample => Some("0"),
        SamplingDecision::Unknown => None,
    }
}

fn parse_decision(value: Option<&str>) -> SamplingDecision {
    match value {
        Some("1") | Some("d") | Some("true") => SamplingDecision::Sample,
        Some("0") | Some("false") => SamplingDecision::DoNotSample,
        _ => SamplingDecision::Unknown,
    }
}

/// The B3 multi-header format: `X-B3-TraceId`, `X-B3-SpanId`,
/// `X-B3-ParentSpanId` and `X-B3-Sampled`.
#[derive(Clone, Copy, Debug, Default)]
pub struct B3Entry;

impl HttpEntryReader for B3Entry {
    fn read(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let trace_id = reader
            .read(X_B3_TRACE_ID)
            .and_then(|hex| Identifier::from_hex(hex.trim()).ok())
            .unwrap_or_else(Identifier::empty);
        let span_id = reader
            .read(X_B3_SPAN_ID)
            .and_then(|hex| Identifier::from_hex(hex.trim()).ok())
            .unwrap_or_else(Identifier::empty);

        if trace_id.is_empty() || span_id.is_empty() {
            return context;
        }

        let parent_id = reader
            .read(X_B3_PARENT_SPAN_ID)
            .and_then(|hex| Identifier::from_hex(hex.trim()).ok())
            .unwrap_or_else(Identifier::empty);
        let sampled = reader.read(X_B3_SAMPLED);
        let decision = parse_decision(sampled.as_deref());

        context.with_span(Span::remote(span_id, parent_id, Trace::new(trace_id, decision)))
    }
}

impl HttpEntryWriter for B3Entry {
    fn write(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        let span = context.span();
        if span.is_empty() {
            return;
        }

        writer.write(X_B3_TRACE_ID, span.trace().id().hex().to_owned());
        writer.write(X_B3_SPAN_ID, span.id().hex().to_owned());
        if !span.parent_id().is_empty() {
            writer.write(X_B3_PARENT_SPAN_ID, span.parent_id().hex().to_owned());
        }
        if let Some(sampled) = render_decision(span.trace().decision()) {
            writer.write(X_B3_SAMPLED, sampled.to_owned());
        }
    }
}

/// The B3 single-header format:
/// `b3: {trace id}-{span id}[-{sampling}[-{parent span id}]]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct B3SingleEntry;

impl HttpEntryReader for B3SingleEntry {
    fn read(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let Some(header) = reader.read(B3_SINGLE) else {
            return context;
        };
        let mut parts = header.trim().split('-');

        let trace_id = parts
            .next()
            .and_then(|hex| Identifier::from_hex(hex).ok())
            .unwrap_or_else(Identifier::empty);
        let span_id = parts
            .next()
            .and_then(|hex| Identifier::from_hex(hex).ok())
            .unwrap_or_else(Identifier::empty);
        if trace_id.is_empty() || span_id.is_empty() {
            return context;
        }

        let decision = parse_decision(parts.next());
        let parent_id = parts
            .next()
            .and_then(|hex| Identifier::from_hex(hex).ok())
            .unwrap_or_else(Identifier::empty);

        context.with_span(Span::remote(span_id, parent_id, Trace::new(trace_id, decision)))
    }
}

impl HttpEntryWriter for B3SingleEntry {
    fn write(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        let span = context.span();
        if span.is_empty() {
            return;
        }

        let mut header = format!("{}-{}", span.trace().id().hex(), span.id().hex());
        if let Some(sampled) = render_decision(span.trace().decision()) {
            header.push('-');
            header.push_str(sampled);
            if !span.parent_id().is_empty() {
                header.push('-');
                header.push_str(span.parent_id().hex());
            }
        }
        writer.write(B3_SINGLE, header);
    }
}

//! Binary propagation: entry-tagged, length-delimited frames.
//!
//! Wire layout, one frame per entry:
//!
//! ```text
//! | name length (u8) | name bytes | payload length (u16, BE) | payload |
//! ```
//!
//! The writer encodes the whole context into a scratch buffer first;
//! when the result exceeds the channel's `max-outgoing-size` nothing at
//! all is written, so a reader never sees a truncated context.

use std::sync::Arc;

use crate::config::Config;
use crate::context::Context;
use crate::propagation::http::{decode_tags, encode_tags};
use crate::propagation::PropagationExtensions;
use crate::trace::{Identifier, SamplingDecision, Span, Trace};

/// Read side of a binary carrier.
pub trait ByteStreamReader {
    /// Reads up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Reads everything remaining.
    fn read_all(&mut self) -> Vec<u8>;
}

/// Write side of a binary carrier.
pub trait ByteStreamWriter {
    /// Appends `bytes` to the carrier.
    fn write(&mut self, bytes: &[u8]);
}

impl ByteStreamWriter for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl ByteStreamReader for &[u8] {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        n
    }

    fn read_all(&mut self) -> Vec<u8> {
        let all = self.to_vec();
        *self = &[];
        all
    }
}

/// One inbound binary dimension: decodes a frame payload into the
/// context.
pub trait BinaryEntryReader: Send + Sync {
    /// Applies the decoded payload to `context`.
    fn decode(&self, payload: &[u8], context: Context) -> Context;
}

/// One outbound binary dimension: encodes its slice of the context.
pub trait BinaryEntryWriter: Send + Sync {
    /// This entry's payload, or `None` when there is nothing to carry.
    fn encode(&self, context: &Context) -> Option<Vec<u8>>;
}

/// An immutable binary propagation channel.
pub struct BinaryPropagator {
    max_outgoing_size: usize,
    incoming: Vec<(String, Arc<dyn BinaryEntryReader>)>,
    outgoing: Vec<(String, Arc<dyn BinaryEntryWriter>)>,
}

impl BinaryPropagator {
    pub(crate) fn from_channel_config(
        channel: &Config,
        extensions: &PropagationExtensions,
    ) -> BinaryPropagator {
        let max_outgoing_size = channel
            .get_i64("max-outgoing-size")
            .unwrap_or(2048)
            .max(0) as usize;

        let mut incoming = Vec::new();
        for key in channel.child_keys("entries.incoming") {
            let Some(factory_name) = channel.get_str(&format!("entries.incoming.{key}")) else {
                continue;
            };
            match extensions.binary_readers.create(factory_name, channel) {
                Ok(entry) => incoming.push((key, entry)),
                Err(error) => tracing::error!(
                    entry = %key,
                    %error,
                    "skipping unknown incoming binary propagation entry"
                ),
            }
        }

        let mut outgoing = Vec::new();
        for key in channel.child_keys("entries.outgoing") {
            let Some(factory_name) = channel.get_str(&format!("entries.outgoing.{key}")) else {
                continue;
            };
            match extensions.binary_writers.create(factory_name, channel) {
                Ok(entry) => outgoing.push((key, entry)),
                Err(error) => tracing::error!(
                    entry = %key,
                    %error,
                    "skipping unknown outgoing binary propagation entry"
                ),
            }
        }

        BinaryPropagator {
            max_outgoing_size,
            incoming,
            outgoing,
        }
    }

    /// Reads a fresh context off the carrier.
    pub fn read(&self, reader: &mut dyn ByteStreamReader) -> Context {
        self.read_into(reader, Context::new())
    }

    /// Folds the carrier's frames onto an existing context in frame
    /// order. Unknown entry names are skipped; a malformed tail stops
    /// decoding with what was already applied.
    pub fn read_into(&self, reader: &mut dyn ByteStreamReader, context: Context) -> Context {
        let bytes = reader.read_all();
        let mut context = context;
        let mut cursor = &bytes[..];

        while !cursor.is_empty() {
            let Some((name, payload, rest)) = next_frame(cursor) else {
                tracing::warn!("malformed binary context frame, stopping decode");
                break;
            };
            if let Some((_, entry)) = self.incoming.iter().find(|(key, _)| key == name) {
                context = entry.decode(payload, context);
            }
            cursor = rest;
        }
        context
    }

    /// Encodes the context and writes it, or writes nothing (with a
    /// warning) when the encoding exceeds `max-outgoing-size`.
    pub fn write(&self, context: &Context, writer: &mut dyn ByteStreamWriter) {
        let mut buffer = Vec::new();
        for (name, entry) in &self.outgoing {
            let Some(payload) = entry.encode(context) else {
                continue;
            };
            if name.len() > u8::MAX as usize || payload.len() > u16::MAX as usize {
                tracing::warn!(
                    entry = %name,
                    payload_size = payload.len(),
                    "binary context entry does not fit a frame, writing nothing"
                );
                return;
            }
            buffer.push(name.len() as u8);
            buffer.extend_from_slice(name.as_bytes());
            buffer.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            buffer.extend_from_slice(&payload);
        }

        if buffer.len() > self.max_outgoing_size {
            tracing::warn!(
                encoded_size = buffer.len(),
                max_outgoing_size = self.max_outgoing_size,
                "encoded context exceeds the outgoing size limit, writing nothing"
            );
            return;
        }
        if !buffer.is_empty() {
            writer.write(&buffer);
        }
    }
}

impl std::fmt::Debug for BinaryPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryPropagator")
            .field("max_outgoing_size", &self.max_outgoing_size)
            .finish_non_exhaustive()
    }
}

fn next_frame(bytes: &[u8]) -> Option<(&str, &[u8], &[u8])> {
    let (&name_len, rest) = bytes.split_first()?;
    let name_len = name_len as usize;
    if rest.len() < name_len + 2 {
        return None;
    }
    let (name, rest) = rest.split_at(name_len);
    let name = std::str::from_utf8(name).ok()?;
    let (len_bytes, rest) = rest.split_at(2);
    let payload_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    if rest.len() < payload_len {
        return None;
    }
    let (payload, rest) = rest.split_at(payload_len);
    Some((name, payload, rest))
}

/// Binary codec for the context's span slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpanBinaryCodec;

impl BinaryEntryWriter for SpanBinaryCodec {
    fn encode(&self, context: &Context) -> Option<Vec<u8>> {
        let span = context.span();
        if span.is_empty() {
            return None;
        }

        let trace = span.trace();
        let (span_id, parent_id) = (span.id(), span.parent_id());
        let mut payload = Vec::new();
        for id in [trace.id(), &span_id, &parent_id] {
            payload.push(id.bytes().len() as u8);
            payload.extend_from_slice(id.bytes());
        }
        payload.push(match trace.decision() {
            SamplingDecision::Unknown => 0,
            SamplingDecision::Sample => 1,
            SamplingDecision::DoNotSample => 2,
        });
        Some(payload)
    }
}

impl BinaryEntryReader for SpanBinaryCodec {
    fn decode(&self, payload: &[u8], context: Context) -> Context {
        fn identifier(cursor: &mut &[u8]) -> Option<Identifier> {
            let (&len, rest) = cursor.split_first()?;
            let len = len as usize;
            if rest.len() < len {
                return None;
            }
            let (bytes, rest) = rest.split_at(len);
            *cursor = rest;
            match len {
                0 => Some(Identifier::empty()),
                8 => Some(Identifier::from_bytes_8(bytes.try_into().ok()?)),
                16 => Some(Identifier::from_bytes_16(bytes.try_into().ok()?)),
                _ => None,
            }
        }

        let mut cursor = payload;
        let Some(trace_id) = identifier(&mut cursor) else {
            return context;
        };
        let Some(span_id) = identifier(&mut cursor) else {
            return context;
        };
        let Some(parent_id) = identifier(&mut cursor) else {
            return context;
        };
        if trace_id.is_empty() || span_id.is_empty() {
            return context;
        }

        let decision = match cursor.first() {
            Some(1) => SamplingDecision::Sample,
            Some(2) => SamplingDecision::DoNotSample,
            _ => SamplingDecision::Unknown,
        };

        context.with_span(Span::remote(span_id, parent_id, Trace::new(trace_id, decision)))
    }
}

/// Binary codec for the context's tag set, reusing the text rendering.
#[derive(Clone, Copy, Debug, Default)]
pub struct TagsBinaryCodec;

impl BinaryEntryWriter for TagsBinaryCodec {
    fn encode(&self, context: &Context) -> Option<Vec<u8>> {
        if context.tags().is_empty() {
            return None;
        }
        Some(encode_tags(context.tags()).into_bytes())
    }
}

impl BinaryEntryReader for TagsBinaryCodec {
    fn decode(&self, payload: &[u8], context: Context) -> Context {
        match std::str::from_utf8(payload) {
            Ok(rendered) => context.with_tags(decode_tags(rendered)),
            Err(_) => {
                tracing::warn!("binary tags payload is not utf-8, skipping");
                context
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_binary() -> Arc<BinaryPropagator> {
        let extensions = PropagationExtensions::with_builtins();
        crate::propagation::Propagation::from_config(&Config::default_config(), &extensions)
            .unwrap()
            .binary_default()
    }

    fn sized_binary(max: usize) -> Arc<BinaryPropagator> {
        let extensions = PropagationExtensions::with_builtins();
        let config = Config::from_json(&format!(
            r#"{{"propagation": {{"binary": {{"default": {{"max-outgoing-size": {max}}}}}}}}}"#
        ))
        .unwrap();
        crate::propagation::Propagation::from_config(&config, &extensions)
            .unwrap()
            .binary_default()
    }

    fn context_with_span_and_tags() -> Context {
        Context::new()
            .with_span(Span::remote(
                Identifier::from_hex("00f067aa0ba902b7").unwrap(),
                Identifier::empty(),
                Trace::new(
                    Identifier::from_hex("80f198ee56343ba864fe8b2a57d3eff7").unwrap(),
                    SamplingDecision::Sample,
                ),
            ))
            .with_tag("env", "prod")
            .with_tag("cid", 42i64)
    }

    #[test]
    fn context_round_trips_through_frames() {
        let propagator = default_binary();
        let context = context_with_span_and_tags();

        let mut carrier: Vec<u8> = Vec::new();
        propagator.write(&context, &mut carrier);
        assert!(!carrier.is_empty());

        let read_back = propagator.read(&mut carrier.as_slice());
        assert_eq!(read_back.span().id(), context.span().id());
        assert_eq!(
            read_back.span().trace().decision(),
            SamplingDecision::Sample
        );
        assert_eq!(read_back.tags(), context.tags());
    }

    #[test]
    fn oversized_context_writes_nothing() {
        let propagator = sized_binary(16);
        let context = context_with_span_and_tags();

        let mut carrier: Vec<u8> = Vec::new();
        propagator.write(&context, &mut carrier);
        assert!(carrier.is_empty());
    }

    #[test]
    fn empty_context_writes_nothing() {
        let propagator = default_binary();
        let mut carrier: Vec<u8> = Vec::new();
        propagator.write(&Context::new(), &mut carrier);
        assert!(carrier.is_empty());
    }

    #[test]
    fn unknown_frames_are_skipped() {
        let propagator = default_binary();

        // A frame named "mystery" followed by a valid tags frame.
        let mut carrier: Vec<u8> = Vec::new();
        carrier.push(7);
        carrier.extend_from_slice(b"mystery");
        carrier.extend_from_slice(&3u16.to_be_bytes());
        carrier.extend_from_slice(&[1, 2, 3]);
        carrier.push(4);
        carrier.extend_from_slice(b"tags");
        let tags = b"env=prod";
        carrier.extend_from_slice(&(tags.len() as u16).to_be_bytes());
        carrier.extend_from_slice(tags);

        let context = propagator.read(&mut carrier.as_slice());
        assert_eq!(context.tags().get_string("env"), Some("prod"));
    }

    #[test]
    fn truncated_frames_stop_the_decode() {
        let propagator = default_binary();
        let mut carrier: Vec<u8> = Vec::new();
        carrier.push(4);
        carrier.extend_from_slice(b"tags");
        carrier.extend_from_slice(&100u16.to_be_bytes());
        carrier.extend_from_slice(b"short");

        let context = propagator.read(&mut carrier.as_slice());
        assert!(context.tags().is_empty());
        assert!(context.span().is_empty());
    }
}

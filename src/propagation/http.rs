//! HTTP-style text propagation: key/value header carriers.

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::config::Config;
use crate::context::Context;
use crate::propagation::PropagationExtensions;
use crate::tags::{TagSet, TagSetBuilder, TagValue};

/// Characters with meaning inside the combined tag header, escaped in
/// keys and values.
const TAG_ESCAPES: &AsciiSet = &CONTROLS.add(b';').add(b'=').add(b'%');

/// Read side of a text carrier.
pub trait HeaderReader {
    /// The value of `name`, if the carrier has it.
    fn read(&self, name: &str) -> Option<String>;

    /// All header pairs on the carrier.
    fn read_all(&self) -> Vec<(String, String)>;
}

/// Write side of a text carrier.
pub trait HeaderWriter {
    /// Sets `name` to `value`.
    fn write(&mut self, name: &str, value: String);
}

impl<S: std::hash::BuildHasher> HeaderReader for HashMap<String, String, S> {
    fn read(&self, name: &str) -> Option<String> {
        self.get(&name.to_lowercase()).cloned()
    }

    fn read_all(&self) -> Vec<(String, String)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl<S: std::hash::BuildHasher> HeaderWriter for HashMap<String, String, S> {
    fn write(&mut self, name: &str, value: String) {
        self.insert(name.to_lowercase(), value);
    }
}

/// One inbound propagation dimension: folds carrier state into the
/// context. Implementations keep no per-invocation state.
pub trait HttpEntryReader: Send + Sync {
    /// Applies whatever this entry finds on the carrier to `context`.
    fn read(&self, reader: &dyn HeaderReader, context: Context) -> Context;
}

/// One outbound propagation dimension: writes context state onto the
/// carrier. Implementations keep no per-invocation state.
pub trait HttpEntryWriter: Send + Sync {
    /// Writes this entry's slice of `context` onto the carrier.
    fn write(&self, context: &Context, writer: &mut dyn HeaderWriter);
}

/// An immutable HTTP propagation channel: the tag header codec plus the
/// configured entries in declared order.
pub struct HttpPropagator {
    tags_header_name: String,
    /// `tag name -> dedicated header` reroutes.
    mappings: Vec<(String, String)>,
    incoming: Vec<(String, Arc<dyn HttpEntryReader>)>,
    outgoing: Vec<(String, Arc<dyn HttpEntryWriter>)>,
}

impl HttpPropagator {
    pub(crate) fn from_channel_config(
        channel: &Config,
        extensions: &PropagationExtensions,
    ) -> HttpPropagator {
        let tags_header_name = channel
            .get_str("tags.header-name")
            .unwrap_or("context-tags")
            .to_owned();
        let mappings = channel
            .string_table("tags.mappings")
            .into_iter()
            .collect::<Vec<_>>();

        let mut incoming = Vec::new();
        for key in channel.child_keys("entries.incoming") {
            let Some(factory_name) = channel.get_str(&format!("entries.incoming.{key}")) else {
                continue;
            };
            match extensions.http_readers.create(factory_name, channel) {
                Ok(entry) => incoming.push((key, entry)),
                Err(error) => tracing::error!(
                    entry = %key,
                    %error,
                    "skipping unknown incoming http propagation entry"
                ),
            }
        }

        let mut outgoing = Vec::new();
        for key in channel.child_keys("entries.outgoing") {
            let Some(factory_name) = channel.get_str(&format!("entries.outgoing.{key}")) else {
                continue;
            };
            match extensions.http_writers.create(factory_name, channel) {
                Ok(entry) => outgoing.push((key, entry)),
                Err(error) => tracing::error!(
                    entry = %key,
                    %error,
                    "skipping unknown outgoing http propagation entry"
                ),
            }
        }

        HttpPropagator {
            tags_header_name,
            mappings,
            incoming,
            outgoing,
        }
    }

    /// Reads a fresh context off the carrier.
    pub fn read(&self, reader: &dyn HeaderReader) -> Context {
        self.read_into(reader, Context::new())
    }

    /// Folds the carrier onto an existing context: tags first, then each
    /// entry reader in declared order.
    pub fn read_into(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let mut tags = TagSetBuilder::default();
        if let Some(combined) = reader.read(&self.tags_header_name) {
            decode_tags_into(&combined, &mut tags);
        }
        for (tag, header) in &self.mappings {
            if let Some(value) = reader.read(header) {
                tags.insert(tag.clone(), infer_tag_value(&value));
            }
        }

        let mut context = if tags.is_empty() {
            context
        } else {
            context.with_tags(tags.build())
        };

        for (_, entry) in &self.incoming {
            context = entry.read(reader, context);
        }
        context
    }

    /// Writes the context onto the carrier: mapped tags to their own
    /// headers, the rest combined, then each entry writer in declared
    /// order.
    pub fn write(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        let mut combined = String::new();
        for (key, value) in context.tags().iter() {
            if let Some((_, header)) = self.mappings.iter().find(|(tag, _)| tag == key) {
                writer.write(header, value.render().into_owned());
                continue;
            }
            if !combined.is_empty() {
                combined.push(';');
            }
            combined.push_str(&utf8_percent_encode(key, TAG_ESCAPES).to_string());
            combined.push('=');
            combined.push_str(&utf8_percent_encode(&value.render(), TAG_ESCAPES).to_string());
        }
        if !combined.is_empty() {
            writer.write(&self.tags_header_name, combined);
        }

        for (_, entry) in &self.outgoing {
            entry.write(context, writer);
        }
    }
}

impl std::fmt::Debug for HttpPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPropagator")
            .field("tags_header_name", &self.tags_header_name)
            .field(
                "incoming",
                &self.incoming.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "outgoing",
                &self.outgoing.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub(crate) fn encode_tags(tags: &TagSet) -> String {
    let mut combined = String::new();
    for (key, value) in tags.iter() {
        if !combined.is_empty() {
            combined.push(';');
        }
        combined.push_str(&utf8_percent_encode(key, TAG_ESCAPES).to_string());
        combined.push('=');
        combined.push_str(&utf8_percent_encode(&value.render(), TAG_ESCAPES).to_string());
    }
    combined
}

pub(crate) fn decode_tags(combined: &str) -> TagSet {
    let mut builder = TagSetBuilder::default();
    decode_tags_into(combined, &mut builder);
    builder.build()
}

fn decode_tags_into(combined: &str, builder: &mut TagSetBuilder) {
    for pair in combined.split(';') {
        let Some((raw_key, raw_value)) = pair.split_once('=') else {
            continue;
        };
        let key = percent_decode_str(raw_key).decode_utf8_lossy().into_owned();
        let value = percent_decode_str(raw_value).decode_utf8_lossy().into_owned();
        if key.is_empty() {
            continue;
        }
        builder.insert(key, infer_tag_value(&value));
    }
}

/// Restores the tag value type lost by the text rendering: booleans and
/// longs parse back, everything else stays a string.
fn infer_tag_value(value: &str) -> TagValue {
    match value {
        "true" => TagValue::Boolean(true),
        "false" => TagValue::Boolean(false),
        other => match other.parse::<i64>() {
            Ok(long) => TagValue::Long(long),
            Err(_) => TagValue::String(other.to_owned()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::Propagation;

    fn default_http() -> Arc<HttpPropagator> {
        let extensions = PropagationExtensions::with_builtins();
        Propagation::from_config(&Config::default_config(), &extensions)
            .unwrap()
            .http_default()
    }

    fn mapped_http() -> Arc<HttpPropagator> {
        let extensions = PropagationExtensions::with_builtins();
        let config = Config::from_json(
            r#"{"propagation": {"http": {"default": {"tags": {"mappings": {"cid": "X-Request-Id"}}}}}}"#,
        )
        .unwrap();
        Propagation::from_config(&config, &extensions)
            .unwrap()
            .http_default()
    }

    #[test]
    fn tags_round_trip_through_the_combined_header() {
        let propagator = default_http();
        let context = Context::new()
            .with_tag("env", "prod")
            .with_tag("retries", 3i64)
            .with_tag("secure", true);

        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.write(&context, &mut carrier);
        let read_back = propagator.read(&carrier);

        assert_eq!(read_back.tags(), context.tags());
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let propagator = default_http();
        let context = Context::new().with_tag("note", "a=b;c%d");

        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.write(&context, &mut carrier);

        let header = HeaderReader::read(&carrier, "context-tags").unwrap();
        assert!(!header.contains("a=b;c"));

        let read_back = propagator.read(&carrier);
        assert_eq!(read_back.tags().get_string("note"), Some("a=b;c%d"));
    }

    #[test]
    fn mapped_tags_use_their_own_header_and_leave_the_combined_one() {
        let propagator = mapped_http();
        let context = Context::new().with_tag("env", "prod").with_tag("cid", 42i64);

        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.write(&context, &mut carrier);

        assert_eq!(
            HeaderReader::read(&carrier, "X-Request-Id").as_deref(),
            Some("42")
        );
        let combined = HeaderReader::read(&carrier, "context-tags").unwrap();
        assert!(combined.contains("env=prod"));
        assert!(!combined.contains("cid"));
    }

    #[test]
    fn mapped_headers_override_the_combined_header_on_read() {
        let propagator = mapped_http();
        let mut carrier: HashMap<String, String> = HashMap::new();
        HeaderWriter::write(&mut carrier, "context-tags", "cid=1;env=prod".to_owned());
        HeaderWriter::write(&mut carrier, "X-Request-Id", "42".to_owned());

        let context = propagator.read(&carrier);
        assert_eq!(context.tags().get_long("cid"), Some(42));
        assert_eq!(context.tags().get_string("env"), Some("prod"));
    }

    #[test]
    fn read_folds_onto_the_given_context() {
        let propagator = default_http();
        let base = Context::new().with_tag("kept", true);

        let mut carrier: HashMap<String, String> = HashMap::new();
        HeaderWriter::write(&mut carrier, "context-tags", "env=prod".to_owned());

        let folded = propagator.read_into(&carrier, base);
        assert_eq!(folded.tags().get_boolean("kept"), Some(true));
        assert_eq!(folded.tags().get_string("env"), Some("prod"));
    }
}

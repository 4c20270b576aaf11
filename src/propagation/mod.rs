//! Context propagation across process boundaries.
//!
//! A *channel* is a named, immutable composition of entry readers and
//! writers for one transport. Configuration declares the channels; the
//! entries themselves are resolved by name through the propagation
//! extension registries, so new trace-header formats or user entries plug
//! in without touching this module. The "default" channel is required for
//! both transports.

pub mod b3;
pub mod binary;
pub mod http;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::ConfigurationError;
use crate::extension::FactoryRegistry;

pub use binary::{
    BinaryEntryReader, BinaryEntryWriter, BinaryPropagator, ByteStreamReader, ByteStreamWriter,
};
pub use http::{HeaderReader, HeaderWriter, HttpEntryReader, HttpEntryWriter, HttpPropagator};

/// Named factories for propagation entries. B3 trace headers and the
/// binary span and tags codecs are preregistered.
pub struct PropagationExtensions {
    /// Inbound HTTP entries, by name.
    pub http_readers: FactoryRegistry<Arc<dyn HttpEntryReader>>,
    /// Outbound HTTP entries, by name.
    pub http_writers: FactoryRegistry<Arc<dyn HttpEntryWriter>>,
    /// Inbound binary entries, by name.
    pub binary_readers: FactoryRegistry<Arc<dyn BinaryEntryReader>>,
    /// Outbound binary entries, by name.
    pub binary_writers: FactoryRegistry<Arc<dyn BinaryEntryWriter>>,
}

impl PropagationExtensions {
    /// A registry set with the built-in entry names registered.
    pub fn with_builtins() -> PropagationExtensions {
        let http_readers: FactoryRegistry<Arc<dyn HttpEntryReader>> = FactoryRegistry::new();
        let http_writers: FactoryRegistry<Arc<dyn HttpEntryWriter>> = FactoryRegistry::new();
        http_readers.register("b3", |_| Arc::new(b3::B3Entry) as Arc<dyn HttpEntryReader>);
        http_writers.register("b3", |_| Arc::new(b3::B3Entry) as Arc<dyn HttpEntryWriter>);
        http_readers.register("b3-single", |_| {
            Arc::new(b3::B3SingleEntry) as Arc<dyn HttpEntryReader>
        });
        http_writers.register("b3-single", |_| {
            Arc::new(b3::B3SingleEntry) as Arc<dyn HttpEntryWriter>
        });

        let binary_readers: FactoryRegistry<Arc<dyn BinaryEntryReader>> = FactoryRegistry::new();
        let binary_writers: FactoryRegistry<Arc<dyn BinaryEntryWriter>> = FactoryRegistry::new();
        binary_readers.register("span", |_| {
            Arc::new(binary::SpanBinaryCodec) as Arc<dyn BinaryEntryReader>
        });
        binary_writers.register("span", |_| {
            Arc::new(binary::SpanBinaryCodec) as Arc<dyn BinaryEntryWriter>
        });
        binary_readers.register("tags", |_| {
            Arc::new(binary::TagsBinaryCodec) as Arc<dyn BinaryEntryReader>
        });
        binary_writers.register("tags", |_| {
            Arc::new(binary::TagsBinaryCodec) as Arc<dyn BinaryEntryWriter>
        });

        PropagationExtensions {
            http_readers,
            http_writers,
            binary_readers,
            binary_writers,
        }
    }
}

impl std::fmt::Debug for PropagationExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationExtensions").finish_non_exhaustive()
    }
}

/// The channels configured for both transports.
///
/// Channels are immutable once built; reconfiguration builds complete new
/// channel maps and swaps them in atomically, so in-flight reads and
/// writes keep the channel they resolved.
pub struct Propagation {
    http: RwLock<Arc<HashMap<String, Arc<HttpPropagator>>>>,
    binary: RwLock<Arc<HashMap<String, Arc<BinaryPropagator>>>>,
}

impl Propagation {
    /// Builds all channels from configuration. Fails when either
    /// transport lacks its "default" channel.
    pub fn from_config(
        config: &Config,
        extensions: &PropagationExtensions,
    ) -> Result<Propagation, ConfigurationError> {
        let (http, binary) = build_channels(config, extensions)?;
        Ok(Propagation {
            http: RwLock::new(Arc::new(http)),
            binary: RwLock::new(Arc::new(binary)),
        })
    }

    /// Rebuilds every channel from the new configuration and swaps the
    /// channel maps. On error the previous channels stay in place.
    pub fn reconfigure(
        &self,
        config: &Config,
        extensions: &PropagationExtensions,
    ) -> Result<(), ConfigurationError> {
        let (http, binary) = build_channels(config, extensions)?;
        *self.http.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(http);
        *self.binary.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(binary);
        Ok(())
    }

    /// The named HTTP channel.
    pub fn http(&self, channel: &str) -> Option<Arc<HttpPropagator>> {
        self.http
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .cloned()
    }

    /// The default HTTP channel, which construction guarantees exists.
    pub fn http_default(&self) -> Arc<HttpPropagator> {
        self.http("default").expect("default http channel is validated at construction")
    }

    /// The named binary channel.
    pub fn binary(&self, channel: &str) -> Option<Arc<BinaryPropagator>> {
        self.binary
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .cloned()
    }

    /// The default binary channel, which construction guarantees exists.
    pub fn binary_default(&self) -> Arc<BinaryPropagator> {
        self.binary("default")
            .expect("default binary channel is validated at construction")
    }
}

impl std::fmt::Debug for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let http: Vec<String> = self
            .http
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        let binary: Vec<String> = self
            .binary
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("Propagation")
            .field("http", &http)
            .field("binary", &binary)
            .finish()
    }
}

type ChannelMaps = (
    HashMap<String, Arc<HttpPropagator>>,
    HashMap<String, Arc<BinaryPropagator>>,
);

fn build_channels(
    config: &Config,
    extensions: &PropagationExtensions,
) -> Result<ChannelMaps, ConfigurationError> {
    let mut http = HashMap::new();
    for channel in config.child_keys("propagation.http") {
        let branch = config
            .subtree(&format!("propagation.http.{channel}"))
            .unwrap_or_else(|| Config::from_value(serde_json::json!({})));
        http.insert(
            channel,
            Arc::new(HttpPropagator::from_channel_config(&branch, extensions)),
        );
    }
    if !http.contains_key("default") {
        return Err(ConfigurationError::MissingDefaultChannel { medium: "http" });
    }

    let mut binary = HashMap::new();
    for channel in config.child_keys("propagation.binary") {
        let branch = config
            .subtree(&format!("propagation.binary.{channel}"))
            .unwrap_or_else(|| Config::from_value(serde_json::json!({})));
        binary.insert(
            channel,
            Arc::new(BinaryPropagator::from_channel_config(&branch, extensions)),
        );
    }
    if !binary.contains_key("default") {
        return Err(ConfigurationError::MissingDefaultChannel { medium: "binary" });
    }

    Ok((http, binary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_channels_are_required() {
        let extensions = PropagationExtensions::with_builtins();
        let ok = Propagation::from_config(&Config::default_config(), &extensions);
        assert!(ok.is_ok());

        let no_default = Config::from_value(serde_json::json!({
            "propagation": { "http": { "custom": {} }, "binary": { "default": {} } }
        }));
        let err = Propagation::from_config(&no_default, &extensions).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::MissingDefaultChannel { medium: "http" }
        ));
    }

    #[test]
    fn reconfigure_keeps_old_channels_on_error() {
        let extensions = PropagationExtensions::with_builtins();
        let propagation =
            Propagation::from_config(&Config::default_config(), &extensions).unwrap();

        let broken = Config::from_value(serde_json::json!({ "propagation": {} }));
        assert!(propagation.reconfigure(&broken, &extensions).is_err());
        assert!(propagation.http("default").is_some());
        assert!(propagation.binary("default").is_some());
    }

    #[test]
    fn extra_channels_resolve_by_name() {
        let extensions = PropagationExtensions::with_builtins();
        let config = Config::from_json(
            r#"{"propagation": {"http": {"mesh": {
                "tags": {"header-name": "mesh-tags"},
                "entries": {"incoming": {"span": "b3-single"}, "outgoing": {"span": "b3-single"}}
            }}}}"#,
        )
        .unwrap();
        let propagation = Propagation::from_config(&config, &extensions).unwrap();

        assert!(propagation.http("mesh").is_some());
        assert!(propagation.http("missing").is_none());
    }
}

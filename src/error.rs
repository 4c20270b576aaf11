//! Error types shared across the runtime.
//!
//! Hot paths (recording measurements, starting and finishing spans) never
//! surface these; they are returned from configuration-time entry points
//! such as metric registration, channel construction and `reconfigure`.

use thiserror::Error;

/// Errors raised while building or rebuilding parts of the runtime from
/// configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// A metric name was registered again with a different instrument kind.
    #[error("metric {name} is already registered as a {existing}, cannot register it as a {requested}")]
    MetricKindMismatch {
        /// The conflicting metric name.
        name: String,
        /// Kind under which the metric was first registered.
        existing: &'static str,
        /// Kind requested by the conflicting registration.
        requested: &'static str,
    },

    /// A propagation medium is missing its required "default" channel.
    #[error("propagation.{medium} does not define the required \"default\" channel")]
    MissingDefaultChannel {
        /// The transport medium, "http" or "binary".
        medium: &'static str,
    },

    /// A configuration value could not be interpreted.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Dotted path of the offending key.
        key: String,
        /// What went wrong.
        reason: String,
    },

    /// The configuration document itself could not be parsed.
    #[error("malformed configuration: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A user-named extension point could not be constructed.
///
/// Callers degrade to a documented fallback after logging this.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no factory registered under the name {name:?}")]
pub struct InstantiationError {
    /// The name that failed to resolve.
    pub name: String,
}

/// Errors surfaced by identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentifierError {
    /// The hex string had a length the scheme does not produce.
    #[error("identifier hex string has invalid length {0}")]
    InvalidLength(usize),
    /// The string contained non-hex characters.
    #[error("identifier contains a non-hex character")]
    InvalidCharacter,
}

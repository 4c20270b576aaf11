//! The configuration tree and the hub that fans out reconfigurations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::error::ConfigurationError;

/// The compiled-in defaults every configuration is overlaid onto.
const DEFAULT_CONFIG: &str = r#"{
    "environment": {
        "service": "unknown-service",
        "host": "auto",
        "instance": "auto",
        "tags": {}
    },
    "scheduler-pool-size": 2,
    "metric": {
        "tick-interval": "60s",
        "optimistic-tick-alignment": true,
        "refresh-scheduler-pool-size": 2,
        "factory": {
            "default-settings": {
                "counter": {},
                "gauge": {},
                "histogram": {
                    "lowest-discernible-value": 1,
                    "highest-trackable-value": 3600000000000,
                    "significant-value-digits": 2
                },
                "timer": {
                    "lowest-discernible-value": 1,
                    "highest-trackable-value": 3600000000000,
                    "significant-value-digits": 2
                },
                "range-sampler": {
                    "lowest-discernible-value": 1,
                    "highest-trackable-value": 3600000000000,
                    "significant-value-digits": 2,
                    "auto-update-interval": "200ms"
                }
            },
            "custom-settings": {}
        }
    },
    "trace": {
        "tick-interval": "10s",
        "reporter-queue-size": 4096,
        "join-remote-parents-with-same-span-id": false,
        "identifier-scheme": "single",
        "include-error-stacktrace": false,
        "sampler": "random",
        "random-sampler": { "probability": 0.01 },
        "adaptive-sampler": { "throughput": 600, "groups": {} },
        "span-metric-tags": { "initiator-service": false, "parent-operation": false },
        "hooks": { "pre-start": [], "pre-finish": [] }
    },
    "propagation": {
        "http": {
            "default": {
                "tags": { "header-name": "context-tags", "mappings": {} },
                "entries": {
                    "incoming": { "span": "b3" },
                    "outgoing": { "span": "b3" }
                }
            }
        },
        "binary": {
            "default": {
                "max-outgoing-size": 2048,
                "entries": {
                    "incoming": { "span": "span", "tags": "tags" },
                    "outgoing": { "span": "span", "tags": "tags" }
                }
            }
        }
    }
}"#;

/// An immutable configuration tree.
///
/// Values are addressed by dotted paths (`"trace.reporter-queue-size"`).
/// Every accessor is total over missing keys, returning `None` so callers
/// can fall back to their documented defaults; the compiled-in defaults
/// mean the keys this crate reads are always present unless a caller
/// builds a tree from scratch with [`Config::from_value`].
#[derive(Clone, Debug)]
pub struct Config {
    root: Value,
}

impl Config {
    /// The compiled-in default configuration.
    pub fn default_config() -> Config {
        Config {
            root: serde_json::from_str(DEFAULT_CONFIG).expect("compiled-in defaults are valid"),
        }
    }

    /// Parses a JSON document and overlays it onto the compiled-in
    /// defaults.
    pub fn from_json(json: &str) -> Result<Config, ConfigurationError> {
        let overlay: Value = serde_json::from_str(json)?;
        Ok(Config::default_config().with_overlay(overlay))
    }

    /// Wraps an already-built JSON value without applying defaults.
    pub fn from_value(root: Value) -> Config {
        Config { root }
    }

    /// Returns a copy of this tree with `overlay` merged on top; objects
    /// merge recursively, everything else is replaced.
    pub fn with_overlay(&self, overlay: Value) -> Config {
        let mut root = self.root.clone();
        merge(&mut root, overlay);
        Config { root }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// String at `path`.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path)?.as_str()
    }

    /// Integer at `path`.
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.lookup(path)?.as_i64()
    }

    /// Float at `path`; integers widen.
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.lookup(path)?.as_f64()
    }

    /// Boolean at `path`.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.lookup(path)?.as_bool()
    }

    /// Duration at `path`. Strings take a unit suffix (`ns`, `us`, `ms`,
    /// `s`, `m`, `h`); bare numbers are milliseconds.
    pub fn get_duration(&self, path: &str) -> Option<Duration> {
        match self.lookup(path)? {
            Value::Number(n) => n.as_u64().map(Duration::from_millis),
            Value::String(s) => parse_duration(s),
            _ => None,
        }
    }

    /// List of strings at `path`.
    pub fn get_string_list(&self, path: &str) -> Vec<String> {
        self.lookup(path)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The immediate child keys of the object at `path`, in key order.
    pub fn child_keys(&self, path: &str) -> Vec<String> {
        self.lookup(path)
            .and_then(Value::as_object)
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The object at `path` flattened to leaf string values, keyed by the
    /// immediate child name. Used for `tags.*` and `mappings.*` tables.
    pub fn string_table(&self, path: &str) -> BTreeMap<String, String> {
        self.lookup(path)
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| match v {
                        Value::String(s) => Some((k.clone(), s.clone())),
                        Value::Number(n) => Some((k.clone(), n.to_string())),
                        Value::Bool(b) => Some((k.clone(), b.to_string())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The subtree at `path` as its own `Config`, for handing a component
    /// just the branch it owns.
    pub fn subtree(&self, path: &str) -> Option<Config> {
        self.lookup(path).cloned().map(Config::from_value)
    }

    /// The subtree under the verbatim child key `key`, for tables whose
    /// keys may themselves contain dots (metric names).
    pub fn child_exact(&self, key: &str) -> Option<Config> {
        self.root
            .as_object()?
            .get(key)
            .cloned()
            .map(Config::from_value)
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ns" => Some(Duration::from_nanos(amount)),
        "us" => Some(Duration::from_micros(amount)),
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        "h" => Some(Duration::from_secs(amount * 3600)),
        _ => None,
    }
}

/// Holds the active configuration tree and fans out reconfigure events.
///
/// Readers take a cheap snapshot via [`ConfigHub::current`]; swapping in a
/// new tree notifies every subscriber with the new snapshot. Subsystem
/// reconfiguration is orchestrated by the runtime itself, so subscribers
/// here are for host-application listeners.
pub struct ConfigHub {
    current: RwLock<Arc<Config>>,
    subscribers: Mutex<Vec<Box<dyn Fn(&Config) + Send + Sync>>>,
}

impl ConfigHub {
    /// Creates a hub holding `initial`.
    pub fn new(initial: Config) -> ConfigHub {
        ConfigHub {
            current: RwLock::new(Arc::new(initial)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The active configuration snapshot.
    pub fn current(&self) -> Arc<Config> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swaps in a new tree and notifies subscribers.
    pub fn swap(&self, config: Config) -> Arc<Config> {
        let next = Arc::new(config);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for subscriber in subscribers.iter() {
            subscriber(&next);
        }
        next
    }

    /// Registers a callback invoked after every swap.
    pub fn on_reconfigure(&self, subscriber: impl Fn(&Config) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(subscriber));
    }
}

impl std::fmt::Debug for ConfigHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHub").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_recognized_keys() {
        let config = Config::default_config();
        assert_eq!(config.get_i64("scheduler-pool-size"), Some(2));
        assert_eq!(
            config.get_duration("metric.tick-interval"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.get_i64("trace.reporter-queue-size"), Some(4096));
        assert_eq!(config.get_str("trace.sampler"), Some("random"));
        assert_eq!(
            config.get_str("propagation.http.default.tags.header-name"),
            Some("context-tags")
        );
    }

    #[test]
    fn overlay_merges_objects_and_replaces_leaves() {
        let config = Config::from_json(
            r#"{"trace": {"sampler": "always", "reporter-queue-size": 16}}"#,
        )
        .unwrap();
        assert_eq!(config.get_str("trace.sampler"), Some("always"));
        assert_eq!(config.get_i64("trace.reporter-queue-size"), Some(16));
        // untouched sibling keys survive
        assert_eq!(config.get_str("trace.identifier-scheme"), Some("single"));
    }

    #[test]
    fn duration_suffixes() {
        let config = Config::from_json(
            r#"{"a": "250ms", "b": "2s", "c": "1m", "d": 100, "e": "15us"}"#,
        )
        .unwrap();
        assert_eq!(config.get_duration("a"), Some(Duration::from_millis(250)));
        assert_eq!(config.get_duration("b"), Some(Duration::from_secs(2)));
        assert_eq!(config.get_duration("c"), Some(Duration::from_secs(60)));
        assert_eq!(config.get_duration("d"), Some(Duration::from_millis(100)));
        assert_eq!(config.get_duration("e"), Some(Duration::from_micros(15)));
    }

    #[test]
    fn hub_notifies_subscribers_on_swap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hub = ConfigHub::new(Config::default_config());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_hook = seen.clone();
        hub.on_reconfigure(move |_| {
            seen_by_hook.fetch_add(1, Ordering::SeqCst);
        });

        hub.swap(Config::default_config());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(hub.current().get_str("trace.sampler"), Some("random"));
    }
}

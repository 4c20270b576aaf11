//! Extension points named by string.
//!
//! Configuration refers to samplers, identifier schemes, propagation
//! entries and span hooks by name. Each extension point is a
//! [`FactoryRegistry`] mapping names to factory functions; built-in names
//! are preregistered by the runtime, host applications may register their
//! own before (re)configuring. Unknown names surface as
//! [`InstantiationError`] and the caller degrades to its documented
//! fallback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::InstantiationError;

type Factory<T> = Arc<dyn Fn(&Config) -> T + Send + Sync>;

/// A registry of named factories producing values of one extension type.
pub struct FactoryRegistry<T> {
    factories: RwLock<HashMap<String, Factory<T>>>,
}

impl<T> FactoryRegistry<T> {
    /// An empty registry.
    pub fn new() -> FactoryRegistry<T> {
        FactoryRegistry {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `factory` under `name`, replacing any previous factory
    /// with that name.
    pub fn register(&self, name: impl Into<String>, factory: impl Fn(&Config) -> T + Send + Sync + 'static) {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Arc::new(factory));
    }

    /// Instantiates the extension registered under `name`.
    pub fn create(&self, name: &str, config: &Config) -> Result<T, InstantiationError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();
        match factory {
            Some(factory) => Ok(factory(config)),
            None => Err(InstantiationError {
                name: name.to_owned(),
            }),
        }
    }

    /// `true` when a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }
}

impl<T> Default for FactoryRegistry<T> {
    fn default() -> Self {
        FactoryRegistry::new()
    }
}

impl<T> std::fmt::Debug for FactoryRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("FactoryRegistry").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_resolves_registered_names() {
        let registry: FactoryRegistry<u32> = FactoryRegistry::new();
        registry.register("fixed", |_| 7);

        let config = Config::default_config();
        assert_eq!(registry.create("fixed", &config), Ok(7));
        assert!(registry.contains("fixed"));
    }

    #[test]
    fn unknown_name_is_an_instantiation_error() {
        let registry: FactoryRegistry<u32> = FactoryRegistry::new();
        let config = Config::default_config();
        let err = registry.create("com.example.Missing", &config).unwrap_err();
        assert_eq!(err.name, "com.example.Missing");
    }
}

//! Plugin registry mapping configuration discriminators to constructors.
//!
//! The registry is built once at process startup and passed by reference
//! into project loading; it is read-only afterwards. This keeps the
//! init-before-use contract explicit instead of relying on hidden global
//! state.

use crate::config::ConfigError;
use crate::plugin::{Comparator, FuzzVariable, Value};
use std::collections::HashMap;

pub type ComparatorFactory = fn(&Value) -> Result<Box<dyn Comparator>, ConfigError>;
pub type VariableFactory = fn(&str, &Value) -> Result<Box<dyn FuzzVariable>, ConfigError>;

#[derive(Default)]
pub struct PluginRegistry {
    comparators: HashMap<String, ComparatorFactory>,
    variables: HashMap<String, VariableFactory>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// A registry populated with every builtin comparator and variable.
    pub fn with_builtins() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        crate::comparators::register_builtins(&mut registry);
        crate::variables::register_builtins(&mut registry);
        registry
    }

    pub fn register_comparator(&mut self, id: &str, factory: ComparatorFactory) {
        self.comparators.insert(id.to_string(), factory);
    }

    pub fn register_variable(&mut self, id: &str, factory: VariableFactory) {
        self.variables.insert(id.to_string(), factory);
    }

    /// Construct a comparator from its configuration entry. The entry is
    /// either a plain string (the comparator id) or a mapping with an `id`
    /// field plus comparator-specific options.
    pub fn build_comparator(&self, config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
        let (id, options) = split_discriminator(config, "id")
            .ok_or(ConfigError::MissingComparatorId)?;
        let factory = self
            .comparators
            .get(&id)
            .ok_or_else(|| ConfigError::UnknownComparator(id.clone()))?;
        factory(&options)
    }

    /// Construct a fuzz variable from its configuration entry. The entry is
    /// either a plain string (the variable type) or a mapping with a `type`
    /// field plus type-specific options.
    pub fn build_variable(
        &self,
        name: &str,
        config: &Value,
    ) -> Result<Box<dyn FuzzVariable>, ConfigError> {
        let (id, options) = split_discriminator(config, "type")
            .ok_or_else(|| ConfigError::MissingVariableType(name.to_string()))?;
        let factory = self
            .variables
            .get(&id)
            .ok_or_else(|| ConfigError::UnknownVariableType(id.clone()))?;
        factory(name, &options)
    }
}

/// Pull the discriminator out of a plugin configuration entry, returning it
/// together with the remaining options mapping.
fn split_discriminator(config: &Value, key: &str) -> Option<(String, Value)> {
    match config {
        Value::String(id) => Some((id.clone(), Value::Mapping(Default::default()))),
        Value::Mapping(mapping) => {
            let id = mapping.get(Value::String(key.to_string()))?;
            let id = id.as_str()?.to_string();
            let mut options = mapping.clone();
            options.remove(Value::String(key.to_string()));
            Some((id, Value::Mapping(options)))
        }
        _ => None,
    }
}

//! Builtin fuzz variable types.

use crate::registry::PluginRegistry;

pub mod primitives;
pub mod radamsa;

pub use primitives::{IntVariable, StrVariable};
pub use radamsa::RadamsaVariable;

/// Register every builtin variable type under its `type` discriminator.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register_variable("int", primitives::int_variable);
    registry.register_variable("str", primitives::str_variable);
    registry.register_variable("radamsa", radamsa::radamsa_variable);
}

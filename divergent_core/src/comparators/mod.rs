//! Builtin comparators.

use crate::registry::PluginRegistry;

pub mod files;
pub mod pcap;
pub mod primitives;

pub use files::FileComparator;
pub use pcap::PcapComparator;
pub use primitives::{ExitCodeComparator, HookScriptComparator, StreamComparator};

/// Register every builtin comparator under its `id` discriminator.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register_comparator("exit_code", primitives::exit_code);
    registry.register_comparator("stdout", primitives::stdout);
    registry.register_comparator("stderr", primitives::stderr);
    registry.register_comparator("setup_script", primitives::setup_script);
    registry.register_comparator("teardown_script", primitives::teardown_script);
    registry.register_comparator("concurrent_script", primitives::concurrent_script);
    registry.register_comparator("file", files::file);
    registry.register_comparator("pcap", pcap::pcap);
}

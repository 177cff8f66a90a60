//! Differential testing engine for debloated binaries.
//!
//! A project pairs an original binary with one or more debloated variants
//! produced by debloater engines. Trace templates describe how the binary is
//! exercised: fuzz variables expand into argument and input combinations,
//! and comparators judge whether a variant's observable behavior matches the
//! original's. Divergences and crashes are persisted as YAML reports.
//!
//! The [`executor`] module is the entry point: load a [`project::Project`]
//! through a [`registry::PluginRegistry`] and hand it to an
//! [`executor::Executor`].

pub mod comparators;
pub mod config;
pub mod executor;
pub mod parameters;
pub mod plugin;
pub mod project;
pub mod registry;
pub mod render;
pub mod report;
pub mod supervisor;
pub mod trace;
pub mod variables;

pub use config::ConfigError;
pub use executor::{Executor, ExecutorError};
pub use plugin::{Comparator, ComparisonResult, ComparisonStatus, CrashResult, FuzzVariable};
pub use project::Project;
pub use registry::PluginRegistry;
pub use trace::{Trace, TraceContext, TraceTemplate, ORIGINAL_ENGINE};

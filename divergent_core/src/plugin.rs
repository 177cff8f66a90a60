//! Plugin contracts for comparators and fuzz variables.
//!
//! Both families are configured from the project file through a string
//! discriminator (`id` for comparators, `type` for variables) resolved by the
//! [`PluginRegistry`](crate::registry::PluginRegistry). Instances are shared
//! across every context generated from a template and are therefore
//! read-only after construction: any per-execution state must live in
//! [`Trace::cache`](crate::trace::Trace), never on the plugin itself.

use crate::trace::Trace;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A configuration value pulled from the project YAML file.
pub type Value = serde_yaml::Value;

/// One concrete assignment of fuzz variable values, keyed by variable name.
pub type ValueMap = BTreeMap<String, Value>;

/// Render a configuration value as the string that is substituted into
/// argument/script templates. Strings render without quotes; other scalars
/// use their YAML form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

/// A hook invoked before and after every trace execution. Fuzz variables and
/// comparators both participate so that plugins with expensive external
/// state (e.g. a mutation tool) can prepare and clean up per trace.
pub trait TraceHook {
    fn setup(&self, _trace: &Trace) -> anyhow::Result<()> {
        Ok(())
    }

    fn teardown(&self, _trace: &Trace) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A pluggable generator of concrete values for one template variable.
pub trait FuzzVariable: TraceHook + Send + Sync {
    /// The `type` discriminator this variable was registered under.
    fn id(&self) -> &str;

    /// The variable name within the template.
    fn name(&self) -> &str;

    /// Lazily produce the sequence of values for this variable. The sequence
    /// must be finite; the parameter generator caches every yielded value
    /// and replays the cache once the sequence is exhausted.
    fn generate_values(&self) -> Box<dyn Iterator<Item = Value> + '_>;
}

/// A pluggable rule that inspects one or two traces and yields a verdict.
pub trait Comparator: TraceHook + Send + Sync {
    /// The `id` discriminator this comparator was registered under.
    fn id(&self) -> &str;

    /// Inspect only the original binary's trace and flag any deviation from
    /// the template's expectations. A non-`None` return invalidates the
    /// entire context: no debloated binary is executed or compared.
    fn verify_original(&self, _original: &Trace) -> Option<CrashResult> {
        None
    }

    /// Pairwise comparison of the debloated trace against the original.
    /// Implementations must not mutate their own state but may memoize
    /// expensive work through `Trace::cache`.
    fn compare(&self, original: &Trace, debloated: &Trace) -> ComparisonResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Success,
    Error,
}

/// The outcome of one comparator run against one debloated trace.
///
/// The result snapshots the trace directory and variable values so it can be
/// persisted after the trace itself has been cleaned up. The comparator is
/// recorded by id, not by reference, for the same reason.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub comparator: String,
    pub status: ComparisonStatus,
    pub details: String,
    pub trace_directory: PathBuf,
    pub values: ValueMap,
}

impl ComparisonResult {
    pub fn success(comparator: &str, trace: &Trace) -> ComparisonResult {
        ComparisonResult {
            comparator: comparator.to_string(),
            status: ComparisonStatus::Success,
            details: String::new(),
            trace_directory: trace.cwd.clone(),
            values: trace.context.values.clone(),
        }
    }

    pub fn error(comparator: &str, trace: &Trace, details: impl Into<String>) -> ComparisonResult {
        ComparisonResult {
            comparator: comparator.to_string(),
            status: ComparisonStatus::Error,
            details: details.into(),
            trace_directory: trace.cwd.clone(),
            values: trace.context.values.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ComparisonStatus::Success
    }
}

/// An unexpected deviation tied to a trace: a crash, an unexpected timeout,
/// or a failed baseline verification. Persisted to its own crash file,
/// separate from comparison reports.
#[derive(Debug, Clone)]
pub struct CrashResult {
    pub values: ValueMap,
    pub trace_directory: PathBuf,
    pub arguments: Vec<String>,
    pub details: String,
    pub comparator: Option<String>,
}

impl CrashResult {
    pub fn new(trace: &Trace, details: impl Into<String>) -> CrashResult {
        CrashResult {
            values: trace.context.values.clone(),
            trace_directory: trace.cwd.clone(),
            arguments: trace.arguments.clone(),
            details: details.into(),
            comparator: None,
        }
    }

    pub fn with_comparator(
        trace: &Trace,
        details: impl Into<String>,
        comparator: &str,
    ) -> CrashResult {
        CrashResult {
            comparator: Some(comparator.to_string()),
            ..CrashResult::new(trace, details)
        }
    }
}

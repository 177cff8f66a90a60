//! Raw serde data model for the project YAML file.
//!
//! These shapes mirror the on-disk format only. They are converted into the
//! resolved domain objects (`Project`, `TraceTemplate`) by
//! [`Project::load`](crate::project::Project::load), which is where plugin
//! ids are resolved and templates are compiled.

use crate::render::RenderError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read project file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse project file {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("unknown comparator id: {0}")]
    UnknownComparator(String),
    #[error("unknown variable type: {0}")]
    UnknownVariableType(String),
    #[error("comparator configuration is missing the 'id' field")]
    MissingComparatorId,
    #[error("variable {0} is missing the 'type' field")]
    MissingVariableType(String),
    #[error("unsupported concurrent script mode: {0}")]
    UnsupportedConcurrentMode(String),
    #[error("variable {0} cannot generate any values")]
    EmptyVariable(String),
    #[error("binary does not exist: {0}")]
    MissingBinary(PathBuf),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrent_delay() -> f64 {
    1.0
}

/// The top-level project descriptor.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProjectFile {
    pub name: String,
    /// Path to the original binary, relative to the project file.
    pub original: PathBuf,
    /// Debloater engine name mapped to its output binary path.
    #[serde(default)]
    pub debloaters: BTreeMap<String, PathBuf>,
    /// Optional stable filename the binary is symlinked to inside each trace
    /// directory, so arguments and scripts see a uniform name.
    #[serde(default)]
    pub link_filename: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub templates: Vec<TemplateFile>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct TemplateFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub arguments: String,
    /// Variable name mapped to its configuration. A plain string value is
    /// shorthand for `{type: <string>}`. Mapping order is preserved and
    /// determines waterfall ordering.
    #[serde(default)]
    pub variables: serde_yaml::Mapping,
    /// Ordered comparator configurations. A plain string entry is shorthand
    /// for `{id: <string>}`.
    #[serde(default)]
    pub comparators: Vec<serde_yaml::Value>,
    #[serde(default = "default_true")]
    pub expect_success: bool,
    #[serde(default)]
    pub expect_signal: i32,
    #[serde(default)]
    pub timeout: TimeoutFile,
    #[serde(default)]
    pub stdin: Option<StdinFile>,
    #[serde(default)]
    pub input_files: Vec<InputFileEntry>,
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub teardown: Option<String>,
    #[serde(default)]
    pub concurrent: Option<ConcurrentFile>,
    /// Prepend `set -e` to generated hook scripts.
    #[serde(default = "default_true")]
    pub script_exit_on_first_error: bool,
}

/// Timeout constraint: either a bare number of seconds or a mapping with an
/// `expected` flag.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum TimeoutFile {
    Seconds(u64),
    Full {
        seconds: u64,
        #[serde(default)]
        expected: bool,
    },
}

impl TimeoutFile {
    pub fn seconds(&self) -> u64 {
        match *self {
            TimeoutFile::Seconds(seconds) | TimeoutFile::Full { seconds, .. } => seconds,
        }
    }

    pub fn expected(&self) -> bool {
        match *self {
            TimeoutFile::Seconds(_) => false,
            TimeoutFile::Full { expected, .. } => expected,
        }
    }
}

impl Default for TimeoutFile {
    fn default() -> Self {
        TimeoutFile::Seconds(60)
    }
}

/// Standard input source: an inline template string or a file reference.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum StdinFile {
    Inline(String),
    File { file: PathBuf },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct InputFileEntry {
    pub source: PathBuf,
    #[serde(default)]
    pub dest: Option<PathBuf>,
    /// Octal file mode, as a string (`"755"`) or bare integer (`755`).
    #[serde(default)]
    pub mode: Option<ModeEntry>,
    /// Static files are copied verbatim; non-static files are rendered with
    /// the context values.
    #[serde(default = "default_true", rename = "static")]
    pub static_file: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ModeEntry {
    Int(u32),
    Str(String),
}

impl ModeEntry {
    /// Interpret the configured digits as an octal mode.
    pub fn parse(&self) -> Result<u32, ConfigError> {
        let digits = match self {
            ModeEntry::Int(value) => value.to_string(),
            ModeEntry::Str(value) => value.clone(),
        };
        u32::from_str_radix(&digits, 8)
            .map_err(|err| ConfigError::invalid("mode", format!("{digits}: {err}")))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConcurrentFile {
    /// Script body launched while the traced process is running.
    pub run: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default = "default_concurrent_delay")]
    pub delay: f64,
    #[serde(default)]
    pub retries: u32,
}

impl ProjectFile {
    pub fn load(path: &std::path::Path) -> Result<ProjectFile, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

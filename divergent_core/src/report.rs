//! Persistent YAML records written to the project report directory.

use crate::plugin::{ComparisonResult, ComparisonStatus, CrashResult, ValueMap};
use crate::trace::Trace;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write report {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize report {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

fn write_yaml<T: Serialize>(path: &Path, record: &T) -> Result<(), ReportError> {
    let file = File::create(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::to_writer(file, record).map_err(|source| ReportError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Serialize, Debug)]
pub struct ReportEntry {
    pub comparator: String,
    pub details: String,
    pub status: ComparisonStatus,
}

/// A comparison report for one trace, one file per trace. The record embeds
/// everything needed to reproduce the run by hand.
#[derive(Serialize, Debug)]
pub struct ReportRecord {
    pub values: ValueMap,
    pub trace_directory: String,
    pub arguments: Vec<String>,
    pub binary: String,
    pub results: Vec<ReportEntry>,
}

impl ReportRecord {
    pub fn new(trace: &Trace, results: &[ComparisonResult]) -> ReportRecord {
        // The trace binary is a symlink inside the trace directory; report
        // the real target so the record outlives directory cleanup.
        let binary = std::fs::read_link(&trace.binary).unwrap_or_else(|_| trace.binary.clone());
        ReportRecord {
            values: trace.context.values.clone(),
            trace_directory: trace.cwd.display().to_string(),
            arguments: trace.arguments.clone(),
            binary: binary.display().to_string(),
            results: results
                .iter()
                .map(|result| ReportEntry {
                    comparator: result.comparator.clone(),
                    details: result.details.clone(),
                    status: result.status,
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        write_yaml(path, self)
    }
}

#[derive(Serialize, Debug)]
struct CrashRecord<'a> {
    values: &'a ValueMap,
    trace_directory: String,
    arguments: &'a [String],
    details: &'a str,
    comparator: Option<&'a str>,
}

impl CrashResult {
    /// Persist this crash to its own YAML file, separate from comparison
    /// reports.
    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        write_yaml(
            path,
            &CrashRecord {
                values: &self.values,
                trace_directory: self.trace_directory.display().to_string(),
                arguments: &self.arguments,
                details: &self.details,
                comparator: self.comparator.as_deref(),
            },
        )
    }
}

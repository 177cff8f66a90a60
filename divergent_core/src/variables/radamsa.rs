//! Radamsa-backed string mutation variable.

use crate::config::ConfigError;
use crate::plugin::{FuzzVariable, TraceHook, Value};
use log::error;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

fn default_count() -> u32 {
    5
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RadamsaConfig {
    /// A single seed or a list of seeds to mutate.
    seed: SeedEntry,
    /// Number of values to generate per seed.
    #[serde(default = "default_count")]
    count: u32,
    /// Path to the radamsa binary; resolved from PATH when unset.
    #[serde(default)]
    binary: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum SeedEntry {
    One(String),
    Many(Vec<String>),
}

/// Generates mutated inputs by piping each seed through the external
/// `radamsa` fuzzer. Radamsa may return more than `count` values and the
/// occasional empty line, so the output is deduplicated and filtered.
///
/// Templates with a radamsa variable should avoid strict exit code
/// expectations since the mutated inputs can trigger previously unknown
/// failures in the original binary itself.
pub struct RadamsaVariable {
    name: String,
    seeds: Vec<String>,
    count: u32,
    binary: PathBuf,
}

pub fn radamsa_variable(name: &str, config: &Value) -> Result<Box<dyn FuzzVariable>, ConfigError> {
    let config: RadamsaConfig = serde_yaml::from_value(config.clone())
        .map_err(|err| ConfigError::invalid(name, err.to_string()))?;

    let seeds = match config.seed {
        SeedEntry::One(seed) => vec![seed],
        SeedEntry::Many(seeds) => seeds,
    };
    if seeds.is_empty() || config.count == 0 {
        return Err(ConfigError::EmptyVariable(name.to_string()));
    }

    let binary = match config.binary {
        Some(path) => path,
        None => find_in_path("radamsa")
            .ok_or_else(|| ConfigError::MissingBinary(PathBuf::from("radamsa")))?,
    };
    if !binary.is_file() {
        return Err(ConfigError::MissingBinary(binary));
    }

    Ok(Box::new(RadamsaVariable {
        name: name.to_string(),
        seeds,
        count: config.count,
        binary,
    }))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

impl RadamsaVariable {
    fn mutate_seed(&self, seed: &str) -> std::io::Result<Vec<String>> {
        let mut input = seed.to_string();
        if !input.ends_with('\n') {
            input.push('\n');
        }

        let mut child = Command::new(&self.binary)
            .arg("--count")
            .arg(self.count.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        // stdin is dropped after the write so radamsa sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        // Radamsa can emit duplicate and empty lines beyond the requested
        // count; keep one copy of each non-empty value.
        let mut seen = HashSet::new();
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(str::to_string)
            .collect())
    }
}

impl TraceHook for RadamsaVariable {}

impl FuzzVariable for RadamsaVariable {
    fn id(&self) -> &str {
        "radamsa"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn generate_values(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        Box::new(self.seeds.iter().flat_map(|seed| {
            match self.mutate_seed(seed) {
                Ok(values) => values.into_iter().map(Value::from).collect::<Vec<_>>(),
                Err(err) => {
                    error!("radamsa failed for variable {}: {}", self.name, err);
                    Vec::new()
                }
            }
        }))
    }
}

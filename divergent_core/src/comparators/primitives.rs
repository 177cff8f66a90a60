//! Exit code, output stream, and hook script comparators.

use crate::config::ConfigError;
use crate::plugin::{Comparator, ComparisonResult, CrashResult, TraceHook, Value};
use crate::trace::Trace;
use regex::bytes::Regex;
use serde::Deserialize;
use std::path::PathBuf;

fn parse<T: serde::de::DeserializeOwned>(id: &str, config: &Value) -> Result<T, ConfigError> {
    serde_yaml::from_value(config.clone()).map_err(|err| ConfigError::invalid(id, err.to_string()))
}

/// Exit code expectation: a concrete code, or a boolean where `true` means
/// the process must succeed and `false` means it must fail.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExitCodeExpect {
    Success(bool),
    Code(i32),
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ExitCodeConfig {
    /// Compare success/failure instead of the exact code. Useful when the
    /// code itself is non-deterministic.
    #[serde(default)]
    coerce_bool: bool,
    #[serde(default)]
    expect: Option<ExitCodeExpect>,
}

/// Compares the traced process exit codes, optionally coerced to a
/// success/failure boolean, with an optional baseline expectation enforced
/// against the original binary.
pub struct ExitCodeComparator {
    coerce_bool: bool,
    expect: Option<ExitCodeExpect>,
}

pub fn exit_code(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    let config: ExitCodeConfig = parse("exit_code", config)?;
    Ok(Box::new(ExitCodeComparator {
        coerce_bool: config.coerce_bool || matches!(config.expect, Some(ExitCodeExpect::Success(_))),
        expect: config.expect,
    }))
}

impl ExitCodeComparator {
    // The supervisor always records the wait status before comparators run.
    fn code(trace: &Trace) -> i32 {
        trace.exit_code().unwrap_or_default()
    }
}

impl TraceHook for ExitCodeComparator {}

impl Comparator for ExitCodeComparator {
    fn id(&self) -> &str {
        "exit_code"
    }

    fn verify_original(&self, original: &Trace) -> Option<CrashResult> {
        let code = Self::code(original);
        match self.expect? {
            ExitCodeExpect::Code(expected) if code != expected => Some(CrashResult::with_comparator(
                original,
                format!("original exit code does not match expected: {code} != {expected}"),
                self.id(),
            )),
            ExitCodeExpect::Success(expected) if (code == 0) != expected => {
                Some(CrashResult::with_comparator(
                    original,
                    format!(
                        "original was expected to {} but exited with code {code}",
                        if expected { "succeed" } else { "fail" }
                    ),
                    self.id(),
                ))
            }
            _ => None,
        }
    }

    fn compare(&self, original: &Trace, debloated: &Trace) -> ComparisonResult {
        let mut original_code = Self::code(original);
        let mut debloated_code = Self::code(debloated);
        if self.coerce_bool {
            original_code = i32::from(original_code != 0);
            debloated_code = i32::from(debloated_code != 0);
        }

        if original_code != debloated_code {
            return ComparisonResult::error(
                self.id(),
                debloated,
                format!("exit codes do not match: {original_code} != {debloated_code}"),
            );
        }
        ComparisonResult::success(self.id(), debloated)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfig {
    /// When set, both traces must match this regex instead of matching each
    /// other byte for byte.
    #[serde(default)]
    pattern: Option<String>,
}

/// Compares a captured output stream (stdout or stderr) between traces,
/// either byte-exact or against a shared regex pattern.
pub struct StreamComparator {
    id: &'static str,
    pattern: Option<Regex>,
    read: fn(&Trace) -> std::io::Result<Vec<u8>>,
}

pub fn stdout(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    stream("stdout", Trace::read_stdout, config)
}

pub fn stderr(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    stream("stderr", Trace::read_stderr, config)
}

fn stream(
    id: &'static str,
    read: fn(&Trace) -> std::io::Result<Vec<u8>>,
    config: &Value,
) -> Result<Box<dyn Comparator>, ConfigError> {
    let config: StreamConfig = parse(id, config)?;
    let pattern = config
        .pattern
        .map(|pattern| Regex::new(&pattern))
        .transpose()
        .map_err(|err| ConfigError::invalid(id, err.to_string()))?;
    Ok(Box::new(StreamComparator { id, pattern, read }))
}

impl StreamComparator {
    fn content(&self, trace: &Trace) -> Vec<u8> {
        (self.read)(trace).unwrap_or_default()
    }
}

impl TraceHook for StreamComparator {}

impl Comparator for StreamComparator {
    fn id(&self) -> &str {
        self.id
    }

    fn verify_original(&self, original: &Trace) -> Option<CrashResult> {
        let pattern = self.pattern.as_ref()?;
        if pattern.is_match(&self.content(original)) {
            return None;
        }
        Some(CrashResult::with_comparator(
            original,
            format!("original {} does not match expected pattern", self.id),
            self.id,
        ))
    }

    fn compare(&self, original: &Trace, debloated: &Trace) -> ComparisonResult {
        let matched = match &self.pattern {
            Some(pattern) => pattern.is_match(&self.content(debloated)),
            None => self.content(original) == self.content(debloated),
        };
        if matched {
            ComparisonResult::success(self.id, debloated)
        } else {
            ComparisonResult::error(
                self.id,
                debloated,
                format!("{} content does not match", self.id),
            )
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
enum ExitCodeRule {
    Enabled(bool),
    Expect { expect: i32 },
}

impl Default for ExitCodeRule {
    fn default() -> Self {
        ExitCodeRule::Enabled(true)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct HookScriptConfig {
    #[serde(default)]
    exit_code: Option<ExitCodeRule>,
    /// Compare the captured script output.
    #[serde(default)]
    output: Option<bool>,
}

/// Compares a hook script run (setup, teardown, or concurrent) between
/// traces: the script exit code and its captured output. Traces without the
/// hook configured compare as successful.
pub struct HookScriptComparator {
    id: String,
    exit_code: ExitCodeRule,
    output: bool,
    /// Extracts the script's exit code and output path from a trace, or
    /// `None` when the hook never ran.
    extract: fn(&Trace) -> (Option<i32>, PathBuf),
}

pub fn setup_script(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    hook_script("setup_script", config, |trace| {
        (trace.setup_script_status, trace.setup_script_output())
    })
}

pub fn teardown_script(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    hook_script("teardown_script", config, |trace| {
        (trace.teardown_script_status, trace.teardown_script_output())
    })
}

pub fn concurrent_script(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    hook_script("concurrent_script", config, |trace| {
        (trace.concurrent_exit_code, trace.concurrent_script_output())
    })
}

fn hook_script(
    id: &str,
    config: &Value,
    extract: fn(&Trace) -> (Option<i32>, PathBuf),
) -> Result<Box<dyn Comparator>, ConfigError> {
    let config: HookScriptConfig = parse(id, config)?;
    Ok(Box::new(HookScriptComparator {
        id: id.to_string(),
        exit_code: config.exit_code.unwrap_or_default(),
        output: config.output.unwrap_or(true),
        extract,
    }))
}

impl TraceHook for HookScriptComparator {}

impl Comparator for HookScriptComparator {
    fn id(&self) -> &str {
        &self.id
    }

    fn verify_original(&self, original: &Trace) -> Option<CrashResult> {
        let ExitCodeRule::Expect { expect } = self.exit_code else {
            return None;
        };
        let (code, _) = (self.extract)(original);
        let code = code?;
        if code == expect {
            return None;
        }
        Some(CrashResult::with_comparator(
            original,
            format!("original {} exit code does not match expected: {code} != {expect}", self.id),
            &format!("{}[exit_code]", self.id),
        ))
    }

    fn compare(&self, original: &Trace, debloated: &Trace) -> ComparisonResult {
        let (original_code, original_output) = (self.extract)(original);
        let (debloated_code, debloated_output) = (self.extract)(debloated);

        // The hook did not run in either trace; nothing to compare.
        if original_code.is_none() && debloated_code.is_none() {
            return ComparisonResult::success(&self.id, debloated);
        }

        let code_error = match self.exit_code {
            ExitCodeRule::Enabled(false) => None,
            ExitCodeRule::Enabled(true) if original_code != debloated_code => Some(format!(
                "{} exit codes do not match: {:?} != {:?}",
                self.id, original_code, debloated_code
            )),
            ExitCodeRule::Expect { expect } if debloated_code != Some(expect) => Some(format!(
                "{} exit code does not match expected: {:?} != {expect}",
                self.id, debloated_code
            )),
            _ => None,
        };
        if let Some(details) = code_error {
            return ComparisonResult::error(&format!("{}[exit_code]", self.id), debloated, details);
        }

        if self.output {
            let original_content = std::fs::read(&original_output).unwrap_or_default();
            let debloated_content = std::fs::read(&debloated_output).unwrap_or_default();
            if original_content != debloated_content {
                return ComparisonResult::error(
                    &format!("{}[output]", self.id),
                    debloated,
                    format!("{} output does not match", self.id),
                );
            }
        }

        ComparisonResult::success(&self.id, debloated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ComparisonStatus;
    use crate::render::Template;
    use crate::trace::{StdinSource, TimeoutConstraint, TraceContext, TraceTemplate};
    use std::collections::BTreeMap;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::ExitStatus;
    use std::sync::Arc;

    fn trace(dir: &Path, engine: &str, exit_code: i32) -> Trace {
        let template = Arc::new(TraceTemplate {
            id: "t01".to_string(),
            name: "test".to_string(),
            summary: String::new(),
            arguments: Template::compile("").unwrap(),
            variables: Vec::new(),
            comparators: Vec::new(),
            expect_success: true,
            expect_signal: 0,
            timeout: TimeoutConstraint::default(),
            stdin: StdinSource::Empty,
            input_files: Vec::new(),
            setup: None,
            teardown: None,
            concurrent: None,
        });
        let context = Arc::new(TraceContext {
            template,
            id: "t01-001".to_string(),
            values: BTreeMap::new(),
            arguments: String::new(),
        });
        let cwd = dir.join(engine);
        std::fs::create_dir_all(&cwd).unwrap();
        let mut trace = Trace::new(cwd.join("binary"), context, cwd, engine);
        trace.wait_status = Some(ExitStatus::from_raw(exit_code << 8));
        trace
    }

    fn config(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn exit_code_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 0);
        let debloated = trace(dir.path(), "deb", 0);

        let comparator = exit_code(&config("{}")).unwrap();
        assert!(comparator.compare(&original, &debloated).is_success());
    }

    #[test]
    fn exit_code_mismatch_mentions_both_codes() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 0);
        let debloated = trace(dir.path(), "deb", 1);

        let comparator = exit_code(&config("{}")).unwrap();
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.status, ComparisonStatus::Error);
        assert!(result.details.contains("0 != 1"));
    }

    #[test]
    fn exit_code_coercion_treats_failures_alike() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 1);
        let debloated = trace(dir.path(), "deb", 2);

        let comparator = exit_code(&config("{coerce_bool: true}")).unwrap();
        assert!(comparator.compare(&original, &debloated).is_success());
    }

    #[test]
    fn exit_code_expectation_flags_the_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 1);

        let comparator = exit_code(&config("{expect: 0}")).unwrap();
        let crash = comparator.verify_original(&original).unwrap();
        assert_eq!(crash.comparator.as_deref(), Some("exit_code"));

        // Boolean expectation: `false` means the baseline must fail.
        let comparator = exit_code(&config("{expect: false}")).unwrap();
        assert!(comparator.verify_original(&original).is_none());
        let comparator = exit_code(&config("{expect: true}")).unwrap();
        assert!(comparator.verify_original(&original).is_some());
    }

    #[test]
    fn stream_exact_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 0);
        let debloated = trace(dir.path(), "deb", 0);
        std::fs::write(original.stdout_path(), b"hello").unwrap();
        std::fs::write(debloated.stdout_path(), b"hello").unwrap();

        let comparator = stdout(&config("{}")).unwrap();
        assert!(comparator.compare(&original, &debloated).is_success());

        std::fs::write(debloated.stdout_path(), b"goodbye").unwrap();
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.status, ComparisonStatus::Error);
        assert!(result.details.contains("stdout"));
    }

    #[test]
    fn stream_pattern_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 0);
        let debloated = trace(dir.path(), "deb", 0);
        std::fs::write(original.stdout_path(), b"hello, Adam").unwrap();
        std::fs::write(debloated.stdout_path(), b"hello, Bob").unwrap();

        let comparator = stdout(&config("{pattern: '^hello, [A-Z][a-z]+$'}")).unwrap();
        assert!(comparator.verify_original(&original).is_none());
        assert!(comparator.compare(&original, &debloated).is_success());

        std::fs::write(debloated.stdout_path(), b"hello, X-91b").unwrap();
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.status, ComparisonStatus::Error);
    }

    #[test]
    fn stream_pattern_rejects_deviant_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 0);
        std::fs::write(original.stdout_path(), b"hello, ").unwrap();

        let comparator = stdout(&config("{pattern: '^hello, [A-Z][a-z]+$'}")).unwrap();
        let crash = comparator.verify_original(&original).unwrap();
        assert_eq!(crash.comparator.as_deref(), Some("stdout"));
    }

    #[test]
    fn hook_script_skips_when_never_run() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig", 0);
        let debloated = trace(dir.path(), "deb", 0);

        let comparator = setup_script(&config("{}")).unwrap();
        assert!(comparator.compare(&original, &debloated).is_success());
    }

    #[test]
    fn hook_script_compares_exit_codes_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = trace(dir.path(), "orig", 0);
        let mut debloated = trace(dir.path(), "deb", 0);
        original.setup_script_status = Some(0);
        debloated.setup_script_status = Some(1);
        std::fs::write(original.setup_script_output(), b"hello").unwrap();
        std::fs::write(debloated.setup_script_output(), b"hello").unwrap();

        let comparator = setup_script(&config("{}")).unwrap();
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.comparator, "setup_script[exit_code]");

        debloated.setup_script_status = Some(0);
        std::fs::write(debloated.setup_script_output(), b"goodbye").unwrap();
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.comparator, "setup_script[output]");

        // Output comparison can be disabled.
        let comparator = setup_script(&config("{output: false}")).unwrap();
        assert!(comparator.compare(&original, &debloated).is_success());
    }

    #[test]
    fn hook_script_exit_code_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = trace(dir.path(), "orig", 0);
        original.setup_script_status = Some(1);

        let comparator = setup_script(&config("{exit_code: {expect: 0}}")).unwrap();
        let crash = comparator.verify_original(&original).unwrap();
        assert_eq!(crash.comparator.as_deref(), Some("setup_script[exit_code]"));

        original.setup_script_status = Some(0);
        assert!(comparator.verify_original(&original).is_none());
    }
}

//! Trace data model: templates, contexts, and individual executions.

use crate::plugin::{Comparator, CrashResult, FuzzVariable, ValueMap};
use crate::render::Template;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;

/// Engine tag used for traces of the original binary.
pub const ORIGINAL_ENGINE: &str = "__original__";

/// How long a trace may run and whether hitting the limit is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConstraint {
    pub seconds: u64,
    pub expected: bool,
}

impl Default for TimeoutConstraint {
    fn default() -> Self {
        TimeoutConstraint {
            seconds: 60,
            expected: false,
        }
    }
}

/// How completion is awaited once a concurrent script is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrentMode {
    /// Ignore the concurrent script's lifecycle and keep waiting on the
    /// traced process until the overall timeout.
    #[default]
    Detached,
    /// Treat the concurrent script as the primary completion signal: when it
    /// exits, the traced process is given a grace window and then asked to
    /// shut down with SIGINT.
    Client,
}

/// A companion script launched partway through a trace to model client/server
/// race scenarios.
#[derive(Debug, Clone)]
pub struct ConcurrentHook {
    pub script: Template,
    pub mode: ConcurrentMode,
    /// Seconds after process start before the script is launched. Also the
    /// grace window granted to the traced process in client mode.
    pub delay: f64,
    /// Number of times the script body is retried before its exit code is
    /// taken as final. Zero disables the retry wrapper.
    pub retries: u32,
}

/// Source of the traced process's standard input.
#[derive(Debug, Clone, Default)]
pub enum StdinSource {
    #[default]
    Empty,
    /// Rendered with the context values and written to a per-trace file.
    Template(Template),
    /// An existing file, resolved against the trace working directory when
    /// relative.
    File(PathBuf),
}

/// A file copied or generated into the trace working directory before the
/// process starts.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub source: PathBuf,
    pub dest: Option<PathBuf>,
    /// Octal permissions to apply; the source file's mode is copied when
    /// unset.
    pub mode: Option<u32>,
    /// Static files are copied verbatim; non-static files are rendered
    /// through the template engine with the context values.
    pub static_file: bool,
    /// Compiled content template for non-static files.
    pub template: Option<Template>,
}

impl InputFile {
    /// Resolve the destination path of this input file within a trace
    /// working directory.
    pub fn get_destination(&self, cwd: &Path) -> PathBuf {
        let name = self.source.file_name().map(PathBuf::from).unwrap_or_default();
        let Some(dest) = &self.dest else {
            return cwd.join(name);
        };

        let base = if dest.is_absolute() {
            dest.clone()
        } else {
            normalize(&cwd.join(dest))
        };

        if base.is_dir() { base.join(name) } else { base }
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other),
        }
    }
    result
}

/// An immutable trace configuration loaded from the project file. Shared by
/// reference across every context generated from it.
pub struct TraceTemplate {
    pub id: String,
    pub name: String,
    pub summary: String,
    pub arguments: Template,
    pub variables: Vec<Box<dyn FuzzVariable>>,
    pub comparators: Vec<Box<dyn Comparator>>,
    /// When false, the debloated binary is expected to fail this trace.
    pub expect_success: bool,
    /// Signal number the traced process is expected to die with; zero when
    /// no signal is expected.
    pub expect_signal: i32,
    pub timeout: TimeoutConstraint,
    pub stdin: StdinSource,
    pub input_files: Vec<InputFile>,
    pub setup: Option<Template>,
    pub teardown: Option<Template>,
    pub concurrent: Option<ConcurrentHook>,
}

impl TraceTemplate {
    /// Run every variable and comparator setup hook for a trace, in
    /// configuration order.
    pub fn run_setup_hooks(&self, trace: &Trace) -> anyhow::Result<()> {
        for variable in &self.variables {
            variable.setup(trace)?;
        }
        for comparator in &self.comparators {
            comparator.setup(trace)?;
        }
        Ok(())
    }

    /// Run every variable and comparator teardown hook for a trace.
    pub fn run_teardown_hooks(&self, trace: &Trace) -> anyhow::Result<()> {
        for variable in &self.variables {
            variable.teardown(trace)?;
        }
        for comparator in &self.comparators {
            comparator.teardown(trace)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TraceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceTemplate")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("expect_success", &self.expect_success)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// One concrete assignment of fuzz variable values derived from a template.
/// Read-only after creation; spawns one trace per engine, original included.
#[derive(Debug)]
pub struct TraceContext {
    pub template: Arc<TraceTemplate>,
    /// Unique id of the form `{template_id}-{sequence:03}`.
    pub id: String,
    pub values: ValueMap,
    /// The rendered (but unsplit) argument string. Arguments render with the
    /// context values only; trace builtin variables are available to script,
    /// stdin, and input file templates.
    pub arguments: String,
}

/// One subprocess execution of either the original binary or one debloated
/// variant for a given context. Created immediately before spawn, mutated by
/// the supervisor, and never reused.
pub struct Trace {
    /// Path to the binary symlink inside the trace working directory.
    pub binary: PathBuf,
    pub context: Arc<TraceContext>,
    pub cwd: PathBuf,
    /// `__original__` or the debloater engine name.
    pub debloater_engine: String,
    /// Directory the process is spawned in. The executor points this at the
    /// context's `current_trace` symlink, which resolves to `cwd`, so the
    /// paths a trace observes are identical across engines.
    pub launch_cwd: Option<PathBuf>,
    /// The rendered argument vector, excluding argv[0].
    pub arguments: Vec<String>,
    pub pid: Option<u32>,
    /// Raw wait status of the traced process, set by the supervisor.
    pub wait_status: Option<ExitStatus>,
    /// Whether the supervisor terminated the process at the deadline.
    pub timed_out: bool,
    pub start_time: Option<Instant>,
    pub setup_script_status: Option<i32>,
    pub teardown_script_status: Option<i32>,
    pub concurrent_pid: Option<u32>,
    pub concurrent_exit_code: Option<i32>,
    /// Per-trace key/value store for comparator memoization. This is the
    /// only place plugins may stash cross-call state.
    cache: RefCell<HashMap<String, String>>,
}

impl Trace {
    pub fn new(
        binary: PathBuf,
        context: Arc<TraceContext>,
        cwd: PathBuf,
        debloater_engine: impl Into<String>,
    ) -> Trace {
        Trace {
            binary,
            context,
            cwd,
            debloater_engine: debloater_engine.into(),
            launch_cwd: None,
            arguments: Vec::new(),
            pid: None,
            wait_status: None,
            timed_out: false,
            start_time: None,
            setup_script_status: None,
            teardown_script_status: None,
            concurrent_pid: None,
            concurrent_exit_code: None,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn is_original(&self) -> bool {
        self.debloater_engine == ORIGINAL_ENGINE
    }

    /// The directory the traced process and its scripts execute in.
    pub fn launch_dir(&self) -> &Path {
        self.launch_cwd.as_deref().unwrap_or(&self.cwd)
    }

    /// The program invocation path, which is also argv[0]. A binary inside
    /// the trace directory is invoked relative to the launch directory so
    /// every engine's trace sees the same program path.
    pub fn spawn_target(&self) -> PathBuf {
        if self.binary.parent() == Some(self.cwd.as_path()) {
            if let Some(name) = self.binary.file_name() {
                return Path::new(".").join(name);
            }
        }
        self.binary.clone()
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.cwd.join("__divergent_stdout__.bin")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.cwd.join("__divergent_stderr__.bin")
    }

    pub fn default_stdin_path(&self) -> PathBuf {
        self.cwd.join("__divergent_stdin__.bin")
    }

    pub fn setup_script_path(&self) -> PathBuf {
        self.cwd.join("__divergent_setup__.sh")
    }

    pub fn teardown_script_path(&self) -> PathBuf {
        self.cwd.join("__divergent_teardown__.sh")
    }

    pub fn concurrent_script_path(&self) -> PathBuf {
        self.cwd.join("__divergent_concurrent__.sh")
    }

    pub fn setup_script_output(&self) -> PathBuf {
        self.cwd.join("__divergent_setup_output__.bin")
    }

    pub fn teardown_script_output(&self) -> PathBuf {
        self.cwd.join("__divergent_teardown_output__.bin")
    }

    pub fn concurrent_script_output(&self) -> PathBuf {
        self.cwd.join("__divergent_concurrent_output__.bin")
    }

    pub fn read_stdout(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.stdout_path())
    }

    pub fn read_stderr(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.stderr_path())
    }

    /// Exit code of the traced process: the normal exit code, or the negated
    /// signal number when the process was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        let status = self.wait_status?;
        status.code().or_else(|| status.signal().map(|sig| -sig))
    }

    /// Signal that killed the traced process, if any.
    pub fn crash_signal(&self) -> Option<i32> {
        self.wait_status.and_then(|status| status.signal())
    }

    /// Build a crash result if the traced process was killed by a signal.
    pub fn crash_result(&self) -> Option<CrashResult> {
        let signal = self.crash_signal()?;
        Some(CrashResult::new(
            self,
            format!("process crashed with signal {signal}"),
        ))
    }

    /// Environment variables exposed to hook scripts and the traced process.
    /// PID and exit code entries are only present once known, so teardown
    /// scripts can observe the traced process's outcome.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("DIVERGENT_TRACE_DIR".to_string(), self.cwd.display().to_string()),
            (
                "DIVERGENT_TRACE_DEBLOATER".to_string(),
                self.debloater_engine.clone(),
            ),
            (
                "DIVERGENT_TRACE_BINARY".to_string(),
                self.binary.display().to_string(),
            ),
            ("DIVERGENT_CONTEXT_ID".to_string(), self.context.id.clone()),
        ];

        if let Some(pid) = self.pid {
            vars.push(("DIVERGENT_TRACE_PID".to_string(), pid.to_string()));
        }
        if let Some(code) = self.exit_code() {
            vars.push(("DIVERGENT_TRACE_EXIT_CODE".to_string(), code.to_string()));
        }
        if let Some(pid) = self.concurrent_pid {
            vars.push(("DIVERGENT_CONCURRENT_PID".to_string(), pid.to_string()));
        }
        if let Some(code) = self.concurrent_exit_code {
            vars.push((
                "DIVERGENT_CONCURRENT_EXIT_CODE".to_string(),
                code.to_string(),
            ));
        }

        vars
    }

    pub fn cache_get(&self, key: &str) -> Option<String> {
        self.cache.borrow().get(key).cloned()
    }

    pub fn cache_put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.cache.borrow_mut().insert(key.into(), value.into());
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.context.id, self.debloater_engine)
    }
}

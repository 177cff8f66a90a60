//! Trace execution pipeline: context generation, working directory setup,
//! supervised runs, and divergence accounting.

use crate::config::ConfigError;
use crate::parameters::CombinationGenerator;
use crate::plugin::{value_to_string, ComparisonResult, ComparisonStatus, CrashResult};
use crate::project::Project;
use crate::render::{split_arguments, RenderError};
use crate::report::ReportError;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::trace::{ConcurrentMode, StdinSource, Trace, TraceContext, ORIGINAL_ENGINE};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Comparator id attached to results synthesized by the executor itself,
/// such as an expected failure that did not happen.
pub const EXECUTOR_COMPARATOR_ID: &str = "__executor__";

const SIGINT: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("directory already exists: {0} (use --force to overwrite)")]
    DirectoryExists(PathBuf),
    #[error("plugin hook failed: {0}")]
    Hook(anyhow::Error),
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> ExecutorError {
    let path = path.into();
    move |source| ExecutorError::Io { path, source }
}

/// Drives entire projects: generates contexts from each template, runs the
/// original binary and every debloated variant, and reports divergences.
///
/// Traces run strictly sequentially. Every trace gets a private working
/// directory, so a rerun with `overwrite_existing_report` is the only way
/// two runs ever touch the same path.
pub struct Executor {
    pub root: PathBuf,
    /// Upper bound on contexts generated per template.
    pub max_permutations: usize,
    /// Also write reports for traces with no divergence.
    pub report_successes: bool,
    /// Delete and recreate an existing project report directory.
    pub overwrite_existing_report: bool,
}

impl Executor {
    pub fn new(root: impl Into<PathBuf>) -> Executor {
        Executor {
            root: root.into(),
            max_permutations: 100,
            report_successes: false,
            overwrite_existing_report: false,
        }
    }

    /// Create the report root directory if it does not exist yet.
    pub fn setup(&self) -> Result<(), ExecutorError> {
        std::fs::create_dir_all(&self.root).map_err(io_err(&self.root))
    }

    /// Run every template of a project and return the number of contexts
    /// that produced a divergence or a crash.
    pub fn run_project(&self, project: &Project) -> Result<usize, ExecutorError> {
        if project.directory.exists() {
            if !self.overwrite_existing_report {
                return Err(ExecutorError::DirectoryExists(project.directory.clone()));
            }
            std::fs::remove_dir_all(&project.directory).map_err(io_err(&project.directory))?;
        }
        std::fs::create_dir_all(&project.directory).map_err(io_err(&project.directory))?;

        let mut context_count = 0;
        let mut error_count = 0;
        for template in &project.templates {
            info!("running template {} ({})", template.name, template.id);
            for context in self.generate_contexts(template)? {
                context_count += 1;
                error_count += self.run_context(project, &context)?;
            }
        }

        info!(
            "project {}: {} contexts executed, {} with divergences",
            project.name, context_count, error_count
        );
        Ok(error_count)
    }

    /// Expand a template's fuzz variables into concrete contexts, capped at
    /// `max_permutations`. Context ids are numbered from 1 in generation
    /// order so reruns produce identical directory layouts.
    pub fn generate_contexts(
        &self,
        template: &Arc<crate::trace::TraceTemplate>,
    ) -> Result<Vec<Arc<TraceContext>>, ExecutorError> {
        let combinations = CombinationGenerator::new(template)?;
        let mut contexts = Vec::new();
        for (sequence, values) in combinations.take(self.max_permutations).enumerate() {
            let variables: HashMap<String, String> = values
                .iter()
                .map(|(name, value)| (name.clone(), value_to_string(value)))
                .collect();
            let arguments = template.arguments.render(&variables)?;
            contexts.push(Arc::new(TraceContext {
                template: Arc::clone(template),
                id: format!("{}-{:03}", template.id, sequence + 1),
                values,
                arguments,
            }));
        }
        debug!(
            "template {} expanded into {} contexts",
            template.id,
            contexts.len()
        );
        Ok(contexts)
    }

    /// Run one context against the original binary and every debloater.
    /// Returns the number of debloated traces that diverged or crashed, or
    /// 1 when the original binary itself failed baseline verification.
    pub fn run_context(
        &self,
        project: &Project,
        context: &Arc<TraceContext>,
    ) -> Result<usize, ExecutorError> {
        let context_dir = project.context_directory(context);
        if context_dir.exists() {
            return Err(ExecutorError::DirectoryExists(context_dir));
        }
        std::fs::create_dir_all(&context_dir).map_err(io_err(&context_dir))?;

        let original = self.run_trace(project, context, &project.original, ORIGINAL_ENGINE)?;
        if let Some(crash) = self.check_original_trace(&original) {
            warn!("{}: original binary failed: {}", original, crash.details);
            crash.save(&project.crash_filename(&original))?;
            return Ok(1);
        }

        let mut error_count = 0;
        for debloater in &project.debloaters {
            let trace = self.run_trace(project, context, &debloater.binary, &debloater.engine)?;
            let mut results = self.compare_trace(&original, &trace);
            let crash = self.check_trace_crash(&trace);
            let errors = self.get_errors(&trace, &mut results, crash.is_some());

            // A crash that the template expects is not an error and is not
            // persisted.
            let crash = crash.filter(|_| context.template.expect_success);
            if !errors.is_empty() || crash.is_some() {
                error_count += 1;
            }

            let reports = if self.report_successes { &results } else { &errors };
            if !reports.is_empty() {
                project.save_report(&trace, reports)?;
            }
            if let Some(crash) = crash {
                warn!("{}: {}", trace, crash.details);
                crash.save(&project.crash_filename(&trace))?;
            }
        }
        Ok(error_count)
    }

    /// Validate the original trace before any debloater comparison: the
    /// baseline must not crash and every comparator must accept it.
    fn check_original_trace(&self, original: &Trace) -> Option<CrashResult> {
        if let Some(crash) = self.check_trace_crash(original) {
            return Some(crash);
        }
        original
            .context
            .template
            .comparators
            .iter()
            .find_map(|comparator| comparator.verify_original(original))
    }

    /// Detect abnormal trace termination. Timeouts and crash signals that
    /// the template declared as expected are not crashes, and neither is a
    /// SIGINT death under a client-mode concurrent script, since the
    /// supervisor itself delivers that signal.
    fn check_trace_crash(&self, trace: &Trace) -> Option<CrashResult> {
        let template = &trace.context.template;
        if trace.timed_out && !template.timeout.expected {
            return Some(CrashResult::new(
                trace,
                "Process was terminated because of an unexpected timeout",
            ));
        }
        if !trace.timed_out && template.timeout.expected {
            return Some(CrashResult::new(
                trace,
                "Process was expected to time out but exited early",
            ));
        }
        if trace.timed_out {
            return None;
        }

        let signal = trace.crash_signal()?;
        if signal == template.expect_signal {
            return None;
        }
        let client_mode = template
            .concurrent
            .as_ref()
            .is_some_and(|hook| hook.mode == ConcurrentMode::Client);
        if client_mode && signal == SIGINT {
            return None;
        }
        trace.crash_result()
    }

    fn compare_trace(&self, original: &Trace, debloated: &Trace) -> Vec<ComparisonResult> {
        debug!("comparing {} against {}", debloated, original);
        debloated
            .context
            .template
            .comparators
            .iter()
            .map(|comparator| comparator.compare(original, debloated))
            .collect()
    }

    /// Apply the template's `expect_success` policy to raw comparison
    /// results. When failure is expected, failing results are flipped to
    /// successes and an all-success trace becomes the error.
    fn get_errors(
        &self,
        trace: &Trace,
        results: &mut Vec<ComparisonResult>,
        crashed: bool,
    ) -> Vec<ComparisonResult> {
        let errors: Vec<ComparisonResult> = results
            .iter()
            .filter(|result| !result.is_success())
            .cloned()
            .collect();

        if trace.context.template.expect_success {
            return errors;
        }

        if !errors.is_empty() || crashed {
            for result in results.iter_mut().filter(|result| !result.is_success()) {
                result.status = ComparisonStatus::Success;
                result.details.push_str(" (expected error treated as success)");
            }
            return Vec::new();
        }

        let error = ComparisonResult::error(
            EXECUTOR_COMPARATOR_ID,
            trace,
            "trace was expected to fail but did not",
        );
        results.push(error.clone());
        vec![error]
    }

    /// Prepare one trace working directory, run the binary under the
    /// supervisor, and run the teardown hooks.
    pub fn run_trace(
        &self,
        project: &Project,
        context: &Arc<TraceContext>,
        binary: &Path,
        engine: &str,
    ) -> Result<Trace, ExecutorError> {
        let trace_dir = project.trace_directory(context, engine);
        if trace_dir.exists() {
            return Err(ExecutorError::DirectoryExists(trace_dir));
        }
        std::fs::create_dir_all(&trace_dir).map_err(io_err(&trace_dir))?;

        // The binary runs through a symlink so argv[0] carries the original
        // program name regardless of the debloater's output filename.
        let link_name = project
            .link_filename
            .clone()
            .or_else(|| {
                project
                    .original
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "binary".to_string());
        let link = trace_dir.join(link_name);
        std::os::unix::fs::symlink(binary, &link).map_err(io_err(&link))?;

        let mut trace = Trace::new(link, Arc::clone(context), trace_dir, engine);
        trace.arguments = split_arguments(&context.arguments)?;

        self.copy_input_files(&trace)?;
        self.create_stdin_file(&trace)?;
        self.write_hook_scripts(&trace)?;

        // `current_trace` points at whichever trace is active, so helper
        // tooling can follow the run without knowing the engine layout.
        let current = project.context_directory(context).join("current_trace");
        if current.symlink_metadata().is_ok() {
            std::fs::remove_file(&current).map_err(io_err(&current))?;
        }
        std::os::unix::fs::symlink(&trace.cwd, &current).map_err(io_err(&current))?;
        trace.launch_cwd = Some(current.clone());

        let template = &context.template;
        template
            .run_setup_hooks(&trace)
            .map_err(ExecutorError::Hook)?;
        if template.setup.is_some() {
            trace.setup_script_status = Some(self.run_hook_script(
                &trace,
                &trace.setup_script_path(),
                &trace.setup_script_output(),
            )?);
        }

        Supervisor::default().run(&mut trace)?;

        template
            .run_teardown_hooks(&trace)
            .map_err(ExecutorError::Hook)?;
        if template.teardown.is_some() {
            trace.teardown_script_status = Some(self.run_hook_script(
                &trace,
                &trace.teardown_script_path(),
                &trace.teardown_script_output(),
            )?);
        }

        std::fs::remove_file(&current).map_err(io_err(&current))?;
        Ok(trace)
    }

    fn copy_input_files(&self, trace: &Trace) -> Result<(), ExecutorError> {
        for input in &trace.context.template.input_files {
            let dest = input.get_destination(&trace.cwd);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }

            if input.static_file {
                if input.source.is_dir() {
                    copy_dir(&input.source, &dest)?;
                } else {
                    std::fs::copy(&input.source, &dest).map_err(io_err(&dest))?;
                }
            } else if let Some(template) = &input.template {
                let content = template.render(&render_values(trace))?;
                std::fs::write(&dest, content).map_err(io_err(&dest))?;
            }

            let mode = match input.mode {
                Some(mode) => mode,
                // Rendered files keep the source file's permissions.
                None => std::fs::metadata(&input.source)
                    .map_err(io_err(&input.source))?
                    .permissions()
                    .mode(),
            };
            if dest.is_file() {
                std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))
                    .map_err(io_err(&dest))?;
            }
        }
        Ok(())
    }

    fn create_stdin_file(&self, trace: &Trace) -> Result<(), ExecutorError> {
        match &trace.context.template.stdin {
            StdinSource::Empty | StdinSource::File(_) => Ok(()),
            StdinSource::Template(template) => {
                let content = template.render(&render_values(trace))?;
                let path = trace.default_stdin_path();
                std::fs::write(&path, content).map_err(io_err(&path))
            }
        }
    }

    fn write_hook_scripts(&self, trace: &Trace) -> Result<(), ExecutorError> {
        let template = &trace.context.template;
        let values = render_values(trace);

        if let Some(script) = &template.setup {
            write_script(&trace.setup_script_path(), &script.render(&values)?)?;
        }
        if let Some(script) = &template.teardown {
            write_script(&trace.teardown_script_path(), &script.render(&values)?)?;
        }
        if let Some(hook) = &template.concurrent {
            let body = hook.script.render(&values)?;
            if hook.retries > 0 {
                let body_path = trace.cwd.join("__divergent_concurrent_body__.sh");
                write_script(&body_path, &body)?;
                let wrapper = format!(
                    "for attempt in $(seq {attempts}); do\n\
                     \x20   /bin/bash {body} && exit 0\n\
                     \x20   code=$?\n\
                     done\n\
                     exit $code\n",
                    attempts = hook.retries + 1,
                    body = body_path.display(),
                );
                write_script(&trace.concurrent_script_path(), &wrapper)?;
            } else {
                write_script(&trace.concurrent_script_path(), &body)?;
            }
        }
        Ok(())
    }

    /// Run a setup or teardown script to completion and return its exit
    /// code. Script output is captured to a per-trace file.
    fn run_hook_script(
        &self,
        trace: &Trace,
        script: &Path,
        output: &Path,
    ) -> Result<i32, ExecutorError> {
        let log = File::create(output).map_err(io_err(output))?;
        let status = Command::new("/bin/bash")
            .arg(script)
            .current_dir(trace.launch_dir())
            .envs(trace.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone().map_err(io_err(output))?))
            .stderr(Stdio::from(log))
            .status()
            .map_err(io_err(script))?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Template variables for trace-level renders: the context's fuzz values
/// plus the trace builtins.
fn render_values(trace: &Trace) -> HashMap<String, String> {
    let mut values: HashMap<String, String> = trace
        .context
        .values
        .iter()
        .map(|(name, value)| (name.clone(), value_to_string(value)))
        .collect();
    values.insert("trace_dir".to_string(), trace.cwd.display().to_string());
    values.insert("binary".to_string(), trace.binary.display().to_string());
    values.insert("context_id".to_string(), trace.context.id.clone());
    values.insert("engine".to_string(), trace.debloater_engine.clone());
    values
}

fn write_script(path: &Path, body: &str) -> Result<(), ExecutorError> {
    let content = format!("#!/bin/bash\n{body}");
    std::fs::write(path, content).map_err(io_err(path))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(io_err(path))
}

fn copy_dir(source: &Path, dest: &Path) -> Result<(), ExecutorError> {
    std::fs::create_dir_all(dest).map_err(io_err(dest))?;
    for entry in std::fs::read_dir(source).map_err(io_err(source))? {
        let entry = entry.map_err(io_err(source))?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(io_err(&target))?;
        }
    }
    Ok(())
}

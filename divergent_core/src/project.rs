//! Resolved project model: binaries, debloater engines, and compiled trace
//! templates.

use crate::config::{ConfigError, ConcurrentFile, ProjectFile, StdinFile, TemplateFile};
use crate::plugin::ComparisonResult;
use crate::registry::PluginRegistry;
use crate::render::Template;
use crate::report::{ReportError, ReportRecord};
use crate::trace::{
    ConcurrentHook, ConcurrentMode, InputFile, StdinSource, TimeoutConstraint, Trace, TraceContext,
    TraceTemplate,
};
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One debloater engine under test and the binary it produced.
#[derive(Debug, Clone)]
pub struct Debloater {
    pub engine: String,
    pub binary: PathBuf,
}

/// A fully resolved project: every path is absolute and verified, every
/// template compiled, every plugin constructed. Loading is the single
/// validation chokepoint; execution assumes a well-formed project.
pub struct Project {
    pub name: String,
    /// Per-project report directory, `<root>/<name>`.
    pub directory: PathBuf,
    pub original: PathBuf,
    pub debloaters: Vec<Debloater>,
    pub link_filename: Option<String>,
    pub version: Option<String>,
    pub templates: Vec<Arc<TraceTemplate>>,
}

impl Project {
    /// Load and resolve a project YAML file. Relative binary and input file
    /// paths are resolved against the project file's directory.
    pub fn load(
        registry: &PluginRegistry,
        root: &Path,
        path: &Path,
    ) -> Result<Project, ConfigError> {
        let file = ProjectFile::load(path)?;
        let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let base = base
            .canonicalize()
            .map_err(|source| ConfigError::Io { path: base, source })?;

        let original = resolve_binary(&base, &file.original)?;
        let debloaters = file
            .debloaters
            .iter()
            .map(|(engine, binary)| {
                Ok(Debloater {
                    engine: engine.clone(),
                    binary: resolve_binary(&base, binary)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let templates = file
            .templates
            .iter()
            .map(|template| compile_template(registry, &base, template).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "loaded project {} with {} debloaters and {} templates",
            file.name,
            debloaters.len(),
            templates.len()
        );

        Ok(Project {
            directory: root.join(&file.name),
            name: file.name,
            original,
            debloaters,
            link_filename: file.link_filename,
            version: file.version,
            templates,
        })
    }

    /// Directory holding every trace of one context.
    pub fn context_directory(&self, context: &TraceContext) -> PathBuf {
        self.directory.join(format!("trace-{}", context.id))
    }

    /// Working directory for one engine's trace within a context.
    pub fn trace_directory(&self, context: &TraceContext, engine: &str) -> PathBuf {
        self.context_directory(context).join(engine)
    }

    pub fn report_filename(&self, trace: &Trace, successful: bool) -> PathBuf {
        let status = if successful { "success" } else { "error" };
        self.directory.join(format!(
            "report-{}-{}-{}.yml",
            trace.debloater_engine, status, trace.context.id
        ))
    }

    pub fn crash_filename(&self, trace: &Trace) -> PathBuf {
        self.directory.join(format!(
            "crash-{}-{}.yml",
            trace.debloater_engine, trace.context.id
        ))
    }

    /// Write the comparison report for a trace. The report is a success
    /// report only when every result in it succeeded.
    pub fn save_report(
        &self,
        trace: &Trace,
        results: &[ComparisonResult],
    ) -> Result<(), ReportError> {
        let successful = results.iter().all(ComparisonResult::is_success);
        let path = self.report_filename(trace, successful);
        ReportRecord::new(trace, results).save(&path)
    }
}

fn resolve_binary(base: &Path, binary: &Path) -> Result<PathBuf, ConfigError> {
    let path = if binary.is_absolute() {
        binary.to_path_buf()
    } else {
        base.join(binary)
    };
    if !path.is_file() {
        return Err(ConfigError::MissingBinary(path));
    }
    Ok(path)
}

fn compile_template(
    registry: &PluginRegistry,
    base: &Path,
    file: &TemplateFile,
) -> Result<TraceTemplate, ConfigError> {
    // The id is stable across runs for the same argument string, so report
    // directories from repeated invocations line up.
    let id = format!("{:x}", md5::compute(file.arguments.as_bytes()));
    let name = file.name.clone().unwrap_or_else(|| id.clone());

    let variables = file
        .variables
        .iter()
        .map(|(key, config)| {
            let name = key
                .as_str()
                .ok_or_else(|| ConfigError::invalid("variables", "names must be strings"))?;
            registry.build_variable(name, config)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let comparators = file
        .comparators
        .iter()
        .map(|config| registry.build_comparator(config))
        .collect::<Result<Vec<_>, _>>()?;

    let stdin = match &file.stdin {
        None => StdinSource::Empty,
        Some(StdinFile::Inline(body)) => StdinSource::Template(Template::compile(body)?),
        Some(StdinFile::File { file }) => StdinSource::File(file.clone()),
    };

    let input_files = file
        .input_files
        .iter()
        .map(|entry| {
            let source = if entry.source.is_absolute() {
                entry.source.clone()
            } else {
                base.join(&entry.source)
            };
            let template = if entry.static_file {
                None
            } else {
                let content =
                    std::fs::read_to_string(&source).map_err(|source_err| ConfigError::Io {
                        path: source.clone(),
                        source: source_err,
                    })?;
                Some(Template::compile(&content)?)
            };
            Ok(InputFile {
                source,
                dest: entry.dest.clone(),
                mode: entry.mode.as_ref().map(|mode| mode.parse()).transpose()?,
                static_file: entry.static_file,
                template,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let script = |body: &Option<String>| -> Result<Option<Template>, ConfigError> {
        let Some(body) = body else { return Ok(None) };
        let body = if file.script_exit_on_first_error {
            format!("set -e\n\n{body}")
        } else {
            body.clone()
        };
        Ok(Some(Template::compile(&body)?))
    };

    let concurrent = file
        .concurrent
        .as_ref()
        .map(|config| compile_concurrent(config, file.script_exit_on_first_error))
        .transpose()?;

    Ok(TraceTemplate {
        id,
        name,
        summary: file.summary.clone(),
        arguments: Template::compile(&file.arguments)?,
        variables,
        comparators,
        expect_success: file.expect_success,
        expect_signal: file.expect_signal,
        timeout: TimeoutConstraint {
            seconds: file.timeout.seconds(),
            expected: file.timeout.expected(),
        },
        stdin,
        input_files,
        setup: script(&file.setup)?,
        teardown: script(&file.teardown)?,
        concurrent,
    })
}

fn compile_concurrent(
    config: &ConcurrentFile,
    exit_on_first_error: bool,
) -> Result<ConcurrentHook, ConfigError> {
    let mode = match config.mode.as_deref() {
        None => ConcurrentMode::Detached,
        Some("client") => ConcurrentMode::Client,
        Some(other) => return Err(ConfigError::UnsupportedConcurrentMode(other.to_string())),
    };
    let body = if exit_on_first_error {
        format!("set -e\n\n{}", config.run)
    } else {
        config.run.clone()
    };
    Ok(ConcurrentHook {
        script: Template::compile(&body)?,
        mode,
        delay: config.delay,
        retries: config.retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ValueMap;
    use std::io::Write;

    fn write_project(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("project.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        path
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir.join(name).parent().unwrap()).unwrap();
        std::fs::write(dir.join(name), b"#!/bin/sh\n").unwrap();
    }

    const PROJECT_YAML: &str = r#"
name: echo
original: bin/echo
link_filename: target
debloaters:
  chisel: chisel/echo
templates:
  - name: flags
    arguments: '-n {{message}}'
    variables:
      message:
        type: str
        values: [hello]
    comparators:
      - stdout
      - exit_code
    setup: 'echo ready'
    concurrent:
      run: 'echo poke'
      mode: client
      delay: 0.5
"#;

    #[test]
    fn load_resolves_paths_and_plugins() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "bin/echo");
        touch(dir.path(), "chisel/echo");
        let path = write_project(dir.path(), PROJECT_YAML);

        let registry = PluginRegistry::with_builtins();
        let project = Project::load(&registry, Path::new("/reports"), &path).unwrap();

        assert_eq!(project.name, "echo");
        assert_eq!(project.directory, Path::new("/reports/echo"));
        assert!(project.original.is_absolute());
        assert_eq!(project.debloaters.len(), 1);
        assert_eq!(project.debloaters[0].engine, "chisel");
        assert_eq!(project.link_filename.as_deref(), Some("target"));

        let template = &project.templates[0];
        assert_eq!(template.name, "flags");
        assert_eq!(template.variables.len(), 1);
        assert_eq!(template.comparators.len(), 2);
        assert!(template.setup.is_some());

        let concurrent = template.concurrent.as_ref().unwrap();
        assert_eq!(concurrent.mode, ConcurrentMode::Client);
        assert_eq!(concurrent.delay, 0.5);
        // Scripts abort on the first failing command by default.
        assert!(concurrent.script.source().starts_with("set -e\n\n"));
    }

    #[test]
    fn load_rejects_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_project(dir.path(), "name: x\noriginal: bin/missing\n");

        let registry = PluginRegistry::new();
        let err = Project::load(&registry, Path::new("/reports"), &path).err().unwrap();
        assert!(matches!(err, ConfigError::MissingBinary(_)));
    }

    #[test]
    fn load_rejects_unknown_concurrent_mode() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "bin/echo");
        let yaml = r#"
name: x
original: bin/echo
templates:
  - arguments: ''
    concurrent:
      run: 'true'
      mode: server
"#;
        let path = write_project(dir.path(), yaml);
        let registry = PluginRegistry::with_builtins();
        let err = Project::load(&registry, Path::new("/reports"), &path).err().unwrap();
        assert!(matches!(err, ConfigError::UnsupportedConcurrentMode(mode) if mode == "server"));
    }

    #[test]
    fn template_id_is_stable_for_identical_arguments() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "bin/echo");
        let yaml = "name: x\noriginal: bin/echo\ntemplates:\n  - arguments: '-n'\n";
        let path = write_project(dir.path(), yaml);

        let registry = PluginRegistry::with_builtins();
        let a = Project::load(&registry, Path::new("/r"), &path).unwrap();
        let b = Project::load(&registry, Path::new("/r"), &path).unwrap();
        assert_eq!(a.templates[0].id, b.templates[0].id);
        // Unnamed templates fall back to the id.
        assert_eq!(a.templates[0].name, a.templates[0].id);
    }

    fn project_paths() -> Project {
        Project {
            name: "proj".to_string(),
            directory: PathBuf::from("/reports/proj"),
            original: PathBuf::from("/bin/true"),
            debloaters: Vec::new(),
            link_filename: None,
            version: None,
            templates: Vec::new(),
        }
    }

    #[test]
    fn report_and_crash_filenames() {
        let project = project_paths();
        let template = Arc::new(TraceTemplate {
            id: "t01".to_string(),
            name: "t".to_string(),
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
            id: "blah".to_string(),
            values: ValueMap::new(),
            arguments: String::new(),
        });

        assert_eq!(
            project.context_directory(&context),
            Path::new("/reports/proj/trace-blah")
        );
        assert_eq!(
            project.trace_directory(&context, "chisel"),
            Path::new("/reports/proj/trace-blah/chisel")
        );

        let trace = Trace::new(
            PathBuf::from("/x"),
            context,
            PathBuf::from("/reports/proj/trace-blah/chisel"),
            "chisel",
        );
        assert_eq!(
            project.report_filename(&trace, true),
            Path::new("/reports/proj/report-chisel-success-blah.yml")
        );
        assert_eq!(
            project.report_filename(&trace, false),
            Path::new("/reports/proj/report-chisel-error-blah.yml")
        );
        assert_eq!(
            project.crash_filename(&trace),
            Path::new("/reports/proj/crash-chisel-blah.yml")
        );
    }
}

use clap::Parser;
use divergent_core::executor::Executor;
use divergent_core::project::Project;
use divergent_core::registry::PluginRegistry;
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::process::ExitCode;

/// Differential testing of debloated binaries: run the original binary and
/// each debloated variant under generated input combinations and report
/// every behavioral divergence.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Project YAML file describing the binaries and trace templates.
    project_filename: PathBuf,

    /// Enable debug logging.
    #[clap(short, long)]
    verbose: bool,

    /// Also write reports for traces with no divergence.
    #[clap(short = 's', long)]
    report_successes: bool,

    /// Directory to write reports and trace working directories into.
    #[clap(short, long, default_value = "./reports")]
    report_dir: PathBuf,

    /// Maximum number of variable combinations per trace template.
    #[clap(short, long, default_value_t = 100)]
    max_permutations: usize,

    /// Delete an existing project report directory before running.
    #[clap(short, long)]
    force: bool,
}

fn run(cli: &Cli) -> anyhow::Result<usize> {
    let mut executor = Executor::new(&cli.report_dir);
    executor.max_permutations = cli.max_permutations;
    executor.report_successes = cli.report_successes;
    executor.overwrite_existing_report = cli.force;
    executor.setup()?;

    let registry = PluginRegistry::with_builtins();
    let project = Project::load(&registry, &executor.root, &cli.project_filename)?;
    info!(
        "loaded project {} ({} debloaters, {} templates)",
        project.name,
        project.debloaters.len(),
        project.templates.len()
    );

    Ok(executor.run_project(&project)?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    match run(&cli) {
        // The exit code mirrors the divergence count so scripts can gate on
        // it directly; values above 255 would wrap.
        Ok(errors) => ExitCode::from(errors.min(255) as u8),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(255)
        }
    }
}

mod logging;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use filespin::config::ProjectConfig;
use filespin::launcher::Launcher;
use filespin::process::DataProcess;
use filespin::scheduler::{Scheduler, StopSignal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "filespin", version, about = "Resumable file-oriented ETL pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every data process of a project once, one child process each
    Run {
        /// Path to the project JSON file
        project: PathBuf,
        /// Maximum concurrent child processes (default: 2 x CPU count)
        #[arg(long)]
        slots: Option<usize>,
    },
    /// Recover and drain a single data process in this process
    RunProcess {
        /// Path to the project JSON file
        project: PathBuf,
        /// Name of the data process
        name: String,
    },
    /// Launch data processes on their schedules until killed
    Start {
        /// Project JSON file, or a directory of them
        path: PathBuf,
        /// Maximum concurrent child processes (default: 2 x CPU count)
        #[arg(long)]
        slots: Option<usize>,
        /// Seconds between scheduler checks
        #[arg(long, default_value_t = 1)]
        tick: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { project, slots } => run(&project, slots),
        Commands::RunProcess { project, name } => run_process(&project, &name),
        Commands::Start { path, slots, tick } => start(&path, slots, tick),
    }
}

fn run(project_path: &Path, slots: Option<usize>) -> Result<()> {
    let project = ProjectConfig::load(project_path)?;
    let names: Vec<String> = project.data_processes.iter().map(|p| p.name.clone()).collect();
    let launcher = Launcher::new(slots)?;
    let reports = launcher.run_all(project_path, &names);
    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.success())
        .map(|r| r.process.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("data processes failed: {}", failed.join(", "));
    }
    Ok(())
}

fn run_process(project_path: &Path, name: &str) -> Result<()> {
    let project = ProjectConfig::load(project_path)?;
    let mut process = DataProcess::from_project(&project, name)?;
    let recovered = process.recover()?;
    let outcomes = process.run()?;
    let failed = recovered.iter().chain(&outcomes).filter(|o| !o.is_done()).count();
    tracing::info!(
        process = name,
        recovered = recovered.len(),
        runs = outcomes.len(),
        failed,
        "data process finished"
    );
    Ok(())
}

fn project_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let pattern = path.join("*.json");
    let pattern = pattern.to_string_lossy();
    let mut files = glob::glob(&pattern)
        .with_context(|| format!("bad project pattern {pattern}"))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("list {}", path.display()))?;
    files.sort();
    if files.is_empty() {
        bail!("no project files in {}", path.display());
    }
    Ok(files)
}

fn start(path: &Path, slots: Option<usize>, tick: u64) -> Result<()> {
    let launcher = Arc::new(Launcher::new(slots)?);
    let mut scheduler = Scheduler::new(Duration::from_secs(tick.max(1)));
    for file in project_files(path)? {
        let project = ProjectConfig::load(&file)?;
        for process in &project.data_processes {
            if process.schedules.is_empty() {
                launcher.spawn(&file, &process.name);
                continue;
            }
            for schedule in &process.schedules {
                let launcher = Arc::clone(&launcher);
                let file = file.clone();
                let name = process.name.clone();
                scheduler
                    .add(&format!("{}/{}", file.display(), name), schedule, move || {
                        // A tick that finds the previous run still going is skipped.
                        launcher.spawn(&file, &name);
                        Ok(())
                    })
                    .with_context(|| format!("data process `{}`", process.name))?;
            }
        }
    }
    scheduler.run(&StopSignal::new());
    Ok(())
}

//! Bounded launching of `run-process` children.
//!
//! Every data process runs in its own OS process. The launcher owns a rayon
//! pool whose size is the admission limit: a child occupies one worker until
//! it exits, and queued launches wait for a free worker. A data process has
//! at most one scheduled child queued or running, so its checkpoint
//! directory keeps a single writer.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

/// Result of one child process.
#[derive(Clone, Debug)]
pub struct JobReport {
    pub process: String,
    /// Exit code; `None` when the child was killed by a signal or never started.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl JobReport {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Spawns `<program> <args..> run-process <project> <name>` under a worker limit.
pub struct Launcher {
    pool: ThreadPool,
    program: PathBuf,
    prefix: Vec<OsString>,
    in_flight: Arc<Mutex<HashSet<(PathBuf, String)>>>,
}

/// Default admission limit: twice the CPU count.
#[must_use]
pub fn default_slots() -> usize {
    2 * num_cpus::get().max(1)
}

impl Launcher {
    /// Launcher for the running executable.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable path is unknown or the worker pool
    /// cannot be built.
    pub fn new(slots: Option<usize>) -> Result<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Self::with_program(program, Vec::new(), slots)
    }

    /// Launcher for an arbitrary program; `prefix` goes before `run-process`.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool cannot be built.
    pub fn with_program(program: impl Into<PathBuf>, prefix: Vec<OsString>, slots: Option<usize>) -> Result<Self> {
        let slots = slots.unwrap_or_else(default_slots).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(slots)
            .thread_name(|i| format!("filespin-launch-{i}"))
            .build()
            .context("build launcher pool")?;
        Ok(Self {
            pool,
            program: program.into(),
            prefix,
            in_flight: Arc::default(),
        })
    }

    #[must_use]
    pub fn slots(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn command(&self, project: &Path, process: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix).arg("run-process").arg(project).arg(process);
        cmd
    }

    /// Run one child to completion on the calling thread.
    #[must_use]
    pub fn run_one(&self, project: &Path, process: &str) -> JobReport {
        run_child(self.command(project, process), process)
    }

    /// Run `processes` concurrently, at most `slots` at a time, and wait for
    /// all of them. Reports come back in input order.
    #[must_use]
    pub fn run_all(&self, project: &Path, processes: &[String]) -> Vec<JobReport> {
        self.pool.install(|| {
            processes
                .par_iter()
                .map(|name| run_child(self.command(project, name), name))
                .collect()
        })
    }

    /// Whether a spawned child of `process` is still queued or running.
    #[must_use]
    pub fn is_in_flight(&self, project: &Path, process: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(project.to_path_buf(), process.to_string()))
    }

    /// Queue a child without waiting; the report is only logged.
    ///
    /// Returns `false` and launches nothing while an earlier child of the
    /// same project and process is still queued or running.
    pub fn spawn(&self, project: &Path, process: &str) -> bool {
        let job = (project.to_path_buf(), process.to_string());
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.clone())
        {
            tracing::warn!(process, project = %project.display(), "previous run still in flight, launch skipped");
            return false;
        }
        let cmd = self.command(project, process);
        let in_flight = Arc::clone(&self.in_flight);
        self.pool.spawn(move || {
            run_child(cmd, &job.1);
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job);
        });
        true
    }
}

fn run_child(mut cmd: Command, process: &str) -> JobReport {
    tracing::info!(process, command = ?cmd, "launching");
    match cmd.output() {
        Ok(out) => {
            let report = JobReport {
                process: process.to_string(),
                status: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            };
            for line in report.stdout.lines() {
                tracing::info!(process, "{line}");
            }
            for line in report.stderr.lines() {
                tracing::warn!(process, "{line}");
            }
            if report.success() {
                tracing::info!(process, "process finished");
            } else {
                tracing::error!(process, status = ?report.status, "process exited with failure");
            }
            report
        }
        Err(err) => {
            tracing::error!(process, error = %err, "cannot launch process");
            JobReport {
                process: process.to_string(),
                status: None,
                stdout: String::new(),
                stderr: err.to_string(),
            }
        }
    }
}

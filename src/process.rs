//! The per-pipeline driver.
//!
//! A [`DataProcess`] owns one source stream and an ordered step chain. Each
//! message fetched from the stream becomes one run: a [`TaskContext`] threads
//! the current files through the steps, the in-flight checkpoint is rewritten
//! after every step, and the run is committed to the durable log once the
//! chain is exhausted. A failing step marks the run failed and leaves its
//! checkpoint behind; the driver moves on to the next message.

use crate::checkpoint::{CheckpointStore, RunCheckpoint, current_timestamp_ms};
use crate::config::{DataProcessConfig, ProjectConfig, SpinSettings};
use crate::context::TaskContext;
use crate::error::{SpinError, spin_error};
use crate::functions::FunctionStep;
use crate::pkindex::PkCacheRegistry;
use crate::registry::{Engine, Registry};
use crate::scheduler::StopSignal;
use crate::stream::{DataFileMessage, Delivery, Stream};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::remove_dir_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Done,
    Failed { step: Option<String>, reason: String },
}

/// Summary of one run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// `None` when the message never became a run.
    pub run_id: Option<String>,
    pub source_url: String,
    pub status: RunStatus,
    /// Names of the steps executed by this attempt, in order.
    pub executed_steps: Vec<String>,
    /// Index of the first step executed when the run was resumed.
    pub resumed_from: Option<usize>,
    /// Files the last executed step produced.
    pub output_files: Vec<PathBuf>,
}

impl RunOutcome {
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }

    fn rejected(message: &DataFileMessage, err: &anyhow::Error) -> Self {
        Self {
            run_id: None,
            source_url: message.file_url.clone(),
            status: RunStatus::Failed {
                step: None,
                reason: format!("{err:#}"),
            },
            executed_steps: Vec::new(),
            resumed_from: None,
            output_files: Vec::new(),
        }
    }
}

/// A configured pipeline bound to its collaborators.
pub struct DataProcess {
    name: String,
    steps: Vec<FunctionStep>,
    registry: Arc<dyn Registry>,
    source: Arc<dyn Stream>,
    store: CheckpointStore,
    tmp_root: PathBuf,
    keep_temp: bool,
    pk_caches: PkCacheRegistry,
    /// Failed runs of this process lifetime by source URL, resumed when the
    /// stream redelivers the same source.
    failed_runs: HashMap<String, String>,
}

/// Borrowed view of the parts a run needs besides the dedup caches.
struct Chain<'p> {
    pipeline: &'p str,
    steps: &'p [FunctionStep],
    store: &'p CheckpointStore,
    source: &'p dyn Stream,
    tmp_root: &'p Path,
    keep_temp: bool,
}

impl DataProcess {
    /// Bind a process definition to `registry`.
    ///
    /// Every name the process refers to is resolved here, so a broken
    /// configuration fails before any file is fetched.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::MissingStream`], [`SpinError::MissingStorage`],
    /// [`SpinError::MissingSchema`] or [`SpinError::Configuration`] for
    /// unresolved names and bad step arguments, or an I/O error if the
    /// checkpoint directory cannot be created.
    pub fn new(conf: &DataProcessConfig, registry: Arc<dyn Registry>, settings: &SpinSettings) -> Result<Self> {
        let source = registry
            .lookup_stream(&conf.source)
            .ok_or_else(|| SpinError::MissingStream(conf.source.clone()))
            .with_context(|| format!("data process `{}`", conf.name))?;
        let steps = conf
            .processes
            .iter()
            .map(FunctionStep::from_config)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("data process `{}`", conf.name))?;
        for step in &steps {
            step.check(registry.as_ref())
                .with_context(|| format!("data process `{}`", conf.name))?;
        }
        let store = CheckpointStore::open(settings.working_dir.join("meta").join(&conf.name))?;
        tracing::debug!(pipeline = %conf.name, steps = steps.len(), source = %conf.source, "data process ready");
        Ok(Self {
            name: conf.name.clone(),
            steps,
            registry,
            source,
            store,
            tmp_root: settings.working_dir.join("tmp"),
            keep_temp: settings.keep_temp,
            pk_caches: PkCacheRegistry::new(),
            failed_runs: HashMap::new(),
        })
    }

    /// Build the named process of a loaded project.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] if no process has that name, or
    /// any error of [`Engine::from_config`] and [`DataProcess::new`].
    pub fn from_project(project: &ProjectConfig, name: &str) -> Result<Self> {
        let conf = project
            .data_process(name)
            .ok_or_else(|| SpinError::Configuration(format!("no data process named `{name}`")))?;
        let engine = Engine::from_config(project)?;
        Self::new(conf, Arc::new(engine), &project.filespin)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[FunctionStep] {
        &self.steps
    }

    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.store
    }

    fn parts(&mut self) -> (Chain<'_>, &dyn Registry, &mut PkCacheRegistry) {
        (
            Chain {
                pipeline: &self.name,
                steps: &self.steps,
                store: &self.store,
                source: self.source.as_ref(),
                tmp_root: &self.tmp_root,
                keep_temp: self.keep_temp,
            },
            self.registry.as_ref(),
            &mut self.pk_caches,
        )
    }

    /// Apply the restart protocol: seed the source with what the log and
    /// the in-flight checkpoints say, then finish every interrupted run.
    ///
    /// An interrupted run resumes after its last successful step. When the
    /// files it needs are gone or changed, the source file is run again from
    /// the first step.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint directory cannot be read or the
    /// source rejects the recovery sets. Failures of individual runs are
    /// reported in the outcomes.
    pub fn recover(&mut self) -> Result<Vec<RunOutcome>> {
        let state = self.store.recover()?;
        self.source
            .recover(&state.processed, &state.processing())
            .with_context(|| format!("recover stream `{}`", self.source.name()))?;
        tracing::info!(
            pipeline = %self.name,
            processed = state.processed.len(),
            interrupted = state.inflight.len(),
            "recovery state loaded"
        );
        let mut outcomes = Vec::with_capacity(state.inflight.len());
        for checkpoint in state.inflight {
            outcomes.push(self.resume(checkpoint)?);
        }
        Ok(outcomes)
    }

    fn resume(&mut self, checkpoint: RunCheckpoint) -> Result<RunOutcome> {
        let run_id = checkpoint.run_id.clone();
        let message = checkpoint.source.clone();
        let resumed = {
            let (chain, registry, pk_caches) = self.parts();
            match TaskContext::restore(checkpoint, registry, pk_caches) {
                Ok(Some((ctx, next_step))) => {
                    tracing::info!(pipeline = %chain.pipeline, %run_id, source = %message.file_url, next_step, "resuming run");
                    Some(chain.execute(ctx, next_step, true))
                }
                Ok(None) => {
                    tracing::warn!(pipeline = %chain.pipeline, %run_id, source = %message.file_url, "checkpointed files changed, restarting run");
                    if let Err(err) = chain.store.clear_inflight(&run_id) {
                        tracing::warn!(%run_id, error = %format!("{err:#}"), "cannot remove stale checkpoint");
                    }
                    None
                }
                Err(err) => {
                    tracing::error!(pipeline = %chain.pipeline, %run_id, error = %format!("{err:#}"), "cannot restore run");
                    chain.source.task_failed(&message).ok();
                    Some(RunOutcome::rejected(&message, &err))
                }
            }
        };
        if resumed.as_ref().is_none_or(|o| o.run_id.is_none()) {
            // The source starts over, so keys the abandoned run registered
            // must not count against it.
            self.pk_caches.withdraw(&run_id);
        }
        match resumed {
            Some(outcome) => {
                self.note(&outcome);
                Ok(outcome)
            }
            None => self.start(message),
        }
    }

    /// Fetch one message from the source and run it through the chain.
    ///
    /// Returns `None` when the source has nothing to deliver.
    ///
    /// # Errors
    ///
    /// Returns the source's fetch error. Step failures and checkpoint or log
    /// I/O errors are reported as a failed [`RunOutcome`].
    pub fn run_once(&mut self, block: bool, timeout: Option<Duration>) -> Result<Option<RunOutcome>> {
        let Some(message) = self
            .source
            .get(block, timeout)
            .with_context(|| format!("fetch from `{}`", self.source.name()))?
        else {
            return Ok(None);
        };
        tracing::debug!(pipeline = %self.name, source = %message.file_url, "message received");
        if let Some(run_id) = self.failed_runs.remove(&message.file_url) {
            let path = self.store.inflight_path(&run_id);
            match self.store.load_inflight(&path) {
                Ok(checkpoint) => return self.resume(checkpoint).map(Some),
                Err(err) => {
                    tracing::debug!(%run_id, error = %err, "failed run not resumable");
                    self.pk_caches.withdraw(&run_id);
                }
            }
        }
        self.start(message).map(Some)
    }

    fn start(&mut self, message: DataFileMessage) -> Result<RunOutcome> {
        let (chain, registry, pk_caches) = self.parts();
        let delivery = match Delivery::resolve(message.clone(), registry) {
            Ok(d) => d,
            Err(err) => {
                tracing::error!(pipeline = %chain.pipeline, source = %message.file_url, error = %format!("{err:#}"), "cannot resolve message");
                chain.source.task_failed(&message).ok();
                return Ok(RunOutcome::rejected(&message, &err));
            }
        };
        let event_time = delivery.timestamp(chrono::Utc::now().timestamp());
        let ctx = match TaskContext::new(
            chain.pipeline,
            chain.tmp_root,
            delivery.message,
            delivery.files,
            event_time,
            registry,
            pk_caches,
        ) {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::error!(pipeline = %chain.pipeline, source = %message.file_url, error = %format!("{err:#}"), "cannot start run");
                chain.source.task_failed(&message).ok();
                return Ok(RunOutcome::rejected(&message, &err));
            }
        };
        tracing::info!(pipeline = %chain.pipeline, run_id = %ctx.run_id(), source = %ctx.source().file_url, "run started");
        let outcome = chain.execute(ctx, 0, false);
        self.note(&outcome);
        Ok(outcome)
    }

    fn note(&mut self, outcome: &RunOutcome) {
        if let (RunStatus::Failed { .. }, Some(run_id)) = (&outcome.status, &outcome.run_id) {
            self.failed_runs.insert(outcome.source_url.clone(), run_id.clone());
        }
    }

    /// Process messages until the source has nothing ready.
    ///
    /// A transient fetch error ends the pass early; the next scheduled pass
    /// retries.
    ///
    /// # Errors
    ///
    /// Returns non-transient fetch errors.
    pub fn run(&mut self) -> Result<Vec<RunOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            match self.run_once(false, None) {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => break,
                Err(err) if spin_error(&err).is_some_and(SpinError::is_transient) => {
                    tracing::warn!(pipeline = %self.name, error = %format!("{err:#}"), "fetch failed, retrying next pass");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        let failed = outcomes.iter().filter(|o| !o.is_done()).count();
        tracing::info!(pipeline = %self.name, runs = outcomes.len(), failed, "pass finished");
        Ok(outcomes)
    }

    /// Block on the source until `stop` is raised, polling every `poll`.
    ///
    /// # Errors
    ///
    /// Returns non-transient fetch errors.
    pub fn run_until_stopped(&mut self, stop: &StopSignal, poll: Duration) -> Result<usize> {
        let mut runs = 0;
        while !stop.is_stopped() {
            match self.run_once(true, Some(poll)) {
                Ok(Some(_)) => runs += 1,
                Ok(None) => {}
                Err(err) if spin_error(&err).is_some_and(SpinError::is_transient) => {
                    tracing::warn!(pipeline = %self.name, error = %format!("{err:#}"), "fetch failed");
                    std::thread::sleep(poll);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(runs)
    }
}

/// Why a run stopped before committing.
struct Abort {
    step: Option<String>,
    reason: String,
}

impl Abort {
    fn bookkeeping(step: Option<&str>, err: &anyhow::Error) -> Self {
        Self {
            step: step.map(str::to_string),
            reason: format!("cannot record run progress: {err:#}"),
        }
    }
}

impl Chain<'_> {
    fn checkpoint(&self, ctx: &TaskContext<'_>) -> Result<()> {
        self.store.save_inflight(&ctx.snapshot()?)?;
        Ok(())
    }

    /// Run steps `from..` over the context's current files and commit.
    ///
    /// Every failure after the run started, including checkpoint and log
    /// I/O, ends in `task_failed` and a failed outcome.
    fn execute(&self, mut ctx: TaskContext<'_>, from: usize, resumed: bool) -> RunOutcome {
        let run_id = ctx.run_id().to_string();
        let source_url = ctx.source().file_url.clone();
        let resumed_from = resumed.then_some(from);
        let mut executed = Vec::new();

        if let Err(abort) = self.drive(&mut ctx, from, &mut executed) {
            tracing::error!(pipeline = %self.pipeline, %run_id, step = ?abort.step, error = %abort.reason, "run failed");
            if let Err(ack) = self.source.task_failed(ctx.source()) {
                tracing::warn!(%run_id, error = %format!("{ack:#}"), "stream rejected task_failed");
            }
            return RunOutcome {
                run_id: Some(run_id),
                source_url,
                status: RunStatus::Failed {
                    step: abort.step,
                    reason: abort.reason,
                },
                executed_steps: executed,
                resumed_from,
                output_files: Vec::new(),
            };
        }

        // Committed already; the log wins over a lost acknowledgement.
        if let Err(ack) = self.source.task_done(ctx.source()) {
            tracing::warn!(%run_id, source = %source_url, error = %format!("{ack:#}"), "stream rejected task_done");
        }
        ctx.settle_pk_keys();
        if !self.keep_temp {
            remove_temp(ctx.temp_dir());
        }
        tracing::info!(pipeline = %self.pipeline, %run_id, source = %source_url, steps = executed.len(), "run done");
        RunOutcome {
            run_id: Some(run_id),
            source_url,
            status: RunStatus::Done,
            executed_steps: executed,
            resumed_from,
            output_files: ctx.current_files().iter().map(|f| f.path().to_path_buf()).collect(),
        }
    }

    fn drive(&self, ctx: &mut TaskContext<'_>, from: usize, executed: &mut Vec<String>) -> Result<(), Abort> {
        self.checkpoint(ctx).map_err(|err| Abort::bookkeeping(None, &err))?;
        for (index, step) in self.steps.iter().enumerate().skip(from) {
            if ctx.current_files().is_empty() {
                tracing::debug!(pipeline = %self.pipeline, run_id = %ctx.run_id(), step = %step.name(), "no files left, chain ends");
                break;
            }
            let started = current_timestamp_ms();
            let files = ctx.current_files().to_vec();
            tracing::debug!(pipeline = %self.pipeline, run_id = %ctx.run_id(), step = %step.name(), files = files.len(), "step started");
            let result = match files.as_slice() {
                [file] => step.process(file, ctx),
                _ => step.process_multi(&files, ctx),
            };
            match result {
                Ok(outputs) => {
                    let produced = outputs.len();
                    ctx.advance(step.name(), step.function(), index, started, outputs)
                        .and_then(|()| self.checkpoint(ctx))
                        .map_err(|err| Abort::bookkeeping(Some(step.name()), &err))?;
                    executed.push(step.name().to_string());
                    tracing::debug!(
                        pipeline = %self.pipeline,
                        run_id = %ctx.run_id(),
                        step = %step.name(),
                        produced,
                        elapsed_ms = current_timestamp_ms().saturating_sub(started),
                        "step finished"
                    );
                }
                Err(err) => {
                    let recorded = ctx
                        .record_failure(step.name(), step.function(), index, started)
                        .and_then(|()| self.checkpoint(ctx));
                    if let Err(io) = recorded {
                        tracing::warn!(run_id = %ctx.run_id(), step = %step.name(), error = %format!("{io:#}"), "cannot checkpoint failed step");
                    }
                    let reason = SpinError::StepExecution {
                        step: step.name().to_string(),
                        reason: format!("{err:#}"),
                    }
                    .to_string();
                    return Err(Abort {
                        step: Some(step.name().to_string()),
                        reason,
                    });
                }
            }
        }
        ctx.finish();
        ctx.snapshot()
            .and_then(|checkpoint| self.store.commit(&checkpoint))
            .map_err(|err| Abort::bookkeeping(None, &err))
    }
}

fn remove_temp(dir: &Path) {
    if let Err(err) = remove_dir_all(dir)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), error = %err, "cannot remove run directory");
    }
}

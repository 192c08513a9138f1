//! Durable run log and in-flight checkpoints for crash recovery.
//!
//! Each data process keeps its checkpoints in one directory:
//!
//! ```text
//! <working_dir>/meta/<process>/
//!   runs.jsonl            one JSON line per committed run, append-only
//!   inflight/<run_id>.json  the latest state of a run that has not committed
//! ```
//!
//! An in-flight checkpoint is rewritten (atomically) after every step and
//! deleted on commit, so any file left in `inflight/` at startup belongs to
//! a run that crashed or failed. [`CheckpointStore::recover`] pairs those
//! with the run log to decide what to resume.
//!
//! # Usage
//!
//! ```no_run
//! use filespin::checkpoint::CheckpointStore;
//! use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let store = CheckpointStore::open("./.filespin/meta/events")?;
//! let state = store.recover()?;
//! println!("{} sources done, {} to resume", state.processed.len(), state.inflight.len());
//! # Ok(())
//! # }
//! ```

use crate::data_file::DataFileMeta;
use crate::io::jsonl::{atomic_write, read_all};
use crate::stream::DataFileMessage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions, create_dir_all, read_dir, remove_file};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const RUN_LOG: &str = "runs.jsonl";
const INFLIGHT: &str = "inflight";

/// One executed step of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub function: String,
    pub start_time: u64,
    pub end_time: u64,
    pub success: bool,
    pub input_files: Vec<DataFileMeta>,
    pub output_files: Vec<DataFileMeta>,
    /// Position of the step in the configured chain.
    pub order_index: usize,
}

/// Serializable state of one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub pipeline: String,
    pub run_id: String,
    pub temp_dir: PathBuf,
    pub source: DataFileMessage,
    pub source_files: Vec<DataFileMeta>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Milliseconds since the epoch.
    pub start_time: u64,
    #[serde(default)]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub success: bool,
    /// Data timestamp (seconds) the dedup cache is aged with.
    pub event_time: i64,
    /// SHA-256 over the rest of the record, checked when loading.
    #[serde(default)]
    pub checksum: String,
}

impl RunCheckpoint {
    /// Checksum of the serialized record without its `checksum` field.
    fn digest(&self) -> Result<String> {
        let mut body = serde_json::to_value(self).context("serialize checkpoint body")?;
        if let Some(fields) = body.as_object_mut() {
            fields.remove("checksum");
        }
        Ok(compute_checksum(body.to_string().as_bytes()))
    }

    /// Stamp the checksum for the current contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized.
    pub fn seal(&mut self) -> Result<()> {
        self.checksum = self.digest()?;
        Ok(())
    }

    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.digest().is_ok_and(|d| d == self.checksum)
    }

    /// The step the run should continue with and the files it consumes:
    /// the outputs of the last successful step, or the source files when no
    /// step succeeded yet.
    #[must_use]
    pub fn resume_point(&self) -> (usize, &[DataFileMeta]) {
        self.steps
            .iter()
            .rev()
            .find(|s| s.success)
            .map_or((0, self.source_files.as_slice()), |s| {
                (s.order_index + 1, s.output_files.as_slice())
            })
    }
}

/// What a data process must do after a restart.
#[derive(Debug, Default)]
pub struct RecoveryState {
    /// Source URLs whose runs committed.
    pub processed: HashSet<String>,
    /// Interrupted runs, oldest first; at most one per source URL.
    pub inflight: Vec<RunCheckpoint>,
}

impl RecoveryState {
    /// Source URLs being resumed.
    #[must_use]
    pub fn processing(&self) -> HashSet<String> {
        self.inflight.iter().map(|c| c.source.file_url.clone()).collect()
    }
}

/// Checkpoint directory of one data process.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// # Errors
    ///
    /// Returns an error if the checkpoint directories cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let inflight = dir.join(INFLIGHT);
        create_dir_all(&inflight)
            .with_context(|| format!("create checkpoint directory {}", inflight.display()))?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(RUN_LOG)
    }

    #[must_use]
    pub fn inflight_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(INFLIGHT).join(format!("{run_id}.json"))
    }

    /// Overwrite the run's in-flight checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the atomic write fails.
    pub fn save_inflight(&self, checkpoint: &RunCheckpoint) -> Result<PathBuf> {
        let mut sealed = checkpoint.clone();
        sealed.seal()?;
        let bytes = serde_json::to_vec_pretty(&sealed).context("serialize checkpoint")?;
        let path = self.inflight_path(&checkpoint.run_id);
        atomic_write(&path, &bytes)?;
        tracing::trace!(run_id = %checkpoint.run_id, steps = checkpoint.steps.len(), "checkpoint saved");
        Ok(path)
    }

    /// Load one in-flight checkpoint, rejecting files that fail the checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or its
    /// checksum does not match.
    pub fn load_inflight(&self, path: &Path) -> Result<RunCheckpoint> {
        let raw = read_all(path)?;
        let checkpoint: RunCheckpoint = serde_json::from_slice(&raw)
            .with_context(|| format!("parse checkpoint {}", path.display()))?;
        anyhow::ensure!(
            checkpoint.is_intact(),
            "checkpoint integrity check failed for {}",
            path.display()
        );
        Ok(checkpoint)
    }

    /// Delete a run's in-flight checkpoint if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear_inflight(&self, run_id: &str) -> Result<()> {
        let path = self.inflight_path(run_id);
        match remove_file(&path) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(e).with_context(|| format!("remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    /// Append one run to the durable log with a single write and fsync.
    ///
    /// A torn line left by an interrupted append is terminated first, so the
    /// new record always starts on a line of its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened, written or synced.
    pub fn append_log(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        let mut sealed = checkpoint.clone();
        sealed.seal()?;
        let mut line = serde_json::to_string(&sealed).context("serialize run record")?;
        line.push('\n');
        let path = self.log_path();
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        if ends_mid_line(&mut f).with_context(|| format!("inspect tail of {}", path.display()))? {
            tracing::warn!(log = %path.display(), "terminating torn run record");
            line.insert(0, '\n');
        }
        f.write_all(line.as_bytes())
            .with_context(|| format!("append to {}", path.display()))?;
        f.sync_data()
            .with_context(|| format!("sync {}", path.display()))?;
        Ok(())
    }

    /// Committed runs, in append order.
    ///
    /// A trailing line without a newline is an append still in progress
    /// and is ignored; other unreadable lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn read_log(&self) -> Result<Vec<RunCheckpoint>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = read_all(&path)?;
        let complete = raw
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(&raw[..0], |end| &raw[..=end]);
        let mut runs = Vec::new();
        for (i, line) in complete.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<RunCheckpoint>(line) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(log = %path.display(), line = i + 1, error = %e, "skipping unreadable run record"),
            }
        }
        Ok(runs)
    }

    /// Mark a run complete: append it to the log, then drop its in-flight
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails; the in-flight checkpoint is
    /// kept when the append fails.
    pub fn commit(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        self.append_log(checkpoint)?;
        self.clear_inflight(&checkpoint.run_id)?;
        tracing::debug!(run_id = %checkpoint.run_id, source = %checkpoint.source.file_url, "run committed");
        Ok(())
    }

    /// Build the restart plan from the log and the in-flight directory.
    ///
    /// The newest in-flight checkpoint wins for its source URL, even over a
    /// committed run of the same source. Older duplicates and unreadable
    /// checkpoints are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or the in-flight directory cannot be read.
    pub fn recover(&self) -> Result<RecoveryState> {
        let mut processed: HashSet<String> = self
            .read_log()?
            .into_iter()
            .filter(|r| r.success)
            .map(|r| r.source.file_url)
            .collect();

        let dir = self.dir.join(INFLIGHT);
        let mut latest: HashMap<String, RunCheckpoint> = HashMap::new();
        for entry in read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
                continue;
            }
            let checkpoint = match self.load_inflight(&path) {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(checkpoint = %path.display(), error = %err, "discarding checkpoint");
                    remove_file(&path).ok();
                    continue;
                }
            };
            let url = checkpoint.source.file_url.clone();
            match latest.get(&url) {
                Some(kept) if kept.start_time >= checkpoint.start_time => {
                    self.clear_inflight(&checkpoint.run_id)?;
                }
                _ => {
                    if let Some(older) = latest.insert(url, checkpoint) {
                        self.clear_inflight(&older.run_id)?;
                    }
                }
            }
        }

        let mut inflight: Vec<RunCheckpoint> = latest.into_values().collect();
        inflight.sort_by_key(|c| c.start_time);
        for c in &inflight {
            processed.remove(&c.source.file_url);
        }
        tracing::debug!(processed = processed.len(), inflight = inflight.len(), dir = %self.dir.display(), "recovery state loaded");
        Ok(RecoveryState { processed, inflight })
    }
}

/// Whether a non-empty file's last byte is something other than a newline.
fn ends_mid_line(f: &mut File) -> std::io::Result<bool> {
    if f.metadata()?.len() == 0 {
        return Ok(false);
    }
    f.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Compute SHA-256 checksum of data.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Get current timestamp in milliseconds since epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

use super::{DataFileMessage, Stream, flag, millis};
use crate::data_file::Tags;
use crate::error::SpinError;
use crate::storage::StorageType;
use anyhow::{Context, Result, anyhow};
use glob::{Pattern, glob};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct ScanState {
    waiting: VecDeque<String>,
    processing: HashSet<String>,
    processed: HashSet<String>,
    failed: HashSet<String>,
}

impl ScanState {
    fn known(&self, url: &str) -> bool {
        self.processing.contains(url)
            || self.processed.contains(url)
            || self.failed.contains(url)
            || self.waiting.iter().any(|w| w == url)
    }
}

/// Delivers every file under a directory tree once.
///
/// With the `watch` option the directory is rescanned on every `get`, so
/// files that appear later are picked up; a blocking `get` polls every
/// `poll_interval_ms`. Failed files are not redelivered within the same
/// process; their checkpoint makes them resumable after a restart.
pub struct LocalStream {
    name: String,
    root: PathBuf,
    watch: bool,
    poll_interval: Duration,
    state: Mutex<ScanState>,
}

impl LocalStream {
    pub fn new(name: &str, root: impl AsRef<Path>, options: &Map<String, Value>) -> Self {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            tracing::warn!(stream = name, dir = %root.display(), "stream directory does not exist yet");
        }
        Self {
            name: name.to_string(),
            root,
            watch: flag(options, "watch"),
            poll_interval: Duration::from_millis(millis(options, "poll_interval_ms", 1000)),
            state: Mutex::new(ScanState::default()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ScanState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("stream `{}` state lock poisoned", self.name))
    }

    fn scan(&self, state: &mut ScanState) -> Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        let pattern = format!("{}/**/*", Pattern::escape(&self.root.to_string_lossy()));
        let mut found = Vec::new();
        for entry in glob(&pattern).with_context(|| format!("invalid glob pattern: {pattern}"))? {
            let path = entry.map_err(|e| SpinError::TransientFetch(e.to_string()))?;
            if path.is_file() {
                found.push(DataFileMessage::for_local_path(&path.to_string_lossy()).file_url);
            }
        }
        found.sort();
        for url in found {
            if !state.known(&url) {
                tracing::trace!(stream = %self.name, file = %url, "queued");
                state.waiting.push_back(url);
            }
        }
        Ok(())
    }

    fn try_take(&self, first: bool) -> Result<Option<DataFileMessage>> {
        let mut state = self.lock()?;
        if first || self.watch {
            self.scan(&mut state)?;
        }
        Ok(state.waiting.pop_front().map(|url| {
            state.processing.insert(url.clone());
            DataFileMessage::new(url, Tags::new())
        }))
    }
}

impl Stream for LocalStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Option<DataFileMessage>> {
        let started = Instant::now();
        if let Some(msg) = self.try_take(true)? {
            return Ok(Some(msg));
        }
        if !block || !self.watch {
            return Ok(None);
        }
        loop {
            let wait = match timeout {
                Some(t) => match t.checked_sub(started.elapsed()) {
                    Some(left) if !left.is_zero() => left.min(self.poll_interval),
                    _ => return Ok(None),
                },
                None => self.poll_interval,
            };
            thread::sleep(wait);
            if let Some(msg) = self.try_take(false)? {
                return Ok(Some(msg));
            }
        }
    }

    fn task_done(&self, message: &DataFileMessage) -> Result<()> {
        let mut state = self.lock()?;
        state.processing.remove(&message.file_url);
        state.processed.insert(message.file_url.clone());
        Ok(())
    }

    fn task_failed(&self, message: &DataFileMessage) -> Result<()> {
        let mut state = self.lock()?;
        state.processing.remove(&message.file_url);
        state.failed.insert(message.file_url.clone());
        Ok(())
    }

    fn recover(&self, processed: &HashSet<String>, processing: &HashSet<String>) -> Result<()> {
        let mut state = self.lock()?;
        state.waiting.retain(|url| !processed.contains(url) && !processing.contains(url));
        state.processed.extend(processed.iter().cloned());
        state.processing.extend(processing.iter().cloned());
        tracing::debug!(
            stream = %self.name,
            processed = processed.len(),
            processing = processing.len(),
            "recovered delivery state"
        );
        Ok(())
    }

    fn send_to_stream(&self, path: &str, _tags: &Tags, _storage_type: StorageType) -> Result<()> {
        Err(SpinError::Configuration(format!(
            "local stream `{}` cannot publish messages (tried {path})",
            self.name
        ))
        .into())
    }
}

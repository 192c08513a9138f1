use super::{DataFileMessage, Stream, millis};
use crate::data_file::Tags;
use crate::error::SpinError;
use crate::io::jsonl::{atomic_write, read_all};
use crate::storage::StorageType;
use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const QUEUE: &str = "queue";
const CLAIMED: &str = "claimed";

/// A message queue kept in a directory.
///
/// Each message is one JSON file under `queue/`, named
/// `<visible-at-ms>-<uuid>.json` so lexical order is delivery order and a
/// message can be hidden until a given time. `get` claims the oldest
/// visible message by renaming it into `claimed/`; the rename is the only
/// synchronisation, so several producers may share one spool. A spool has a
/// single consumer process.
pub struct SpoolStream {
    name: String,
    root: PathBuf,
    poll_interval: Duration,
    retry_delay: Duration,
    claims: Mutex<HashMap<String, PathBuf>>,
}

impl SpoolStream {
    /// Open (creating if needed) the spool at `root`.
    ///
    /// Options: `poll_interval_ms` (default 500) and `retry_delay_ms`, how
    /// long a failed message stays hidden (default 60000).
    ///
    /// # Errors
    ///
    /// Returns an error if the spool directories cannot be created.
    pub fn open(name: &str, root: impl AsRef<Path>, options: &Map<String, Value>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in [QUEUE, CLAIMED] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
        }
        Ok(Self {
            name: name.to_string(),
            root,
            poll_interval: Duration::from_millis(millis(options, "poll_interval_ms", 500)),
            retry_delay: Duration::from_millis(millis(options, "retry_delay_ms", 60_000)),
            claims: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enqueue a message directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the message file cannot be written.
    pub fn publish(&self, message: &DataFileMessage) -> Result<PathBuf> {
        let body = message.to_json()?;
        let dest = self.root.join(QUEUE).join(entry_name(now_ms()));
        atomic_write(&dest, body.as_bytes())?;
        tracing::debug!(stream = %self.name, file = %message.file_url, "published pointer");
        Ok(dest)
    }

    /// Number of messages waiting in the queue, visible or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue directory cannot be listed.
    pub fn pending(&self) -> Result<usize> {
        Ok(self.entries(QUEUE)?.len())
    }

    fn entries(&self, sub: &str) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(sub);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)
            .map_err(|e| SpinError::TransientFetch(format!("list {}: {e}", dir.display())))?
        {
            let path = entry
                .map_err(|e| SpinError::TransientFetch(format!("list {}: {e}", dir.display())))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    fn claims(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PathBuf>>> {
        self.claims
            .lock()
            .map_err(|_| anyhow!("stream `{}` claim lock poisoned", self.name))
    }

    fn try_claim(&self) -> Result<Option<DataFileMessage>> {
        let now = now_ms();
        for queued in self.entries(QUEUE)? {
            if visible_at(&queued).is_some_and(|at| at > now) {
                // Entries are ordered by visibility time.
                break;
            }
            let Some(file_name) = queued.file_name() else {
                continue;
            };
            let claimed = self.root.join(CLAIMED).join(file_name);
            match fs::rename(&queued, &claimed) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SpinError::TransientFetch(format!(
                        "claim {}: {e}",
                        queued.display()
                    ))
                    .into());
                }
            }
            let body = read_all(&claimed)?;
            match DataFileMessage::parse(&String::from_utf8_lossy(&body)) {
                Ok(message) => {
                    self.claims()?.insert(message.file_url.clone(), claimed);
                    return Ok(Some(message));
                }
                Err(err) => {
                    tracing::warn!(stream = %self.name, file = %claimed.display(), error = %err, "dropping unreadable message");
                    remove_if_exists(&claimed)?;
                }
            }
        }
        Ok(None)
    }

    fn requeue(&self, claimed: &Path, visible_at: u64) -> Result<()> {
        let dest = self.root.join(QUEUE).join(entry_name(visible_at));
        fs::rename(claimed, &dest)
            .with_context(|| format!("requeue {} as {}", claimed.display(), dest.display()))
    }
}

impl Stream for SpoolStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Option<DataFileMessage>> {
        let started = Instant::now();
        loop {
            if let Some(message) = self.try_claim()? {
                return Ok(Some(message));
            }
            if !block {
                return Ok(None);
            }
            let wait = match timeout {
                Some(t) => match t.checked_sub(started.elapsed()) {
                    Some(left) if !left.is_zero() => left.min(self.poll_interval),
                    _ => return Ok(None),
                },
                None => self.poll_interval,
            };
            thread::sleep(wait);
        }
    }

    fn task_done(&self, message: &DataFileMessage) -> Result<()> {
        if let Some(claimed) = self.claims()?.remove(&message.file_url) {
            remove_if_exists(&claimed)?;
        }
        Ok(())
    }

    fn task_failed(&self, message: &DataFileMessage) -> Result<()> {
        let Some(claimed) = self.claims()?.remove(&message.file_url) else {
            return Ok(());
        };
        let retry_at = now_ms() + u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX / 2);
        self.requeue(&claimed, retry_at)?;
        tracing::info!(stream = %self.name, file = %message.file_url, delay_ms = self.retry_delay.as_millis() as u64, "message returned to queue");
        Ok(())
    }

    /// Stale claims left by a crashed consumer are deleted when already
    /// processed, kept for acknowledgement when being resumed, and returned
    /// to the queue otherwise.
    fn recover(&self, processed: &HashSet<String>, processing: &HashSet<String>) -> Result<()> {
        let mut requeued = 0usize;
        for claimed in self.entries(CLAIMED)? {
            let body = read_all(&claimed)?;
            let url = DataFileMessage::parse(&String::from_utf8_lossy(&body))
                .map(|m| m.file_url)
                .ok();
            match url {
                Some(url) if processed.contains(&url) => remove_if_exists(&claimed)?,
                Some(url) if processing.contains(&url) => {
                    self.claims()?.insert(url, claimed);
                }
                Some(_) => {
                    let at = visible_at(&claimed).unwrap_or(0);
                    self.requeue(&claimed, at)?;
                    requeued += 1;
                }
                None => remove_if_exists(&claimed)?,
            }
        }
        tracing::debug!(stream = %self.name, requeued, "recovered spool");
        Ok(())
    }

    fn send_to_stream(&self, path: &str, tags: &Tags, storage_type: StorageType) -> Result<()> {
        let url = match storage_type {
            StorageType::File if path.starts_with('/') => format!("file://{path}"),
            other => format!("{}://{}", other.scheme(), path),
        };
        self.publish(&DataFileMessage::new(url, tags.clone()))?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn entry_name(visible_at: u64) -> String {
    format!("{visible_at:020}-{}.json", uuid::Uuid::new_v4().simple())
}

fn visible_at(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .split('-')
        .next()?
        .parse()
        .ok()
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

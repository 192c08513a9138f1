//! Stream contract and built-in streams.
//!
//! A stream yields one [`DataFileMessage`] at a time and must be told how
//! each delivery ended ([`Stream::task_done`] / [`Stream::task_failed`]).
//! Messages are identified by their `file_url`, which is also the key the
//! checkpoint log records for processed source files.
//!
//! ## Built-in streams
//! - [`LocalStream`] - `local:///dir[?watch]`, scans a directory tree
//! - [`SpoolStream`] - `spool:///dir`, a directory-backed message queue
//!   shared between OS processes

pub mod local;
pub mod message;
pub mod spool;

pub use local::LocalStream;
pub use message::{DATA_FORMAT, DataFileMessage, FileLocation};
pub use spool::SpoolStream;

use crate::config::StreamConfig;
use crate::data_file::{DataFile, FileType, Tags};
use crate::error::SpinError;
use crate::registry::Registry;
use crate::storage::StorageType;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Queue-like source of pointer messages with acknowledgement.
pub trait Stream: Send + Sync {
    fn name(&self) -> &str;

    /// Next message, or `None` when nothing is available.
    ///
    /// With `block`, waits up to `timeout` (forever when `None`) for one.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::TransientFetch`] when the backing queue cannot be
    /// read; the caller retries on its next iteration.
    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Option<DataFileMessage>>;

    /// The message was fully processed and must not be delivered again.
    ///
    /// # Errors
    ///
    /// Returns an error if the acknowledgement cannot be recorded.
    fn task_done(&self, message: &DataFileMessage) -> Result<()>;

    /// Processing failed; the message stays recoverable.
    ///
    /// # Errors
    ///
    /// Returns an error if the failure cannot be recorded.
    fn task_failed(&self, message: &DataFileMessage) -> Result<()>;

    /// Seed delivery bookkeeping after a restart. `processed` URLs are never
    /// delivered again; `processing` URLs are being resumed by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream's state cannot be repaired.
    fn recover(&self, processed: &HashSet<String>, processing: &HashSet<String>) -> Result<()>;

    /// Publish a pointer to `path` for downstream consumers.
    ///
    /// # Errors
    ///
    /// Fails for streams that cannot carry messages, or if publishing fails.
    fn send_to_stream(&self, path: &str, tags: &Tags, storage_type: StorageType) -> Result<()>;
}

/// A fetched message with the data files it resolves to.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub message: DataFileMessage,
    pub files: Vec<DataFile>,
}

impl Delivery {
    /// Turn a pointer into a readable data file.
    ///
    /// Local URLs are read in place. Any other storage type is looked up in
    /// `registry` and attached as the file's provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed or no storage is
    /// registered for its type and bucket.
    pub fn resolve(message: DataFileMessage, registry: &dyn Registry) -> Result<Self> {
        let loc = message
            .location()
            .with_context(|| format!("resolve {}", message.file_url))?;
        let file = match loc.storage_type {
            StorageType::File => {
                DataFile::create(&loc.path, FileType::Table, None, message.tags.clone())
            }
            other => {
                let provider = registry
                    .lookup_storage_by_location(other, &loc.bucket)
                    .ok_or_else(|| SpinError::MissingStorage(format!("{other}://{}", loc.bucket)))?;
                let stored = format!("{}{}", loc.bucket, loc.path);
                DataFile::create(stored, FileType::Table, None, message.tags.clone())
                    .with_provider(provider)
            }
        };
        Ok(Self {
            message,
            files: vec![file],
        })
    }

    /// Timestamp used to age the dedup cache: the message's end time when
    /// it carries one, otherwise `fallback`.
    #[must_use]
    pub fn timestamp(&self, fallback: i64) -> i64 {
        self.message
            .datetime_end
            .map_or(fallback, |dt| dt.timestamp())
    }
}

/// `scheme`, path and query options of a stream URL such as `local:///in?watch`.
pub(crate) fn split_url(url: &str) -> Result<(String, String, Map<String, Value>)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| SpinError::Configuration(format!("stream url `{url}` has no scheme")))?;
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    let mut options = Map::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
        options.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok((scheme.to_ascii_lowercase(), path.to_string(), options))
}

pub(crate) fn flag(options: &Map<String, Value>, key: &str) -> bool {
    match options.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !matches!(s.as_str(), "false" | "0" | "no"),
        Some(Value::Number(n)) => n.as_u64() != Some(0),
        _ => false,
    }
}

pub(crate) fn millis(options: &Map<String, Value>, key: &str, default: u64) -> u64 {
    match options.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

/// Build a built-in stream from configuration.
///
/// `pull` marks entries from the `sources` list, which never watch.
///
/// # Errors
///
/// Returns [`SpinError::Configuration`] for unknown schemes.
pub fn stream_from_config(conf: &StreamConfig, pull: bool) -> Result<Arc<dyn Stream>> {
    let (scheme, path, mut options) = split_url(&conf.url)?;
    for (k, v) in &conf.args {
        options.insert(k.clone(), v.clone());
    }
    if pull {
        options.insert("watch".into(), Value::Bool(false));
    }
    let dir = PathBuf::from(path);
    match scheme.as_str() {
        "local" | "file" => Ok(Arc::new(LocalStream::new(&conf.name, dir, &options))),
        "spool" => Ok(Arc::new(SpoolStream::open(&conf.name, dir, &options)?)),
        other => Err(SpinError::Configuration(format!(
            "stream `{}` uses unsupported scheme `{other}://`",
            conf.name
        ))
        .into()),
    }
}

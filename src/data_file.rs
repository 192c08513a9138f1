//! The file artifact flowing between steps.
//!
//! A [`DataFile`] names one file: a fetched source, a step's intermediate
//! output, or an entry restored from checkpoint metadata. Its basename is
//! always `name + ext`, where a compression suffix stays part of `ext`
//! (`events.jsonl.gz` → `events` + `.jsonl.gz`), so derived names such as
//! `events-flatten.jsonl` stay stable.
//!
//! Files staged in remote storage carry a provider; reading them goes through
//! [`ObjectStorage::fetch_file`] first.

use crate::io::compression::{decompressing_reader, split_file_name};
use crate::io::jsonl::{RecordLines, open_lines};
use crate::storage::{ObjectStorage, StorageType};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// String-to-string annotations propagated through steps.
pub type Tags = BTreeMap<String, String>;

/// Whether a file holds data rows or primary-key index rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Table,
    Index,
}

/// The line-delimited record format every step understands.
pub const JSONL: &str = "jsonl";

/// Identifies the storage a remote file lives in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    pub storage_type: StorageType,
    pub location: String,
}

/// Serializable description of a data file, as stored in checkpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMeta {
    pub name: String,
    pub ext: String,
    pub file_path: PathBuf,
    pub file_type: FileType,
    pub file_format: String,
    pub generation_time: i64,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageRef>,
}

/// One file artifact.
#[derive(Clone)]
pub struct DataFile {
    name: String,
    ext: String,
    path: PathBuf,
    file_type: FileType,
    file_format: String,
    generation_time: i64,
    tags: Tags,
    provider: Option<Arc<dyn ObjectStorage>>,
}

impl DataFile {
    /// Describe the file at `path`.
    ///
    /// When `format` is `None` it is derived from the extension, defaulting
    /// to `jsonl`.
    pub fn create(
        path: impl Into<PathBuf>,
        file_type: FileType,
        format: Option<&str>,
        tags: Tags,
    ) -> Self {
        let path = path.into();
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (name, ext) = split_file_name(&base);
        let file_format = format.map_or_else(|| format_from_ext(&ext), str::to_string);
        Self {
            name,
            ext,
            path,
            file_type,
            file_format,
            generation_time: chrono::Utc::now().timestamp(),
            tags,
            provider: None,
        }
    }

    /// A local table file with no tags.
    pub fn table(path: impl Into<PathBuf>) -> Self {
        Self::create(path, FileType::Table, None, Tags::new())
    }

    /// Attach the storage this file must be fetched through.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ObjectStorage>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_generation_time(mut self, ts: i64) -> Self {
        self.generation_time = ts;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ext(&self) -> &str {
        &self.ext
    }

    #[must_use]
    pub fn basename(&self) -> String {
        format!("{}{}", self.name, self.ext)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    #[must_use]
    pub fn is_index(&self) -> bool {
        self.file_type == FileType::Index
    }

    #[must_use]
    pub fn file_format(&self) -> &str {
        &self.file_format
    }

    #[must_use]
    pub fn generation_time(&self) -> i64 {
        self.generation_time
    }

    #[must_use]
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut Tags {
        &mut self.tags
    }

    #[must_use]
    pub fn provider(&self) -> Option<&Arc<dyn ObjectStorage>> {
        self.provider.as_ref()
    }

    /// Lazily read `(record, raw_line)` pairs.
    ///
    /// Local files are read in place; files with a provider are fetched
    /// through it first. Gzip/zstd extensions decompress transparently.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::NotFound`](crate::error::SpinError::NotFound) if
    /// the backing file does not exist. Per-line parse failures surface as
    /// items of the returned iterator.
    pub fn readlines(&self) -> Result<RecordLines> {
        let origin = self.path.to_string_lossy().into_owned();
        let reader = match &self.provider {
            None => open_lines(&self.path)?,
            Some(provider) => {
                let raw = provider
                    .fetch_file(&origin)
                    .with_context(|| format!("fetch {origin} from {}", provider.location()))?;
                decompressing_reader(raw, self.basename())?
            }
        };
        Ok(RecordLines::new(reader, origin))
    }

    /// Capture this file's description, hashing local content so a later
    /// [`DataFile::from_meta`] can detect modification.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing local file cannot be hashed.
    pub fn to_meta(&self) -> Result<DataFileMeta> {
        let content_hash = match &self.provider {
            None if self.path.is_file() => Some(file_sha256(&self.path)?),
            _ => None,
        };
        Ok(DataFileMeta {
            name: self.name.clone(),
            ext: self.ext.clone(),
            file_path: self.path.clone(),
            file_type: self.file_type,
            file_format: self.file_format.clone(),
            generation_time: self.generation_time,
            tags: self.tags.clone(),
            content_hash,
            storage: self.provider.as_ref().map(|p| StorageRef {
                storage_type: p.storage_type(),
                location: p.location().to_string(),
            }),
        })
    }

    /// Restore a file from checkpoint metadata.
    ///
    /// With `verify`, a local file whose stored hash disagrees with its
    /// current content (or which has disappeared) yields `Ok(None)`. Remote
    /// files are not verified; the caller re-attaches their provider.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing local file cannot be hashed.
    pub fn from_meta(meta: &DataFileMeta, verify: bool) -> Result<Option<Self>> {
        if verify
            && meta.storage.is_none()
            && let Some(expected) = &meta.content_hash
        {
            if !meta.file_path.is_file() {
                tracing::debug!(file = %meta.file_path.display(), "checkpointed file is gone");
                return Ok(None);
            }
            let actual = file_sha256(&meta.file_path)?;
            if &actual != expected {
                tracing::warn!(file = %meta.file_path.display(), "checkpointed file changed since it was recorded");
                return Ok(None);
            }
        }
        Ok(Some(Self {
            name: meta.name.clone(),
            ext: meta.ext.clone(),
            path: meta.file_path.clone(),
            file_type: meta.file_type,
            file_format: meta.file_format.clone(),
            generation_time: meta.generation_time,
            tags: meta.tags.clone(),
            provider: None,
        }))
    }
}

impl fmt::Debug for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFile")
            .field("path", &self.path)
            .field("file_type", &self.file_type)
            .field("file_format", &self.file_format)
            .field("tags", &self.tags)
            .field("provider", &self.provider.as_ref().map(|p| p.url_for(p.location())))
            .finish_non_exhaustive()
    }
}

/// Equality ignores the attached provider and generation time.
impl PartialEq for DataFile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ext == other.ext
            && self.path == other.path
            && self.file_type == other.file_type
            && self.file_format == other.file_format
            && self.tags == other.tags
    }
}

fn format_from_ext(ext: &str) -> String {
    match ext.trim_start_matches('.').split('.').next().unwrap_or_default() {
        "" | "json" | "jsonl" | "ndjson" => JSONL.to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Hex SHA-256 of a file's bytes.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut f, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

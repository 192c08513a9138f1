//! Pointer messages exchanged through queue-backed streams.
//!
//! A pointer message names a data file instead of carrying it:
//!
//! ```json
//! {"data_format": "filespin", "file_url": "s3://bucket/2024/03/01/a.jsonl",
//!  "tags": {"app": "web"}, "datetime_end": "2024-03-01T10:00:00Z"}
//! ```
//!
//! The URL scheme encodes the storage type. Bodies without the
//! `data_format` discriminator are rejected unless they are raw object-store
//! notifications (`Records[0].s3...`), which are translated.

use crate::data_file::Tags;
use crate::storage::StorageType;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of the `data_format` discriminator.
pub const DATA_FORMAT: &str = "filespin";

/// A pointer to one data file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMessage {
    pub data_format: String,
    pub file_url: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime_end: Option<DateTime<Utc>>,
}

/// Where a pointer's file lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLocation {
    pub storage_type: StorageType,
    /// Empty for `file://` URLs.
    pub bucket: String,
    pub path: String,
}

impl DataFileMessage {
    pub fn new(file_url: impl Into<String>, tags: Tags) -> Self {
        Self {
            data_format: DATA_FORMAT.to_string(),
            file_url: file_url.into(),
            tags,
            datetime_start: None,
            datetime_end: None,
        }
    }

    /// Pointer to a local file.
    pub fn for_local_path(path: &str) -> Self {
        Self::new(format!("file://{path}"), Tags::new())
    }

    #[must_use]
    pub fn with_window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.datetime_start = start;
        self.datetime_end = end;
        self
    }

    /// Parse a message body.
    ///
    /// # Errors
    ///
    /// Fails if the body is not JSON, lacks the `data_format`
    /// discriminator (and is not an object-store notification), or names a
    /// different format.
    pub fn parse(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body).context("message body is not JSON")?;
        match value.get("data_format").and_then(Value::as_str) {
            Some(DATA_FORMAT) => serde_json::from_value(value).context("invalid pointer message"),
            Some(other) => bail!("unsupported data_format `{other}`"),
            None if value.get("Records").is_some() => Self::from_notification(&value),
            None => bail!("message has no data_format discriminator"),
        }
    }

    /// Translate an object-store event notification into a pointer.
    fn from_notification(body: &Value) -> Result<Self> {
        let s3 = body
            .pointer("/Records/0/s3")
            .ok_or_else(|| anyhow!("notification carries no s3 record"))?;
        let bucket = s3
            .pointer("/bucket/name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("notification has no bucket name"))?;
        let key = s3
            .pointer("/object/key")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("notification has no object key"))?;
        Ok(Self::new(
            format!("s3://{bucket}/{}", key.trim_start_matches('/')),
            Tags::new(),
        ))
    }

    /// Serialize to a single JSON line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize pointer message")
    }

    /// Split the URL into storage type, bucket and path.
    ///
    /// # Errors
    ///
    /// Fails if the URL has no scheme or the scheme is not a storage type.
    pub fn location(&self) -> Result<FileLocation> {
        let (scheme, rest) = self
            .file_url
            .split_once("://")
            .ok_or_else(|| anyhow!("file url `{}` has no scheme", self.file_url))?;
        let storage_type = StorageType::from_scheme(scheme)
            .ok_or_else(|| anyhow!("file url `{}` has an unknown scheme", self.file_url))?;
        if storage_type == StorageType::File {
            return Ok(FileLocation {
                storage_type,
                bucket: String::new(),
                path: rest.to_string(),
            });
        }
        let (bucket, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        Ok(FileLocation {
            storage_type,
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }
}

//! Object storage contract and built-in backends.
//!
//! Steps and the dedup cache talk to storage only through [`ObjectStorage`],
//! so remote providers (S3, COS, ...) plug in by implementing the trait and
//! registering the instance with the [`Registry`](crate::registry::Registry).
//!
//! ## Stored paths
//!
//! `save` returns a *stored path* in the backend's own addressing scheme
//! (`/abs/path` for local files, `bucket/key` for bucket stores). The same
//! string is accepted by `fetch_file` and is what `list` yields, and
//! [`ObjectStorage::url_for`] turns it into the URL carried by pointer
//! messages.
//!
//! ## Built-in backends
//! - [`LocalStorage`] - `file:///base/dir`
//! - [`MemoryStorage`] - `mem://bucket`, process-local, shared by bucket name

pub mod local;
pub mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use crate::error::SpinError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Kind of storage, encoded as the URL scheme of pointer messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[serde(alias = "local")]
    File,
    S3,
    Cos,
    Mem,
}

impl StorageType {
    #[must_use]
    pub fn scheme(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::S3 => "s3",
            Self::Cos => "cos",
            Self::Mem => "mem",
        }
    }

    /// Map a URL scheme to a storage type; `local` is accepted for `file`.
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "file" | "local" => Some(Self::File),
            "s3" => Some(Self::S3),
            "cos" => Some(Self::Cos),
            "mem" => Some(Self::Mem),
            _ => None,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Storage operations used by the pipeline core.
pub trait ObjectStorage: Send + Sync {
    fn storage_type(&self) -> StorageType;

    /// Bucket name, or the base directory for local storage.
    fn location(&self) -> &str;

    /// Upload a local file under `key`, returning the stored path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the upload fails.
    fn save(&self, key: &str, local_path: &Path) -> Result<String>;

    /// Store lines (newline-joined) under `key`, returning the stored path.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_data(&self, key: &str, lines: &[String]) -> Result<String>;

    /// Open a stored object for reading.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::NotFound`] if the object does not exist.
    fn fetch_file(&self, stored_path: &str) -> Result<Box<dyn Read + Send>>;

    /// Stored paths of every object whose key starts with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// URL form of a stored path.
    fn url_for(&self, stored_path: &str) -> String {
        format!("{}://{}", self.storage_type().scheme(), stored_path)
    }
}

/// Build a built-in storage from its configured URL.
///
/// # Errors
///
/// Returns [`SpinError::Configuration`] for schemes without a built-in
/// backend; those need an adapter registered programmatically.
pub fn storage_from_url(url: &str) -> Result<Arc<dyn ObjectStorage>> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        SpinError::Configuration(format!("storage url `{url}` has no scheme"))
    })?;
    let rest = rest.split_once('?').map_or(rest, |(path, _)| path);
    match StorageType::from_scheme(scheme) {
        Some(StorageType::File) => Ok(Arc::new(LocalStorage::new(rest)?)),
        Some(StorageType::Mem) => Ok(Arc::new(MemoryStorage::named(rest))),
        _ => Err(SpinError::Configuration(format!(
            "no built-in storage backend for `{scheme}://`"
        ))
        .into()),
    }
}

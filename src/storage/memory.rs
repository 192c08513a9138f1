use super::{ObjectStorage, StorageType};
use crate::error::SpinError;
use anyhow::{Result, anyhow};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

type Bucket = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Process-wide named buckets so that two registries naming the same
/// `mem://bucket` see the same objects.
static BUCKETS: LazyLock<Mutex<HashMap<String, Bucket>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// In-memory bucket store.
///
/// Stands in for a remote provider: data files whose pointer URL is
/// `mem://bucket/key` must be fetched through it before they can be read.
#[derive(Clone)]
pub struct MemoryStorage {
    bucket: String,
    objects: Bucket,
}

impl MemoryStorage {
    /// Attach to the process-wide bucket called `bucket`, creating it if needed.
    #[must_use]
    pub fn named(bucket: &str) -> Self {
        let bucket = bucket.trim_matches('/').to_string();
        let mut all = BUCKETS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let objects = Arc::clone(all.entry(bucket.clone()).or_default());
        Self { bucket, objects }
    }

    /// Put raw bytes under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket lock is poisoned.
    pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) -> Result<String> {
        let key = key.trim_start_matches('/').to_string();
        self.objects
            .lock()
            .map_err(|_| anyhow!("bucket `{}` lock poisoned", self.bucket))?
            .insert(key.clone(), data.into());
        Ok(format!("{}/{key}", self.bucket))
    }

    /// Bytes stored under a stored path or key.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::NotFound`] if nothing is stored there.
    pub fn get(&self, stored_path: &str) -> Result<Vec<u8>> {
        let key = self.key_of(stored_path);
        self.objects
            .lock()
            .map_err(|_| anyhow!("bucket `{}` lock poisoned", self.bucket))?
            .get(key)
            .cloned()
            .ok_or_else(|| SpinError::NotFound(PathBuf::from(stored_path)).into())
    }

    fn key_of<'a>(&self, stored_path: &'a str) -> &'a str {
        let trimmed = stored_path.trim_start_matches('/');
        trimmed
            .strip_prefix(self.bucket.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(trimmed)
    }
}

impl ObjectStorage for MemoryStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Mem
    }

    fn location(&self) -> &str {
        &self.bucket
    }

    fn save(&self, key: &str, local_path: &Path) -> Result<String> {
        let bytes = fs::read(local_path)
            .map_err(|e| anyhow!("read {}: {e}", local_path.display()))?;
        self.put(key, bytes)
    }

    fn save_data(&self, key: &str, lines: &[String]) -> Result<String> {
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        self.put(key, body)
    }

    fn fetch_file(&self, stored_path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.get(stored_path)?)))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("bucket `{}` lock poisoned", self.bucket))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(|k| format!("{}/{k}", self.bucket))
            .collect())
    }
}

use super::{ObjectStorage, StorageType};
use crate::error::SpinError;
use crate::io::jsonl::{AtomicLineWriter, atomic_copy};
use anyhow::{Context, Result, bail};
use glob::{Pattern, glob};
use std::fs::{File, create_dir_all};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Object storage rooted at a local directory.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    base: PathBuf,
    location: String,
}

impl LocalStorage {
    /// # Errors
    ///
    /// Returns an error if the base directory cannot be created.
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        create_dir_all(&base).with_context(|| format!("mkdir -p {}", base.display()))?;
        Ok(Self {
            location: base.to_string_lossy().into_owned(),
            base,
        })
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("storage key `{key}` escapes {}", self.base.display());
        }
        Ok(self.base.join(rel))
    }
}

impl ObjectStorage for LocalStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn save(&self, key: &str, local_path: &Path) -> Result<String> {
        let dest = self.resolve(key)?;
        atomic_copy(local_path, &dest)?;
        Ok(dest.to_string_lossy().into_owned())
    }

    fn save_data(&self, key: &str, lines: &[String]) -> Result<String> {
        let dest = self.resolve(key)?;
        let mut w = AtomicLineWriter::create(&dest)?;
        for line in lines {
            w.write_line(line)?;
        }
        Ok(w.commit()?.to_string_lossy().into_owned())
    }

    fn fetch_file(&self, stored_path: &str) -> Result<Box<dyn Read + Send>> {
        let path = Path::new(stored_path);
        if !path.exists() {
            return Err(SpinError::NotFound(path.to_path_buf()).into());
        }
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        Ok(Box::new(f))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        // Walk only below the deepest directory named by the prefix.
        let dir_part = prefix.rfind('/').map_or("", |i| &prefix[..i]);
        let dir = self.resolve(dir_part)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = format!("{}/**/*", Pattern::escape(&dir.to_string_lossy()));
        let mut out = Vec::new();
        for entry in glob(&pattern).with_context(|| format!("invalid glob pattern: {pattern}"))? {
            let path = entry.with_context(|| format!("walk {}", dir.display()))?;
            if !path.is_file() {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.base) else {
                continue;
            };
            if rel.to_string_lossy().replace('\\', "/").starts_with(prefix) {
                out.push(path.to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    fn url_for(&self, stored_path: &str) -> String {
        if stored_path.starts_with('/') {
            format!("file://{stored_path}")
        } else {
            format!("file:///{stored_path}")
        }
    }
}

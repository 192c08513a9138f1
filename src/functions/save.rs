use crate::context::TaskContext;
use crate::data_file::DataFile;
use crate::error::SpinError;
use crate::registry::Registry;
use crate::template::render_tags;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Upload each file to a named storage and optionally announce it.
///
/// The destination key is `path_suffix/basename`, where `path_suffix` is
/// rendered from the file's tags (`events/{app_id}/`). With `trigger` set, a
/// pointer to the stored object is published on that stream.
#[derive(Clone, Debug, Deserialize)]
pub struct Save {
    location: String,
    #[serde(default)]
    path_suffix: Option<String>,
    #[serde(default)]
    trigger: Option<String>,
}

impl Save {
    pub(crate) fn check(&self, registry: &dyn Registry) -> Result<()> {
        if registry.lookup_storage(&self.location).is_none() {
            return Err(SpinError::MissingStorage(self.location.clone()).into());
        }
        if let Some(trigger) = &self.trigger
            && registry.lookup_stream(trigger).is_none()
        {
            return Err(SpinError::MissingStream(trigger.clone()).into());
        }
        Ok(())
    }

    fn key_for(&self, file: &DataFile) -> Result<String> {
        let Some(template) = &self.path_suffix else {
            return Ok(file.basename());
        };
        let mut suffix = render_tags(template, file.tags())
            .with_context(|| format!("render path_suffix for {}", file.basename()))?;
        if !suffix.is_empty() && !suffix.ends_with('/') {
            suffix.push('/');
        }
        Ok(format!("{suffix}{}", file.basename()))
    }

    /// Local copy of a file that lives behind a provider.
    fn stage(file: &DataFile, ctx: &TaskContext<'_>) -> Result<PathBuf> {
        let Some(provider) = file.provider() else {
            return Ok(file.path().to_path_buf());
        };
        let dest = ctx.temp_path(&file.basename());
        let stored = file.path().to_string_lossy();
        let mut reader = provider.fetch_file(&stored)?;
        let mut tmp = NamedTempFile::new_in(ctx.temp_dir())
            .with_context(|| format!("create temporary file in {}", ctx.temp_dir().display()))?;
        io::copy(&mut reader, &mut tmp).with_context(|| format!("stage {stored}"))?;
        tmp.persist(&dest)
            .with_context(|| format!("rename into {}", dest.display()))?;
        Ok(dest)
    }

    pub(crate) fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        let storage = ctx.get_storage(&self.location)?;
        let key = self.key_for(file)?;
        let local = Self::stage(file, ctx)?;
        let stored = storage
            .save(&key, &local)
            .map_err(|e| SpinError::TransientFetch(format!("save {key} to {}: {e:#}", self.location)))?;
        tracing::info!(storage = %self.location, key = %key, stored = %stored, "file saved");
        if let Some(trigger) = &self.trigger {
            let stream = ctx.get_stream(trigger)?;
            stream.send_to_stream(&stored, file.tags(), storage.storage_type())?;
            tracing::debug!(stream = %trigger, stored = %stored, "pointer published");
        }
        Ok(vec![file.clone()])
    }
}

use super::FieldSelector;
use crate::config::parse_window;
use crate::context::TaskContext;
use crate::data_file::{DataFile, FileType, JSONL};
use crate::error::SpinError;
use crate::io::jsonl::AtomicLineWriter;
use crate::record::PkTuple;
use crate::registry::Registry;
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;

/// Drop records whose primary key was seen recently.
///
/// `cache` names a configured pk cache, which is also refreshed from the
/// index files it points at. Without it the step keeps a private cache
/// aged by `window`. Index files pass through untouched. A record missing
/// a key field fails the step.
#[derive(Clone, Debug, Deserialize)]
pub struct Deduplicate {
    #[serde(alias = "keys")]
    key: FieldSelector,
    #[serde(default)]
    cache: Option<String>,
    #[serde(default)]
    window: Option<String>,
}

impl Deduplicate {
    pub(crate) fn check(&self, registry: &dyn Registry) -> Result<()> {
        if let Some(name) = &self.cache
            && registry.lookup_pk_cache(name).is_none()
        {
            return Err(SpinError::Configuration(format!("no pk cache named `{name}` is configured")).into());
        }
        if let Some(window) = &self.window {
            parse_window(window)?;
        }
        Ok(())
    }

    pub(crate) fn process(&self, step_name: &str, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        if file.is_index() {
            return Ok(vec![file.clone()]);
        }
        if file.file_format() != JSONL {
            return Err(SpinError::UnsupportedFormat {
                format: file.file_format().to_string(),
                path: file.path().display().to_string(),
            }
            .into());
        }
        let keys = self.key.clone().into_vec();
        let window = self.window.as_deref().map(parse_window).transpose()?;
        let cache_name = self.cache.as_deref().unwrap_or(step_name);
        let now = ctx.event_time();
        let dest = ctx.temp_path(&format!("{}-deduplicate.jsonl", file.name()));
        let tags = file.tags().clone();

        let mut writer = AtomicLineWriter::create(&dest)?;
        let mut seen: HashSet<PkTuple> = HashSet::new();
        let mut fresh: Vec<PkTuple> = Vec::new();
        let mut dropped = 0usize;
        {
            let entry = ctx.update_pk_cache(self.cache.as_deref(), step_name, &keys, window, &tags)?;
            let cache = entry.cache_mut();
            let mut lines = file.readlines()?;
            while let Some(item) = lines.next() {
                let (record, line) = item?;
                let Some(key) = cache.key_of(&record) else {
                    return Err(SpinError::MalformedRecord {
                        path: lines.origin().to_string(),
                        line: lines.line_no(),
                        reason: format!("missing primary key field of {keys:?}"),
                    }
                    .into());
                };
                if seen.contains(&key) || cache.is_duplicate(&key, now) {
                    dropped += 1;
                    continue;
                }
                writer.write_line(&line)?;
                seen.insert(key.clone());
                fresh.push(key);
            }
        }
        let path = writer.commit()?;
        let emitted = fresh.len();
        let cached = ctx.register_pk_keys(cache_name, fresh, now);
        tracing::info!(file = %file.path().display(), emitted, dropped, cached, "deduplicated");
        Ok(vec![ctx.create_data_file(path, FileType::Table, tags)])
    }
}

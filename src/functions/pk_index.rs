use super::FieldSelector;
use crate::context::TaskContext;
use crate::data_file::{DataFile, FileType};
use crate::io::jsonl::AtomicLineWriter;
use crate::record::{Record, field};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

/// Write the distinct primary keys of a file as an index sidecar.
///
/// Each index line is an object holding just the key fields; records
/// missing one are left out. The step returns the input followed by the
/// index file.
#[derive(Clone, Debug, Deserialize)]
pub struct PkIndex {
    #[serde(alias = "keys")]
    key: FieldSelector,
}

impl PkIndex {
    pub(crate) fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        let keys = self.key.clone().into_vec();
        let dest = ctx.temp_path(&format!("{}-pk-index.jsonl", file.name()));
        let mut writer = AtomicLineWriter::create(&dest)?;
        let mut seen = HashSet::new();
        let mut skipped = 0usize;
        for (record, _) in file.readlines()?.skip_malformed() {
            let Some(index) = keys
                .iter()
                .map(|k| field(&record, k).map(|v| (k.clone(), v.clone())))
                .collect::<Option<Record>>()
            else {
                skipped += 1;
                continue;
            };
            let line = serde_json::to_string(&index).context("serialize index line")?;
            if seen.insert(line.clone()) {
                writer.write_line(&line)?;
            }
        }
        let path = writer.commit()?;
        if skipped > 0 {
            tracing::warn!(file = %file.path().display(), skipped, "records without key fields left out of the index");
        }
        tracing::debug!(file = %file.path().display(), keys = seen.len(), "pk index written");
        let index = ctx.create_data_file(path, FileType::Index, file.tags().clone());
        Ok(vec![file.clone(), index])
    }
}

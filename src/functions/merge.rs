use super::file_safe;
use crate::context::TaskContext;
use crate::data_file::{DataFile, FileType, Tags};
use crate::io::jsonl::AtomicLineWriter;
use anyhow::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

const DEFAULT_GROUP: &str = "default";

fn default_output_lines() -> usize {
    100_000
}

/// Concatenate files into fewer, larger ones.
///
/// Files are grouped by the values of the `tags` names (all together when
/// unset) and each group is written in chunks of at most
/// `output_file_lines` lines. Outputs carry the group's tag values. Index
/// files pass through.
#[derive(Clone, Debug, Deserialize)]
pub struct Merge {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_output_lines")]
    output_file_lines: usize,
}

impl Merge {
    pub(crate) fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        self.process_multi(std::slice::from_ref(file), ctx)
    }

    pub(crate) fn process_multi(&self, files: &[DataFile], ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        let mut out = Vec::new();
        let mut groups: BTreeMap<String, (Tags, Vec<&DataFile>)> = BTreeMap::new();
        for file in files {
            if file.is_index() {
                out.push(file.clone());
                continue;
            }
            let tags: Tags = self
                .tags
                .iter()
                .filter_map(|t| file.tags().get(t).map(|v| (t.clone(), v.clone())))
                .collect();
            let name = if tags.is_empty() {
                DEFAULT_GROUP.to_string()
            } else {
                self.tags
                    .iter()
                    .filter_map(|t| tags.get(t).cloned())
                    .collect::<Vec<_>>()
                    .join("_")
            };
            groups.entry(name).or_insert_with(|| (tags, Vec::new())).1.push(file);
        }
        let mut used = HashSet::new();
        for (name, (tags, members)) in groups {
            let mut label = file_safe(&name);
            let mut n = 1;
            while !used.insert(label.clone()) {
                label = format!("{}-{n}", file_safe(&name));
                n += 1;
            }
            out.extend(self.merge_group(&label, &tags, &members, ctx)?);
        }
        Ok(out)
    }

    fn merge_group(
        &self,
        group: &str,
        tags: &Tags,
        members: &[&DataFile],
        ctx: &TaskContext<'_>,
    ) -> Result<Vec<DataFile>> {
        let limit = self.output_file_lines.max(1);
        let chunk_path = |n: usize| ctx.temp_path(&format!("{}-merge-{group}_{n}.jsonl", ctx.source_name()));
        let mut done = Vec::new();
        let mut writer = AtomicLineWriter::create(chunk_path(0))?;
        for file in members {
            for (_, line) in file.readlines()?.skip_malformed() {
                if writer.lines() >= limit {
                    let full = std::mem::replace(&mut writer, AtomicLineWriter::create(chunk_path(done.len() + 1))?);
                    done.push(full.commit()?);
                }
                writer.write_line(&line)?;
            }
        }
        done.push(writer.commit()?);
        tracing::debug!(group, inputs = members.len(), outputs = done.len(), "merged");
        Ok(done
            .into_iter()
            .map(|path| ctx.create_data_file(path, FileType::Table, tags.clone()))
            .collect())
    }
}

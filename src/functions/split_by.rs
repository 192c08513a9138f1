use super::{FieldSelector, file_safe};
use crate::context::TaskContext;
use crate::data_file::{DataFile, FileType, Tags};
use crate::io::jsonl::AtomicLineWriter;
use crate::record::{KeyTuple, Record, field, is_blank_key, key_tuple};
use crate::template::{render, value_text};
use anyhow::Result;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Partition a file by the values of key fields.
///
/// Raw lines are copied unchanged into one file per distinct key tuple.
/// `tags` values are templates such as `{data.app_id}`, rendered against the
/// first record of each group.
#[derive(Clone, Debug, Deserialize)]
pub struct SplitBy {
    key: FieldSelector,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    static_tags: Tags,
}

struct Group {
    writer: AtomicLineWriter,
    tags: Tags,
}

impl SplitBy {
    fn group_tags(&self, base: &Tags, record: &Record) -> Result<Tags> {
        let mut tags = base.clone();
        tags.extend(self.static_tags.clone());
        for (name, template) in &self.tags {
            let value = render(template, |placeholder| {
                let path = placeholder.strip_prefix("data.").unwrap_or(placeholder);
                Some(field(record, path).map(value_text).unwrap_or_default())
            })?;
            tags.insert(name.clone(), value);
        }
        Ok(tags)
    }

    pub(crate) fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        let keys = self.key.clone().into_vec();
        let mut groups: HashMap<KeyTuple, Group> = HashMap::new();
        let mut order: Vec<KeyTuple> = Vec::new();
        let mut used_names = HashSet::new();
        let mut skipped = 0usize;

        for (record, line) in file.readlines()?.skip_malformed() {
            let key = key_tuple(&record, &keys);
            if is_blank_key(&key) {
                skipped += 1;
                tracing::warn!(file = %file.path().display(), ?keys, "record has no group key, skipped");
                continue;
            }
            if !groups.contains_key(&key) {
                let mut stem = format!("{}-group-{}", file.name(), file_safe(&key.join("-")));
                let mut n = 1;
                while !used_names.insert(stem.clone()) {
                    stem = format!("{}-group-{}-{n}", file.name(), file_safe(&key.join("-")));
                    n += 1;
                }
                let writer = AtomicLineWriter::create(ctx.temp_path(&format!("{stem}.jsonl")))?;
                let tags = self.group_tags(file.tags(), &record)?;
                groups.insert(key.clone(), Group { writer, tags });
                order.push(key.clone());
            }
            if let Some(group) = groups.get_mut(&key) {
                group.writer.write_line(&line)?;
            }
        }

        let mut out = Vec::with_capacity(order.len());
        for key in order {
            if let Some(group) = groups.remove(&key) {
                let lines = group.writer.lines();
                let path = group.writer.commit()?;
                tracing::debug!(group = ?key, lines, file = %path.display(), "group written");
                out.push(ctx.create_data_file(path, FileType::Table, group.tags));
            }
        }
        if skipped > 0 {
            tracing::info!(file = %file.path().display(), skipped, "records without a group key");
        }
        Ok(out)
    }
}

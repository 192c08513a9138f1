use crate::context::TaskContext;
use crate::data_file::{DataFile, FileType};
use crate::error::SpinError;
use crate::io::jsonl::AtomicLineWriter;
use crate::registry::Registry;
use anyhow::Result;
use serde::Deserialize;

/// Coerce declared fields to the types of a data view.
///
/// A record with a field that cannot be coerced is dropped and logged.
#[derive(Clone, Debug, Deserialize)]
pub struct Format {
    table_name: String,
}

impl Format {
    pub(crate) fn check(&self, registry: &dyn Registry) -> Result<()> {
        match registry.lookup_schema(&self.table_name) {
            Some(_) => Ok(()),
            None => Err(SpinError::MissingSchema(self.table_name.clone()).into()),
        }
    }

    pub(crate) fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        if file.is_index() {
            return Ok(vec![file.clone()]);
        }
        let view = ctx.get_data_view(&self.table_name)?;
        let mut writer = AtomicLineWriter::create(ctx.temp_path(&format!("{}-format.jsonl", file.name())))?;
        let mut dropped = 0usize;
        for (mut record, _) in file.readlines()?.skip_malformed() {
            match view.apply(&mut record) {
                Ok(()) => writer.write_record(&record)?,
                Err(field) => {
                    dropped += 1;
                    tracing::warn!(
                        file = %file.path().display(),
                        view = %view.name,
                        field = %field,
                        value = %record.get(&field).map(ToString::to_string).unwrap_or_default(),
                        "value does not fit the declared type, record dropped"
                    );
                }
            }
        }
        let written = writer.lines();
        let path = writer.commit()?;
        tracing::debug!(file = %path.display(), written, dropped, "formatted");
        Ok(vec![ctx.create_data_file(path, FileType::Table, file.tags().clone())])
    }
}

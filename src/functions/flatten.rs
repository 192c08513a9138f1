use crate::context::TaskContext;
use crate::data_file::{DataFile, FileType, JSONL};
use crate::error::SpinError;
use crate::io::jsonl::AtomicLineWriter;
use crate::record::flatten;
use anyhow::Result;

/// Flatten nested objects into dot-delimited keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flatten;

impl Flatten {
    pub(crate) fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        if file.file_format() != JSONL {
            return Err(SpinError::UnsupportedFormat {
                format: file.file_format().to_string(),
                path: file.path().display().to_string(),
            }
            .into());
        }
        if file.is_index() {
            return Ok(vec![file.clone()]);
        }
        let mut writer = AtomicLineWriter::create(ctx.temp_path(&format!("{}-flatten.jsonl", file.name())))?;
        for item in file.readlines()? {
            let (record, _) = item?;
            writer.write_record(&flatten(&record))?;
        }
        let path = writer.commit()?;
        Ok(vec![ctx.create_data_file(path, FileType::Table, file.tags().clone())])
    }
}

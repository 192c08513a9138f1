//! Line-delimited JSON reading and atomic writing.
//!
//! - [`RecordLines`] lazily yields `(record, raw_line)` pairs; a malformed
//!   line is a per-line [`SpinError::MalformedRecord`] so each step decides
//!   whether to skip or abort.
//! - [`AtomicLineWriter`] writes into a temporary file next to the
//!   destination and renames it into place on [`commit`](AtomicLineWriter::commit),
//!   so a crash never leaves a half-written file under the final name.

use crate::error::SpinError;
use crate::io::compression::{CompressedWriter, decompressing_reader};
use crate::record::Record;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{self, File, create_dir_all};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Open a local file for line reading, decompressing transparently.
///
/// # Errors
///
/// Returns [`SpinError::NotFound`] if the path does not exist, or an I/O
/// error if it cannot be opened.
pub fn open_lines(path: impl AsRef<Path>) -> Result<Box<dyn BufRead + Send>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SpinError::NotFound(path.to_path_buf()).into());
    }
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    decompressing_reader(f, path)
        .with_context(|| format!("setup decompression for {}", path.display()))
}

/// Iterator over the records of a line-delimited file.
///
/// Blank lines are skipped. The raw line is returned without its trailing
/// newline so it can be re-emitted byte-for-byte.
pub struct RecordLines {
    reader: Box<dyn BufRead + Send>,
    origin: String,
    line_no: usize,
    buf: String,
}

impl RecordLines {
    pub fn new(reader: Box<dyn BufRead + Send>, origin: impl Into<String>) -> Self {
        Self {
            reader,
            origin: origin.into(),
            line_no: 0,
            buf: String::new(),
        }
    }

    /// Line number of the record yielded last, counting from 1.
    #[must_use]
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Drop malformed lines, logging each one.
    pub fn skip_malformed(self) -> impl Iterator<Item = (Record, String)> {
        self.filter_map(|item| match item {
            Ok(pair) => Some(pair),
            Err(err) => {
                tracing::warn!(error = %err, "skipping record");
                None
            }
        })
    }
}

impl Iterator for RecordLines {
    type Item = Result<(Record, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            self.line_no += 1;
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(e).with_context(|| {
                        format!("read line {} in {}", self.line_no, self.origin)
                    }));
                }
            }
            let raw = self.buf.trim_end_matches(['\n', '\r']);
            if raw.trim().is_empty() {
                continue;
            }
            let malformed = |reason: String| SpinError::MalformedRecord {
                path: self.origin.clone(),
                line: self.line_no,
                reason,
            };
            return Some(match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(record)) => Ok((record, raw.to_string())),
                Ok(other) => Err(malformed(format!("expected a JSON object, got {other}")).into()),
                Err(e) => Err(malformed(e.to_string()).into()),
            });
        }
    }
}

/// Writes lines to a temporary sibling of `dest` and renames on commit.
///
/// Compression follows `dest`'s extension. Dropping the writer without
/// committing removes the temporary file.
pub struct AtomicLineWriter {
    dest: PathBuf,
    inner: CompressedWriter<NamedTempFile>,
    lines: usize,
}

impl AtomicLineWriter {
    /// Start a new file at `dest`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or temporary file cannot be created.
    pub fn create(dest: impl AsRef<Path>) -> Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        create_dir_all(&parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        let tmp = NamedTempFile::new_in(&parent)
            .with_context(|| format!("create temporary file in {}", parent.display()))?;
        let inner = CompressedWriter::new(tmp, &dest)
            .with_context(|| format!("setup compression for {}", dest.display()))?;
        Ok(Self {
            dest,
            inner,
            lines: 0,
        })
    }

    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Number of lines written so far.
    #[must_use]
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Append one line; a newline is added.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner
            .write_all(line.as_bytes())
            .and_then(|()| self.inner.write_all(b"\n"))
            .with_context(|| format!("write line to {}", self.dest.display()))?;
        self.lines += 1;
        Ok(())
    }

    /// Serialize and append one record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        let line = serde_json::to_string(record)
            .with_context(|| format!("serialize record for {}", self.dest.display()))?;
        self.write_line(&line)
    }

    /// Finish compression, fsync and rename into place.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing, syncing or the rename fails.
    pub fn commit(self) -> Result<PathBuf> {
        let tmp = self
            .inner
            .finish()
            .with_context(|| format!("flush {}", self.dest.display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("sync {}", self.dest.display()))?;
        tmp.persist(&self.dest)
            .with_context(|| format!("rename into {}", self.dest.display()))?;
        Ok(self.dest)
    }
}

/// Copy `src` to `dest` through a temporary sibling and an atomic rename.
///
/// # Errors
///
/// Returns an error if `src` cannot be read or `dest` cannot be written.
pub fn atomic_copy(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<u64> {
    let (src, dest) = (src.as_ref(), dest.as_ref());
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temporary file in {}", parent.display()))?;
    let mut from = File::open(src).with_context(|| format!("open {}", src.display()))?;
    let n = std::io::copy(&mut from, &mut tmp)
        .with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest)
        .with_context(|| format!("rename into {}", dest.display()))?;
    Ok(n)
}

/// Write bytes to `dest` through a temporary sibling and an atomic rename.
///
/// # Errors
///
/// Returns an error if `dest` cannot be written.
pub fn atomic_write(dest: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let dest = dest.as_ref();
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temporary file in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("write {}", dest.display()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest)
        .with_context(|| format!("rename into {}", dest.display()))?;
    Ok(())
}

/// Read a whole local file; used for content hashing and small metadata files.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

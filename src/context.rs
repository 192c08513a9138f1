//! Per-source-file run state threaded through the step chain.

use crate::checkpoint::{RunCheckpoint, StepRecord, current_timestamp_ms};
use crate::data_file::{DataFile, DataFileMeta, FileType, Tags};
use crate::error::SpinError;
use crate::pkindex::{PkCacheDef, PkCacheEntry, PkCacheRegistry};
use crate::record::PkTuple;
use crate::registry::Registry;
use crate::schema::DataView;
use crate::storage::ObjectStorage;
use crate::stream::{DataFileMessage, Stream};
use anyhow::{Context, Result};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// New run id: `RN` followed by a UUID v4.
#[must_use]
pub fn new_run_id() -> String {
    format!("RN{}", uuid::Uuid::new_v4().simple())
}

/// State of one run of one source file.
///
/// `current_files` always holds the output of the last completed step, or
/// the fetched source files before any step ran. Collaborators are borrowed:
/// the registry for name lookups and the process-wide dedup caches.
pub struct TaskContext<'a> {
    pipeline: String,
    run_id: String,
    temp_dir: PathBuf,
    source: DataFileMessage,
    initial_files: Vec<DataFile>,
    current_files: Vec<DataFile>,
    step_history: Vec<StepRecord>,
    start_time: u64,
    event_time: i64,
    end_flag: bool,
    registry: &'a dyn Registry,
    pk_caches: &'a mut PkCacheRegistry,
}

impl<'a> TaskContext<'a> {
    /// Start a run for freshly fetched files, creating `tmp_root/<run_id>`.
    ///
    /// `event_time` is the data timestamp (seconds) used to age dedup caches.
    ///
    /// # Errors
    ///
    /// Returns an error if the scratch directory cannot be created.
    pub fn new(
        pipeline: &str,
        tmp_root: &Path,
        source: DataFileMessage,
        files: Vec<DataFile>,
        event_time: i64,
        registry: &'a dyn Registry,
        pk_caches: &'a mut PkCacheRegistry,
    ) -> Result<Self> {
        let run_id = new_run_id();
        let temp_dir = tmp_root.join(&run_id);
        create_dir_all(&temp_dir).with_context(|| format!("mkdir -p {}", temp_dir.display()))?;
        Ok(Self {
            pipeline: pipeline.to_string(),
            run_id,
            temp_dir,
            source,
            initial_files: files.clone(),
            current_files: files,
            step_history: Vec::new(),
            start_time: current_timestamp_ms(),
            event_time,
            end_flag: false,
            registry,
            pk_caches,
        })
    }

    /// Rebuild an interrupted run from its checkpoint.
    ///
    /// Returns the context and the index of the next step to run, or `None`
    /// when a file the resume point needs is gone or changed on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if a recorded file cannot be hashed or a remote
    /// file's storage is no longer registered.
    pub fn restore(
        checkpoint: RunCheckpoint,
        registry: &'a dyn Registry,
        pk_caches: &'a mut PkCacheRegistry,
    ) -> Result<Option<(Self, usize)>> {
        let (next_step, resume_files) = checkpoint.resume_point();
        let Some(current_files) = restore_files(resume_files, registry)? else {
            return Ok(None);
        };
        let Some(initial_files) = restore_files(&checkpoint.source_files, registry)? else {
            return Ok(None);
        };
        create_dir_all(&checkpoint.temp_dir)
            .with_context(|| format!("mkdir -p {}", checkpoint.temp_dir.display()))?;
        let step_history = checkpoint
            .steps
            .into_iter()
            .filter(|s| s.success && s.order_index < next_step)
            .collect();
        let ctx = Self {
            pipeline: checkpoint.pipeline,
            run_id: checkpoint.run_id,
            temp_dir: checkpoint.temp_dir,
            source: checkpoint.source,
            initial_files,
            current_files,
            step_history,
            start_time: checkpoint.start_time,
            event_time: checkpoint.event_time,
            end_flag: false,
            registry,
            pk_caches,
        };
        Ok(Some((ctx, next_step)))
    }

    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Path for a step output inside this run's scratch directory.
    #[must_use]
    pub fn temp_path(&self, file_name: &str) -> PathBuf {
        self.temp_dir.join(file_name)
    }

    #[must_use]
    pub fn source(&self) -> &DataFileMessage {
        &self.source
    }

    #[must_use]
    pub fn initial_files(&self) -> &[DataFile] {
        &self.initial_files
    }

    #[must_use]
    pub fn current_files(&self) -> &[DataFile] {
        &self.current_files
    }

    #[must_use]
    pub fn step_history(&self) -> &[StepRecord] {
        &self.step_history
    }

    #[must_use]
    pub fn event_time(&self) -> i64 {
        self.event_time
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.end_flag
    }

    /// Logical name of the run's first source file, used to name outputs
    /// that combine several inputs.
    #[must_use]
    pub fn source_name(&self) -> &str {
        self.initial_files.first().map_or("data", DataFile::name)
    }

    /// Describe a new local file written by a step.
    #[must_use]
    pub fn create_data_file(&self, path: impl Into<PathBuf>, file_type: FileType, tags: Tags) -> DataFile {
        DataFile::create(path, file_type, None, tags)
    }

    /// # Errors
    ///
    /// Returns [`SpinError::MissingStorage`] for unknown names.
    pub fn get_storage(&self, name: &str) -> Result<Arc<dyn ObjectStorage>> {
        self.registry
            .lookup_storage(name)
            .ok_or_else(|| SpinError::MissingStorage(name.to_string()).into())
    }

    /// # Errors
    ///
    /// Returns [`SpinError::MissingStream`] for unknown names.
    pub fn get_stream(&self, name: &str) -> Result<Arc<dyn Stream>> {
        self.registry
            .lookup_stream(name)
            .ok_or_else(|| SpinError::MissingStream(name.to_string()).into())
    }

    /// # Errors
    ///
    /// Returns [`SpinError::MissingSchema`] for unknown names.
    pub fn get_data_view(&self, name: &str) -> Result<Arc<DataView>> {
        self.registry
            .lookup_schema(name)
            .ok_or_else(|| SpinError::MissingSchema(name.to_string()).into())
    }

    /// The dedup cache a Deduplicate step uses, refreshed with index files
    /// published since its last search.
    ///
    /// `cache_name` selects a configured cache; without one the cache is
    /// private to the step (`fallback_name`) and never searches storage.
    ///
    /// # Errors
    ///
    /// Fails if the named cache or its storage is not configured, or the
    /// index search fails.
    pub fn update_pk_cache(
        &mut self,
        cache_name: Option<&str>,
        fallback_name: &str,
        keys: &[String],
        window: Option<u64>,
        tags: &Tags,
    ) -> Result<&mut PkCacheEntry> {
        let def = match cache_name {
            Some(name) => self.registry.lookup_pk_cache(name).ok_or_else(|| {
                SpinError::Configuration(format!("no pk cache named `{name}` is configured"))
            })?,
            None => PkCacheDef::local(fallback_name, window),
        };
        let storage = def
            .storage
            .as_deref()
            .map(|name| self.get_storage(name))
            .transpose()?;
        let now = self.event_time;
        let entry = self.pk_caches.entry(&def, keys, now)?;
        let added = entry.refresh(storage.as_deref(), tags, now)?;
        if added > 0 {
            tracing::debug!(cache = %def.name, added, "pk cache refreshed from index files");
        }
        Ok(entry)
    }

    /// Register keys a Deduplicate step emitted, after its output is on
    /// disk. They are attributed to this run until it commits. Returns the
    /// cache size, or 0 when the cache was never created.
    pub fn register_pk_keys(&mut self, cache_name: &str, keys: Vec<PkTuple>, now: i64) -> usize {
        match self.pk_caches.get_mut(cache_name) {
            Some(entry) => {
                entry.register(&self.run_id, keys, now);
                entry.cache().len()
            }
            None => 0,
        }
    }

    /// The run committed; keep its dedup keys unconditionally.
    pub fn settle_pk_keys(&mut self) {
        self.pk_caches.settle(&self.run_id);
    }

    /// Record a completed step and make its outputs current.
    ///
    /// # Errors
    ///
    /// Returns an error if an output file cannot be described.
    pub fn advance(
        &mut self,
        step_name: &str,
        function: &str,
        order_index: usize,
        start_time: u64,
        outputs: Vec<DataFile>,
    ) -> Result<()> {
        let record = StepRecord {
            step_name: step_name.to_string(),
            function: function.to_string(),
            start_time,
            end_time: current_timestamp_ms(),
            success: true,
            input_files: metas(&self.current_files)?,
            output_files: metas(&outputs)?,
            order_index,
        };
        self.step_history.push(record);
        self.current_files = outputs;
        Ok(())
    }

    /// Record a failed step. `current_files` is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if an input file cannot be described.
    pub fn record_failure(&mut self, step_name: &str, function: &str, order_index: usize, start_time: u64) -> Result<()> {
        self.step_history.push(StepRecord {
            step_name: step_name.to_string(),
            function: function.to_string(),
            start_time,
            end_time: current_timestamp_ms(),
            success: false,
            input_files: metas(&self.current_files)?,
            output_files: Vec::new(),
            order_index,
        });
        Ok(())
    }

    pub fn finish(&mut self) {
        self.end_flag = true;
    }

    /// Serializable state for the checkpoint store.
    ///
    /// # Errors
    ///
    /// Returns an error if a source file cannot be described.
    pub fn snapshot(&self) -> Result<RunCheckpoint> {
        Ok(RunCheckpoint {
            pipeline: self.pipeline.clone(),
            run_id: self.run_id.clone(),
            temp_dir: self.temp_dir.clone(),
            source: self.source.clone(),
            source_files: metas(&self.initial_files)?,
            steps: self.step_history.clone(),
            start_time: self.start_time,
            end_time: self.end_flag.then(current_timestamp_ms),
            success: self.end_flag,
            event_time: self.event_time,
            checksum: String::new(),
        })
    }
}

fn metas(files: &[DataFile]) -> Result<Vec<DataFileMeta>> {
    files.iter().map(DataFile::to_meta).collect()
}

/// Restore files from metadata, re-attaching remote providers. `None` when
/// any local file fails verification.
fn restore_files(metas: &[DataFileMeta], registry: &dyn Registry) -> Result<Option<Vec<DataFile>>> {
    let mut files = Vec::with_capacity(metas.len());
    for meta in metas {
        let Some(file) = DataFile::from_meta(meta, true)? else {
            return Ok(None);
        };
        let file = match &meta.storage {
            None => file,
            Some(sref) => {
                let provider = registry
                    .lookup_storage_by_location(sref.storage_type, &sref.location)
                    .ok_or_else(|| SpinError::MissingStorage(format!("{}://{}", sref.storage_type, sref.location)))?;
                file.with_provider(provider)
            }
        };
        files.push(file);
    }
    Ok(Some(files))
}

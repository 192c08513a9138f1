//! # filespin
//!
//! A **resumable, file-oriented ETL pipeline runner**. Streams deliver
//! pointers to data files; each file is threaded through an ordered chain of
//! steps (split, deduplicate, index, flatten, format, filter, merge, save),
//! and every step's outputs are checkpointed so a crashed run resumes where
//! it stopped instead of starting over.
//!
//! ## Key Features
//!
//! - **Resumable runs** - an in-flight checkpoint is rewritten after every step
//!   and committed to an append-only run log when the chain finishes
//! - **Time-windowed deduplication** - a two-generation primary-key cache,
//!   seeded from index files published by earlier runs
//! - **Closed step set** - configuration selects from eight step kinds, each
//!   dispatched by pattern match
//! - **Pluggable collaborators** - object storages and streams are traits;
//!   local directory, spool queue, local and in-memory storage ship built in
//! - **Scheduling** - `every day at 8h30m` style schedules and a bounded
//!   launcher that runs one OS process per pipeline
//! - **Compressed inputs** - gzip and zstd (optional via feature flags)
//!
//! ## Quick Start
//!
//! ```no_run
//! use filespin::config::ProjectConfig;
//! use filespin::process::DataProcess;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let project = ProjectConfig::load("project.json")?;
//! let mut process = DataProcess::from_project(&project, "events")?;
//!
//! // Finish whatever a previous crash left behind, then drain the source.
//! process.recover()?;
//! for outcome in process.run()? {
//!     println!("{} -> {:?}", outcome.source_url, outcome.status);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### DataFile
//!
//! A [`DataFile`] describes one artifact: its path, logical name, format,
//! whether it is a table or a key index, and its tags. Files held by remote
//! storage carry a provider and are fetched when read.
//!
//! ### Steps
//!
//! A [`FunctionStep`] is one named transform. The driver hands it the
//! current file when there is exactly one and the whole set otherwise; see
//! [`functions`] for the table of kinds.
//!
//! ### Runs and checkpoints
//!
//! A [`TaskContext`] holds one run's state. After each step the driver
//! saves a [`RunCheckpoint`](checkpoint::RunCheckpoint); at startup
//! [`DataProcess::recover`] reads the run log and the leftover checkpoints and
//! resumes interrupted runs after their last successful step.
//!
//! ### Deduplication
//!
//! [`PkIndexCache`] remembers primary keys for one window, rolling over by
//! the data's own timestamps. [`IndexSearcher`](pkindex::IndexSearcher)
//! finds the index files of recent runs so a fresh process starts warm.
//!
//! ## Feature Flags
//!
//! - `compression-gzip` - `.gz` inputs and outputs
//! - `compression-zstd` - `.zst` / `.zstd` inputs and outputs

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data_file;
pub mod error;
pub mod functions;
pub mod io;
pub mod launcher;
pub mod pkindex;
pub mod process;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod stream;
pub mod template;

pub use context::TaskContext;
pub use data_file::{DataFile, FileType, Tags};
pub use error::SpinError;
pub use functions::{FunctionStep, StepKind};
pub use pkindex::PkIndexCache;
pub use process::{DataProcess, RunOutcome, RunStatus};
pub use registry::{Engine, Registry};

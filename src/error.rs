//! Error taxonomy for pipeline runs.
//!
//! Plumbing code returns [`anyhow::Result`] and attaches context at every I/O
//! boundary. Failures that callers need to *react to* are raised as a
//! [`SpinError`] inside the `anyhow::Error`, so the pipeline driver and tests
//! can classify them with `err.downcast_ref::<SpinError>()`.

use std::path::PathBuf;

/// Domain errors raised by the pipeline core.
#[derive(Debug, thiserror::Error)]
pub enum SpinError {
    /// An unresolvable name or invalid setting in the project configuration.
    /// Fatal for the affected pipeline at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Stream or storage I/O failure during `get`/`save`/`fetch_file`.
    /// Retried by the outer scheduling loop on its next iteration.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    /// A line that could not be parsed into a record.
    #[error("malformed record at {path}:{line}: {reason}")]
    MalformedRecord {
        path: String,
        line: usize,
        reason: String,
    },

    /// The backing file of a data file does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// The step cannot handle the data file's format.
    #[error("unsupported format `{format}` for {path}")]
    UnsupportedFormat { format: String, path: String },

    /// A Save step names a storage that is not configured.
    #[error("no storage named `{0}` is configured")]
    MissingStorage(String),

    /// A trigger or source names a stream that is not configured.
    #[error("no stream named `{0}` is configured")]
    MissingStream(String),

    /// A Format step names a data view that is not configured.
    #[error("no data view named `{0}` is configured")]
    MissingSchema(String),

    /// A step failed; the run is marked failed and its checkpoint kept.
    #[error("step `{step}` failed: {reason}")]
    StepExecution { step: String, reason: String },
}

impl SpinError {
    /// Whether the outer loop should simply try again later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch(_))
    }

    /// Whether the error should abort the pipeline at startup.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::MissingStorage(_)
                | Self::MissingStream(_)
                | Self::MissingSchema(_)
        )
    }
}

/// Look through an `anyhow` chain for a [`SpinError`].
#[must_use]
pub fn spin_error(err: &anyhow::Error) -> Option<&SpinError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SpinError>())
}

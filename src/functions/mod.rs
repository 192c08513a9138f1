//! The closed set of step kinds a data process chains together.
//!
//! Every step consumes data files and returns the files the next step
//! receives. The driver calls [`FunctionStep::process`] when the current file
//! set has exactly one member and [`FunctionStep::process_multi`] otherwise;
//! for most kinds `process_multi` maps `process` over the files, while
//! Merge treats the whole set as one unit.
//!
//! | function      | outputs |
//! |---------------|---------|
//! | `splitby`     | one file per distinct key tuple |
//! | `save`        | the input, after uploading it |
//! | `pk_index`    | the input plus a key index file |
//! | `deduplicate` | records whose key was not seen recently |
//! | `flatten`     | records with nested objects flattened |
//! | `format`      | records coerced to a data view |
//! | `filter`      | one file per rule |
//! | `merge`       | inputs concatenated, grouped by tags |

mod deduplicate;
mod filter;
mod flatten;
mod format;
mod merge;
mod pk_index;
mod save;
mod split_by;

pub mod expr;

pub use deduplicate::Deduplicate;
pub use filter::{Clause, Filter, FilterRule, RuleKind};
pub use flatten::Flatten;
pub use format::Format;
pub use merge::Merge;
pub use pk_index::PkIndex;
pub use save::Save;
pub use split_by::SplitBy;

use crate::config::ProcessFunctionConfig;
use crate::context::TaskContext;
use crate::data_file::DataFile;
use crate::error::SpinError;
use crate::registry::Registry;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// One field name or a list of them.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    One(String),
    Many(Vec<String>),
}

impl FieldSelector {
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(f) => vec![f],
            Self::Many(fs) => fs,
        }
    }
}

/// A step kind with its parsed arguments.
#[derive(Clone, Debug)]
pub enum StepKind {
    SplitBy(SplitBy),
    Save(Save),
    PkIndex(PkIndex),
    Deduplicate(Deduplicate),
    Flatten(Flatten),
    Format(Format),
    Filter(Filter),
    Merge(Merge),
}

/// A named, configured step.
#[derive(Clone, Debug)]
pub struct FunctionStep {
    name: String,
    kind: StepKind,
}

/// Make a record- or tag-derived label safe to embed in a file name: path
/// separators and other unusual characters become `_`.
pub(crate) fn file_safe(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

fn parse_args<T: DeserializeOwned>(conf: &ProcessFunctionConfig) -> Result<T> {
    serde_json::from_value(Value::Object(conf.args.clone())).map_err(|e| {
        SpinError::Configuration(format!("invalid args for step `{}`: {e}", conf.name)).into()
    })
}

impl FunctionStep {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Build a step from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] for unknown functions or
    /// arguments that do not fit the function.
    pub fn from_config(conf: &ProcessFunctionConfig) -> Result<Self> {
        let kind = match conf.function.as_str() {
            "splitby" => StepKind::SplitBy(parse_args(conf)?),
            "save" => StepKind::Save(parse_args(conf)?),
            "pk_index" => StepKind::PkIndex(parse_args(conf)?),
            "deduplicate" => StepKind::Deduplicate(parse_args(conf)?),
            "flatten" => StepKind::Flatten(Flatten),
            "format" => StepKind::Format(parse_args(conf)?),
            "filter" => StepKind::Filter(Filter::from_args(&conf.args).with_context(|| format!("step `{}`", conf.name))?),
            "merge" => StepKind::Merge(parse_args(conf)?),
            other => {
                return Err(SpinError::Configuration(format!(
                    "step `{}` uses unknown function `{other}`",
                    conf.name
                ))
                .into());
            }
        };
        Ok(Self::new(&conf.name, kind))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    /// Function identifier as written in configuration.
    #[must_use]
    pub fn function(&self) -> &'static str {
        match self.kind {
            StepKind::SplitBy(_) => "splitby",
            StepKind::Save(_) => "save",
            StepKind::PkIndex(_) => "pk_index",
            StepKind::Deduplicate(_) => "deduplicate",
            StepKind::Flatten(_) => "flatten",
            StepKind::Format(_) => "format",
            StepKind::Filter(_) => "filter",
            StepKind::Merge(_) => "merge",
        }
    }

    /// Whether the kind handles a multi-file set as one unit.
    #[must_use]
    pub fn supports_batch(&self) -> bool {
        matches!(self.kind, StepKind::Merge(_))
    }

    /// Resolve every name the step refers to.
    ///
    /// # Errors
    ///
    /// Returns the missing-name error for the first unresolved reference.
    pub fn check(&self, registry: &dyn Registry) -> Result<()> {
        let res: Result<()> = match &self.kind {
            StepKind::Save(save) => save.check(registry),
            StepKind::Format(format) => format.check(registry),
            StepKind::Deduplicate(dedup) => dedup.check(registry),
            _ => Ok(()),
        };
        res.with_context(|| format!("step `{}`", self.name))
    }

    /// Run the step on a single file.
    ///
    /// # Errors
    ///
    /// Returns the step's failure with the step name attached.
    pub fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        let out = match &self.kind {
            StepKind::SplitBy(s) => s.process(file, ctx),
            StepKind::Save(s) => s.process(file, ctx),
            StepKind::PkIndex(s) => s.process(file, ctx),
            StepKind::Deduplicate(s) => s.process(&self.name, file, ctx),
            StepKind::Flatten(s) => s.process(file, ctx),
            StepKind::Format(s) => s.process(file, ctx),
            StepKind::Filter(s) => s.process(file, ctx),
            StepKind::Merge(s) => s.process(file, ctx),
        };
        out.with_context(|| format!("step `{}` ({}) on {}", self.name, self.function(), file.path().display()))
    }

    /// Run the step on several files.
    ///
    /// # Errors
    ///
    /// Returns the first failure with the step name attached.
    pub fn process_multi(&self, files: &[DataFile], ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        if let StepKind::Merge(m) = &self.kind {
            return m
                .process_multi(files, ctx)
                .with_context(|| format!("step `{}` (merge) on {} files", self.name, files.len()));
        }
        let mut out = Vec::new();
        for file in files {
            out.extend(self.process(file, ctx)?);
        }
        Ok(out)
    }
}

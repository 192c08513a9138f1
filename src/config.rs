//! Project configuration.
//!
//! A project is a single JSON document naming the streams, storages, data
//! views, dedup caches and data processes of one deployment:
//!
//! ```json
//! {
//!   "filespin": { "working_dir": "/var/lib/filespin" },
//!   "streams":  [{ "name": "incoming", "url": "local:///data/in?watch" }],
//!   "storages": [{ "name": "archive", "url": "file:///data/archive" }],
//!   "data_processes": [{
//!     "name": "events",
//!     "source": "incoming",
//!     "processes": [
//!       { "name": "flat", "function": "flatten" },
//!       { "name": "out",  "function": "save", "args": { "location": "archive" } }
//!     ]
//!   }]
//! }
//! ```

use crate::error::SpinError;
use crate::scheduler::Schedule;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Global runner settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinSettings {
    /// Root for checkpoints and per-run scratch directories.
    pub working_dir: PathBuf,
    /// Keep `tmp/<run_id>` after a run commits.
    pub keep_temp: bool,
}

impl Default for SpinSettings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("./.filespin"),
            keep_temp: false,
        }
    }
}

/// A named stream or pull-based source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(alias = "source_url")]
    pub url: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// A named object storage location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// One declared field of a data view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

/// A named schema used by the Format step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataViewConfig {
    pub name: String,
    #[serde(default = "default_table_format")]
    pub table_format: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

fn default_table_format() -> String {
    "jsonl".to_string()
}

/// A named primary-key dedup cache definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PkCacheConfig {
    pub name: String,
    /// Storage holding historical index files.
    #[serde(default)]
    pub storage: Option<String>,
    /// Path template for index prefixes, e.g. `idx/{app_id}/{year}/{month}/{day}/{hour}/`.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Window string such as `10m`; absent means keys never expire.
    #[serde(default, alias = "timeout")]
    pub window: Option<String>,
    /// `minute`, `hour` or `day`.
    #[serde(default)]
    pub granularity: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// One configured step of a data process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessFunctionConfig {
    pub name: String,
    pub function: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// A named pipeline: one source and an ordered step chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataProcessConfig {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_args: Map<String, Value>,
    #[serde(default)]
    pub schedules: Vec<String>,
    #[serde(default)]
    pub processes: Vec<ProcessFunctionConfig>,
}

/// The whole project document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    #[serde(alias = "dataspin")]
    pub filespin: SpinSettings,
    pub sources: Vec<StreamConfig>,
    pub streams: Vec<StreamConfig>,
    pub storages: Vec<StorageConfig>,
    pub data_views: Vec<DataViewConfig>,
    pub pk_caches: Vec<PkCacheConfig>,
    pub data_processes: Vec<DataProcessConfig>,
}

impl ProjectConfig {
    /// Load and validate a project file.
    ///
    /// A relative `working_dir` is resolved against the project file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON for the
    /// project schema, or fails [`ProjectConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).with_context(|| format!("read project {}", path.display()))?;
        let mut conf: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("parse project {}", path.display()))?;
        if conf.filespin.working_dir.is_relative()
            && let Some(parent) = path.parent()
        {
            conf.filespin.working_dir = parent.join(&conf.filespin.working_dir);
        }
        conf.validate()?;
        tracing::debug!(project = %path.display(), processes = conf.data_processes.len(), "loaded project");
        Ok(conf)
    }

    /// Check that every name referenced by a data process resolves.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] (or a more specific missing-name
    /// variant) for the first problem found.
    pub fn validate(&self) -> Result<()> {
        let streams: HashSet<&str> = self
            .streams
            .iter()
            .chain(&self.sources)
            .map(|s| s.name.as_str())
            .collect();
        let storages: HashSet<&str> = self.storages.iter().map(|s| s.name.as_str()).collect();
        let views: HashSet<&str> = self.data_views.iter().map(|v| v.name.as_str()).collect();
        let caches: HashSet<&str> = self.pk_caches.iter().map(|c| c.name.as_str()).collect();

        for cache in &self.pk_caches {
            if let Some(window) = &cache.window {
                parse_window(window)?;
            }
        }

        let mut names = HashSet::new();
        for dp in &self.data_processes {
            if !names.insert(dp.name.as_str()) {
                return Err(SpinError::Configuration(format!(
                    "duplicate data process `{}`",
                    dp.name
                ))
                .into());
            }
            for schedule in &dp.schedules {
                Schedule::parse(schedule).with_context(|| format!("data process `{}`", dp.name))?;
            }
            if !streams.contains(dp.source.as_str()) {
                return Err(SpinError::MissingStream(dp.source.clone()))
                    .with_context(|| format!("source of data process `{}`", dp.name));
            }
            for step in &dp.processes {
                let arg = |key: &str| step.args.get(key).and_then(Value::as_str);
                match step.function.as_str() {
                    "save" => {
                        let location = arg("location").ok_or_else(|| {
                            SpinError::Configuration(format!(
                                "save step `{}` needs a `location`",
                                step.name
                            ))
                        })?;
                        if !storages.contains(location) {
                            return Err(SpinError::MissingStorage(location.to_string()))
                                .with_context(|| format!("step `{}`", step.name));
                        }
                        if let Some(trigger) = arg("trigger")
                            && !streams.contains(trigger)
                        {
                            return Err(SpinError::MissingStream(trigger.to_string()))
                                .with_context(|| format!("step `{}`", step.name));
                        }
                    }
                    "format" => {
                        if let Some(view) = arg("table_name")
                            && !views.contains(view)
                        {
                            return Err(SpinError::MissingSchema(view.to_string()))
                                .with_context(|| format!("step `{}`", step.name));
                        }
                    }
                    "deduplicate" => {
                        if let Some(cache) = arg("cache")
                            && !caches.contains(cache)
                        {
                            return Err(SpinError::Configuration(format!(
                                "step `{}` references unknown pk cache `{cache}`",
                                step.name
                            ))
                            .into());
                        }
                    }
                    "splitby" | "pk_index" | "flatten" | "filter" | "merge" => {}
                    other => {
                        return Err(SpinError::Configuration(format!(
                            "step `{}` uses unknown function `{other}`",
                            step.name
                        ))
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Find a data process by name.
    #[must_use]
    pub fn data_process(&self, name: &str) -> Option<&DataProcessConfig> {
        self.data_processes.iter().find(|dp| dp.name == name)
    }
}

/// Parse a window string such as `30s`, `10m`, `2h` or `1d` into seconds.
///
/// # Errors
///
/// Returns [`SpinError::Configuration`] if the unit is unknown or the count is
/// not a non-negative integer.
pub fn parse_window(window: &str) -> Result<u64> {
    let window = window.trim();
    let bad = || SpinError::Configuration(format!("invalid time window `{window}`"));
    let unit = window.chars().last().ok_or_else(bad)?;
    let factor = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => return Err(bad().into()),
    };
    let count: u64 = window[..window.len() - 1].trim().parse().map_err(|_| bad())?;
    Ok(count * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_units() {
        assert_eq!(parse_window("45s").unwrap(), 45);
        assert_eq!(parse_window("10m").unwrap(), 600);
        assert_eq!(parse_window("2h").unwrap(), 7200);
        assert_eq!(parse_window("1d").unwrap(), 86_400);
        assert!(parse_window("10w").is_err());
        assert!(parse_window("m").is_err());
        assert!(parse_window("").is_err());
    }
}

//! Primary-key dedup cache and index-file search.
//!
//! [`PkIndexCache`] answers "was this key seen recently" with two
//! generations of key sets. Rollover is driven by the timestamps callers
//! pass in, never by the wall clock, and the baseline advances in whole
//! windows:
//!
//! - one window elapsed: `cache := precache`, `precache := {}`
//! - two or more elapsed: both generations are cleared
//!
//! A key registered at `s` is therefore present at every `t <= s + W` and
//! absent at every `t >= s + 2W`; in between it may be either.
//!
//! [`IndexSearcher`] finds the historical index files for a time range by
//! rendering a path pattern for every minute, hour or day in it and listing
//! storage under each prefix.

use crate::config::{PkCacheConfig, parse_window};
use crate::data_file::Tags;
use crate::error::SpinError;
use crate::io::compression::decompressing_reader;
use crate::io::jsonl::RecordLines;
use crate::record::{PkTuple, Record, pk_tuple};
use crate::storage::ObjectStorage;
use crate::template::render;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike};
use std::collections::{HashMap, HashSet};

/// Two-generation set of primary-key tuples.
#[derive(Clone, Debug)]
pub struct PkIndexCache {
    keys: Vec<String>,
    window: Option<u64>,
    baseline: i64,
    cache: HashSet<PkTuple>,
    precache: HashSet<PkTuple>,
}

impl PkIndexCache {
    /// `window` of `None` means keys never expire.
    #[must_use]
    pub fn new(keys: Vec<String>, window: Option<u64>, baseline: i64) -> Self {
        Self {
            keys,
            window,
            baseline,
            cache: HashSet::new(),
            precache: HashSet::new(),
        }
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn baseline(&self) -> i64 {
        self.baseline
    }

    #[must_use]
    pub fn window(&self) -> Option<u64> {
        self.window
    }

    /// The tuple both lookups and registration use, or `None` when the
    /// record lacks a key field.
    #[must_use]
    pub fn key_of(&self, record: &Record) -> Option<PkTuple> {
        pk_tuple(record, &self.keys)
    }

    /// Roll generations forward to `now`.
    pub fn advance(&mut self, now: i64) {
        let Some(window) = self.window.filter(|w| *w > 0) else {
            return;
        };
        let window = i64::try_from(window).unwrap_or(i64::MAX);
        let elapsed = now - self.baseline;
        if elapsed < window {
            return;
        }
        let steps = elapsed / window;
        if steps == 1 {
            self.cache = std::mem::take(&mut self.precache);
        } else {
            self.cache.clear();
            self.precache.clear();
        }
        self.baseline += steps * window;
        tracing::trace!(baseline = self.baseline, steps, kept = self.cache.len(), "pk cache rolled over");
    }

    /// Record a key as seen at `now`.
    pub fn insert(&mut self, key: PkTuple, now: i64) {
        self.advance(now);
        self.precache.insert(key.clone());
        self.cache.insert(key);
    }

    /// Forget a key in both generations.
    pub fn remove(&mut self, key: &PkTuple) -> bool {
        let in_precache = self.precache.remove(key);
        self.cache.remove(key) || in_precache
    }

    /// Membership in the current generation only.
    #[must_use]
    pub fn contains(&self, key: &PkTuple) -> bool {
        self.cache.contains(key)
    }

    pub fn is_duplicate(&mut self, key: &PkTuple, now: i64) -> bool {
        self.advance(now);
        self.contains(key)
    }

    /// Register every record of an index stream, skipping unreadable lines
    /// and lines without the key fields.
    pub fn ingest(&mut self, lines: RecordLines, now: i64) -> usize {
        self.advance(now);
        let mut added = 0;
        for (record, _) in lines.skip_malformed() {
            let Some(key) = self.key_of(&record) else {
                tracing::warn!(keys = ?self.keys, "index line without key fields skipped");
                continue;
            };
            self.precache.insert(key.clone());
            if self.cache.insert(key) {
                added += 1;
            }
        }
        added
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Time unit one index prefix covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    #[default]
    Hour,
    Day,
}

impl Granularity {
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] for anything but minute, hour or day.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "minutes" | "m" => Ok(Self::Minute),
            "hour" | "hours" | "h" => Ok(Self::Hour),
            "day" | "days" | "d" => Ok(Self::Day),
            other => Err(SpinError::Configuration(format!("unknown granularity `{other}`")).into()),
        }
    }

    #[must_use]
    pub fn seconds(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86_400,
        }
    }

    #[must_use]
    pub fn floor(self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.seconds())
    }
}

/// Locates index files for a time range.
#[derive(Clone, Debug)]
pub struct IndexSearcher {
    pattern: String,
    granularity: Granularity,
}

impl IndexSearcher {
    /// `pattern` may use `{year}`, `{month}`, `{day}`, `{hour}`, `{minute}`
    /// and any tag name, e.g. `idx/{app_id}/{year}/{month}/{day}/{hour}/`.
    pub fn new(pattern: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            pattern: pattern.into(),
            granularity,
        }
    }

    /// Whether a storage key names an index artifact.
    #[must_use]
    pub fn is_index_key(key: &str) -> bool {
        let base = key.rsplit('/').next().unwrap_or(key);
        base.ends_with(".index") || base.contains("-pk-index.")
    }

    /// Rendered prefixes, oldest first, one per time unit in `[start, end]`.
    ///
    /// # Errors
    ///
    /// Fails if the pattern references a tag that `tags` does not carry.
    pub fn prefixes(&self, tags: &Tags, start: i64, end: i64) -> Result<Vec<String>> {
        let step = self.granularity.seconds();
        let mut out: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut ts = self.granularity.floor(start);
        while ts <= end {
            let Some(at) = DateTime::from_timestamp(ts, 0) else {
                break;
            };
            let prefix = render(&self.pattern, |name| match name {
                "year" => Some(format!("{:04}", at.year())),
                "month" => Some(format!("{:02}", at.month())),
                "day" => Some(format!("{:02}", at.day())),
                "hour" => Some(format!("{:02}", at.hour())),
                "minute" => Some(format!("{:02}", at.minute())),
                other => tags.get(other).cloned(),
            })
            .with_context(|| format!("render index pattern `{}`", self.pattern))?;
            if seen.insert(prefix.clone()) {
                out.push(prefix);
            }
            ts += step;
        }
        Ok(out)
    }

    /// Stored paths of every index file under the prefixes for `[start, end]`.
    ///
    /// # Errors
    ///
    /// Fails if a prefix cannot be rendered or listing the storage fails.
    pub fn select_index_files(
        &self,
        storage: &dyn ObjectStorage,
        tags: &Tags,
        start: i64,
        end: i64,
    ) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for prefix in self.prefixes(tags, start, end)? {
            let listed = storage
                .list(&prefix)
                .with_context(|| format!("list {prefix} in {}", storage.location()))?;
            files.extend(listed.into_iter().filter(|k| Self::is_index_key(k)));
        }
        Ok(files)
    }
}

/// A named dedup cache definition with its window parsed.
#[derive(Clone, Debug, Default)]
pub struct PkCacheDef {
    pub name: String,
    pub storage: Option<String>,
    pub pattern: Option<String>,
    pub window: Option<u64>,
    pub granularity: Granularity,
}

impl PkCacheDef {
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] for a bad window or granularity.
    pub fn from_config(conf: &PkCacheConfig) -> Result<Self> {
        Ok(Self {
            name: conf.name.clone(),
            storage: conf.storage.clone(),
            pattern: conf.pattern.clone(),
            window: conf.window.as_deref().map(parse_window).transpose()?,
            granularity: conf
                .granularity
                .as_deref()
                .map(Granularity::parse)
                .transpose()?
                .unwrap_or_default(),
        })
    }

    /// A cache with no index search, used when a step names no cache.
    #[must_use]
    pub fn local(name: &str, window: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            window,
            ..Self::default()
        }
    }
}

/// One live cache plus its index-search bookkeeping.
#[derive(Debug)]
pub struct PkCacheEntry {
    cache: PkIndexCache,
    searcher: Option<IndexSearcher>,
    ingested: HashSet<String>,
    last_searched: Option<i64>,
    /// Keys registered by runs that are not committed yet, by run id.
    pending: HashMap<String, Vec<PkTuple>>,
}

impl PkCacheEntry {
    #[must_use]
    pub fn cache(&self) -> &PkIndexCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PkIndexCache {
        &mut self.cache
    }

    /// Register keys a run emitted. They stay attributed to `run_id` until
    /// [`PkCacheRegistry::settle`] or [`PkCacheRegistry::withdraw`].
    pub fn register(&mut self, run_id: &str, keys: Vec<PkTuple>, now: i64) {
        for key in &keys {
            self.cache.insert(key.clone(), now);
        }
        self.pending.entry(run_id.to_string()).or_default().extend(keys);
    }

    /// Ingest index files published since the last search.
    ///
    /// The first search looks back one window (one granularity unit when
    /// keys never expire). Each index file is read at most once.
    ///
    /// # Errors
    ///
    /// Fails if listing or fetching an index file fails.
    pub fn refresh(&mut self, storage: Option<&dyn ObjectStorage>, tags: &Tags, now: i64) -> Result<usize> {
        let (Some(searcher), Some(storage)) = (&self.searcher, storage) else {
            self.cache.advance(now);
            return Ok(0);
        };
        let lookback = self.cache.window().map_or_else(
            || searcher.granularity.seconds(),
            |w| i64::try_from(w).unwrap_or(i64::MAX),
        );
        let start = self.last_searched.unwrap_or(now.saturating_sub(lookback));
        let mut added = 0;
        for stored in searcher.select_index_files(storage, tags, start, now)? {
            if !self.ingested.insert(stored.clone()) {
                continue;
            }
            let raw = storage
                .fetch_file(&stored)
                .with_context(|| format!("fetch index {stored}"))?;
            let reader = decompressing_reader(raw, &stored)?;
            added += self.cache.ingest(RecordLines::new(reader, stored.clone()), now);
            tracing::debug!(index = %stored, "ingested index file");
        }
        self.cache.advance(now);
        self.last_searched = Some(now);
        Ok(added)
    }
}

/// The process-local caches, created lazily by name.
#[derive(Debug, Default)]
pub struct PkCacheRegistry {
    entries: HashMap<String, PkCacheEntry>,
}

impl PkCacheRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache called `def.name`, created with `keys` and baseline `now`
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] if an existing cache was created
    /// with different key fields.
    pub fn entry(&mut self, def: &PkCacheDef, keys: &[String], now: i64) -> Result<&mut PkCacheEntry> {
        let entry = self.entries.entry(def.name.clone()).or_insert_with(|| {
            tracing::debug!(cache = %def.name, ?keys, window = ?def.window, "created pk cache");
            PkCacheEntry {
                cache: PkIndexCache::new(keys.to_vec(), def.window, now),
                searcher: def
                    .pattern
                    .as_ref()
                    .map(|p| IndexSearcher::new(p.clone(), def.granularity)),
                ingested: HashSet::new(),
                last_searched: None,
                pending: HashMap::new(),
            }
        });
        if entry.cache.keys() != keys {
            return Err(SpinError::Configuration(format!(
                "pk cache `{}` is keyed by {:?}, not {keys:?}",
                def.name,
                entry.cache.keys()
            ))
            .into());
        }
        Ok(entry)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PkCacheEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PkCacheEntry> {
        self.entries.get_mut(name)
    }

    /// A run committed: its keys stay cached for good.
    pub fn settle(&mut self, run_id: &str) {
        for entry in self.entries.values_mut() {
            entry.pending.remove(run_id);
        }
    }

    /// A run is abandoned and its source will be processed from scratch:
    /// forget the keys it registered. Returns how many were removed.
    pub fn withdraw(&mut self, run_id: &str) -> usize {
        let mut removed = 0;
        for (name, entry) in &mut self.entries {
            let Some(keys) = entry.pending.remove(run_id) else {
                continue;
            };
            let count = keys.iter().filter(|k| entry.cache.remove(k)).count();
            tracing::debug!(cache = %name, %run_id, removed = count, "withdrew keys of abandoned run");
            removed += count;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn hourly_prefixes() {
        let searcher = IndexSearcher::new("idx/{app}/{year}/{month}/{day}/{hour}/", Granularity::Hour);
        // 2024-03-01T09:30:00Z .. 2024-03-01T11:05:00Z
        let got = searcher
            .prefixes(&tags(&[("app", "web")]), 1_709_285_400, 1_709_291_100)
            .unwrap();
        assert_eq!(
            got,
            vec![
                "idx/web/2024/03/01/09/",
                "idx/web/2024/03/01/10/",
                "idx/web/2024/03/01/11/"
            ]
        );
    }

    #[test]
    fn coarse_pattern_is_listed_once() {
        let searcher = IndexSearcher::new("idx/{year}/{month}/{day}/", Granularity::Minute);
        let got = searcher.prefixes(&Tags::new(), 1_709_285_400, 1_709_285_400 + 600).unwrap();
        assert_eq!(got, vec!["idx/2024/03/01/"]);
    }

    #[test]
    fn missing_tag_in_pattern() {
        let searcher = IndexSearcher::new("idx/{app}/{year}/", Granularity::Day);
        assert!(searcher.prefixes(&Tags::new(), 0, 10).is_err());
    }

    #[test]
    fn withdraw_forgets_only_the_abandoned_run() {
        let mut caches = PkCacheRegistry::new();
        let def = PkCacheDef::local("dedup", Some(60));
        let keys = vec!["id".to_string()];
        let entry = caches.entry(&def, &keys, 0).unwrap();
        entry.register("RN1", vec![vec!["1".into()]], 0);
        entry.register("RN2", vec![vec!["2".into()]], 0);

        caches.settle("RN1");
        assert_eq!(caches.withdraw("RN1"), 0);
        assert_eq!(caches.withdraw("RN2"), 1);
        let cache = caches.get("dedup").unwrap().cache();
        assert!(cache.contains(&vec!["1".to_string()]));
        assert!(!cache.contains(&vec!["2".to_string()]));
    }

    #[test]
    fn index_keys() {
        assert!(IndexSearcher::is_index_key("a/b/events.index"));
        assert!(IndexSearcher::is_index_key("a/b/events-pk-index.jsonl"));
        assert!(!IndexSearcher::is_index_key("a/b-pk-index.d/events.jsonl"));
    }
}

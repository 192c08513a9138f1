//! Name lookup for storages, streams, data views and dedup caches.
//!
//! Steps never own their collaborators; they receive a `&dyn Registry` and
//! resolve configured names through it. [`Engine`] is the registry built
//! from a project file, and adapters for storage types without a built-in
//! backend (S3, COS) are added with [`Engine::register_storage`].

use crate::config::ProjectConfig;
use crate::pkindex::PkCacheDef;
use crate::schema::DataView;
use crate::storage::{ObjectStorage, StorageType, storage_from_url};
use crate::stream::{Stream, stream_from_config};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only lookups used by steps and the pipeline driver.
pub trait Registry: Send + Sync {
    fn lookup_storage(&self, name: &str) -> Option<Arc<dyn ObjectStorage>>;

    fn lookup_stream(&self, name: &str) -> Option<Arc<dyn Stream>>;

    fn lookup_schema(&self, name: &str) -> Option<Arc<DataView>>;

    fn lookup_pk_cache(&self, name: &str) -> Option<PkCacheDef>;

    /// The storage serving pointer URLs of `storage_type` for `location`
    /// (a bucket name).
    fn lookup_storage_by_location(
        &self,
        storage_type: StorageType,
        location: &str,
    ) -> Option<Arc<dyn ObjectStorage>>;
}

/// Registry of named collaborators.
#[derive(Default)]
pub struct Engine {
    storages: HashMap<String, Arc<dyn ObjectStorage>>,
    streams: HashMap<String, Arc<dyn Stream>>,
    schemas: HashMap<String, Arc<DataView>>,
    pk_caches: HashMap<String, PkCacheDef>,
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate everything a project names.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage or stream URL has no built-in backend,
    /// or a data view or cache definition is invalid.
    pub fn from_config(conf: &ProjectConfig) -> Result<Self> {
        let mut engine = Self::new();
        for s in &conf.storages {
            let storage =
                storage_from_url(&s.url).with_context(|| format!("storage `{}`", s.name))?;
            engine.register_storage(&s.name, storage);
        }
        for s in &conf.sources {
            let stream = stream_from_config(s, true).with_context(|| format!("source `{}`", s.name))?;
            engine.register_stream(&s.name, stream);
        }
        for s in &conf.streams {
            let stream =
                stream_from_config(s, false).with_context(|| format!("stream `{}`", s.name))?;
            engine.register_stream(&s.name, stream);
        }
        for v in &conf.data_views {
            engine.register_schema(DataView::from_config(v).with_context(|| format!("data view `{}`", v.name))?);
        }
        for c in &conf.pk_caches {
            engine.register_pk_cache(PkCacheDef::from_config(c).with_context(|| format!("pk cache `{}`", c.name))?);
        }
        tracing::debug!(
            storages = engine.storages.len(),
            streams = engine.streams.len(),
            views = engine.schemas.len(),
            "engine ready"
        );
        Ok(engine)
    }

    pub fn register_storage(&mut self, name: &str, storage: Arc<dyn ObjectStorage>) -> &mut Self {
        self.storages.insert(name.to_string(), storage);
        self
    }

    pub fn register_stream(&mut self, name: &str, stream: Arc<dyn Stream>) -> &mut Self {
        self.streams.insert(name.to_string(), stream);
        self
    }

    pub fn register_schema(&mut self, view: DataView) -> &mut Self {
        self.schemas.insert(view.name.clone(), Arc::new(view));
        self
    }

    pub fn register_pk_cache(&mut self, def: PkCacheDef) -> &mut Self {
        self.pk_caches.insert(def.name.clone(), def);
        self
    }
}

impl Registry for Engine {
    fn lookup_storage(&self, name: &str) -> Option<Arc<dyn ObjectStorage>> {
        self.storages.get(name).cloned()
    }

    fn lookup_stream(&self, name: &str) -> Option<Arc<dyn Stream>> {
        self.streams.get(name).cloned()
    }

    fn lookup_schema(&self, name: &str) -> Option<Arc<DataView>> {
        self.schemas.get(name).cloned()
    }

    fn lookup_pk_cache(&self, name: &str) -> Option<PkCacheDef> {
        self.pk_caches.get(name).cloned()
    }

    fn lookup_storage_by_location(
        &self,
        storage_type: StorageType,
        location: &str,
    ) -> Option<Arc<dyn ObjectStorage>> {
        self.storages
            .values()
            .find(|s| s.storage_type() == storage_type && s.location() == location)
            .cloned()
    }
}

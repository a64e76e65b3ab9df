//! Process-wide engine context
//!
//! Owns the shared services (catalog, image metadata cache, mipmap cache,
//! module registry and worker pool). Created once at startup and passed by
//! `Arc` to develop sessions; the mipmap cache keeps a weak back-reference
//! so its generation callbacks can reach the other services.

use crate::cache::MipmapCache;
use crate::config::EngineConfig;
use crate::develop::ModuleRegistry;
use crate::error::{EngineError, Result};
use crate::jobs::JobQueue;
use crate::state::{Catalog, ImageCache, Library};
use std::sync::Arc;

pub struct Context {
    config: EngineConfig,
    catalog: Arc<dyn Catalog>,
    images: ImageCache,
    mipmaps: MipmapCache,
    modules: ModuleRegistry,
    jobs: JobQueue,
}

impl Context {
    pub fn new(config: EngineConfig, catalog: Arc<dyn Catalog>) -> Result<Arc<Self>> {
        let jobs = JobQueue::new(config.worker_threads)?;
        let catalog_path = catalog.path();
        let ctx = Arc::new_cyclic(|weak| Context {
            mipmaps: MipmapCache::new(&config, catalog_path.as_deref(), weak.clone()),
            images: ImageCache::new(Arc::clone(&catalog)),
            modules: ModuleRegistry::builtin(),
            catalog,
            config,
            jobs,
        });
        tracing::info!("⚙️  Engine ready ({} workers)", ctx.config.worker_threads);
        Ok(ctx)
    }

    /// Context over the default catalog with the user's configuration.
    pub fn open_default() -> Result<Arc<Self>> {
        let config = EngineConfig::load()?;
        let path = Library::default_path()
            .ok_or_else(|| EngineError::Config("no data directory for the catalog".into()))?;
        let library = Library::open(&path)?;
        Self::new(config, Arc::new(library))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn mipmaps(&self) -> &MipmapCache {
        &self.mipmaps
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// Finish queued background work and stop the workers. Resident
    /// thumbnails are written back when the context is dropped.
    pub fn shutdown(&self) {
        self.jobs.shutdown();
        tracing::debug!("⚙️  Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::MEMORY_ROOT_NAME;
    use crate::testing::{scratch_dir, TestEnv};

    #[test]
    fn test_in_memory_catalog_uses_sentinel_root() {
        let env = TestEnv::new("context");
        let root = env.ctx.mipmaps().disk().root().unwrap().to_path_buf();
        assert!(root.ends_with(format!("{}.d", MEMORY_ROOT_NAME)));
        assert_eq!(env.ctx.modules().get("exposure").unwrap().version(), 2);
    }

    #[test]
    fn test_file_catalogs_get_distinct_roots() {
        let dir = scratch_dir("context-roots");
        let config = crate::testing::test_config(&dir);
        let a = Context::new(config.clone(), Arc::new(Library::open(&dir.join("a.db")).unwrap())).unwrap();
        let b = Context::new(config, Arc::new(Library::open(&dir.join("b.db")).unwrap())).unwrap();
        assert_ne!(a.mipmaps().disk().root(), b.mipmaps().disk().root());
        a.shutdown();
        b.shutdown();
    }
}

//! Image record cache
//!
//! Records are read from the catalog once and shared afterwards. Updates go
//! through a per-record write lock; `WriteMode::Safe` also writes the record
//! back to the catalog before the lock is released.

use super::data::ImageRecord;
use super::library::Catalog;
use crate::error::{EngineError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Persist to the catalog
    Safe,
    /// Update memory only
    Relaxed,
}

pub struct ImageCache {
    catalog: Arc<dyn Catalog>,
    records: RwLock<HashMap<u32, Arc<RwLock<ImageRecord>>>>,
}

impl ImageCache {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        ImageCache {
            catalog,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, id: u32) -> Result<Arc<RwLock<ImageRecord>>> {
        if let Some(slot) = self.records.read().get(&id) {
            return Ok(Arc::clone(slot));
        }
        let record = self.catalog.image(id)?.ok_or(EngineError::ImageNotFound(id))?;
        let mut records = self.records.write();
        // Another thread may have loaded it meanwhile; keep the first copy.
        let slot = records
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(record)));
        Ok(Arc::clone(slot))
    }

    /// Snapshot of the record.
    pub fn read(&self, id: u32) -> Result<ImageRecord> {
        Ok(self.slot(id)?.read().clone())
    }

    /// Modify the record under its write lock.
    pub fn update<R>(&self, id: u32, mode: WriteMode, f: impl FnOnce(&mut ImageRecord) -> R) -> Result<R> {
        let slot = self.slot(id)?;
        let mut record = slot.write();
        let result = f(&mut record);
        if mode == WriteMode::Safe {
            self.catalog.update_image(&record)?;
        }
        Ok(result)
    }

    /// Forget the cached copy; the next read goes to the catalog.
    pub fn remove(&self, id: u32) {
        self.records.write().remove(&id);
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::library::Library;
    use std::path::Path;

    fn cache_with_image() -> (ImageCache, Arc<Library>, u32) {
        let library = Arc::new(Library::open_in_memory().unwrap());
        let id = library.import_image(Path::new("/photos/a.nef")).unwrap();
        (ImageCache::new(library.clone()), library, id)
    }

    #[test]
    fn test_read_missing_image() {
        let (cache, _, _) = cache_with_image();
        assert!(matches!(cache.read(42), Err(EngineError::ImageNotFound(42))));
    }

    #[test]
    fn test_relaxed_update_stays_in_memory() {
        let (cache, library, id) = cache_with_image();
        cache.update(id, WriteMode::Relaxed, |r| r.width = 100).unwrap();
        assert_eq!(cache.read(id).unwrap().width, 100);
        assert_eq!(library.image(id).unwrap().unwrap().width, 0);
    }

    #[test]
    fn test_safe_update_persists() {
        let (cache, library, id) = cache_with_image();
        let old = cache.update(id, WriteMode::Safe, |r| std::mem::replace(&mut r.maker, "Nikon".into())).unwrap();
        assert_eq!(old, "");
        assert_eq!(library.image(id).unwrap().unwrap().maker, "Nikon");

        cache.remove(id);
        assert_eq!(cache.read(id).unwrap().maker, "Nikon");
    }
}

// Reference counted store of loaded world models, shared by every map and tile

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::model::WorldModel;

struct CacheEntry {
    model: Arc<WorldModel>,
    ref_count: u32,
}

/// Maps canonical model file names to their single loaded instance.
/// The mutex is held across the file parse.
pub struct ModelCache {
    root: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Strip the trailing NUL padding some extracted names carry
pub fn canonical_model_name(name: &str) -> &str {
    name.trim_end_matches('\0')
}

impl ModelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.vmo", canonical_model_name(name)))
    }

    /// Return the loaded model for `name`, parsing it on first use, and take one reference
    pub fn acquire(&self, name: &str) -> Result<Arc<WorldModel>> {
        let name = canonical_model_name(name);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(name) {
            entry.ref_count += 1;
            return Ok(Arc::clone(&entry.model));
        }

        let path = self.model_path(name);
        debug!("Loading model {}", path.display());
        let model = match WorldModel::read_file(&path) {
            Ok(model) => Arc::new(model),
            Err(e) => {
                error!("Could not load model {}: {}", path.display(), e);
                return Err(e);
            }
        };

        entries.insert(
            name.to_string(),
            CacheEntry {
                model: Arc::clone(&model),
                ref_count: 1,
            },
        );
        Ok(model)
    }

    /// Drop one reference; the model is unloaded when the last one goes.
    /// Returns false if `name` was not held.
    pub fn release(&self, name: &str) -> bool {
        let name = canonical_model_name(name);
        let unloaded = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(name) else {
                warn!("Releasing model {} which is not loaded", name);
                return false;
            };

            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                entries.remove(name)
            } else {
                None
            }
        };

        // the model itself is freed outside the lock
        if unloaded.is_some() {
            debug!("Unloading model {}", name);
        }
        true
    }

    /// Acquire `name` and wrap the reference in a handle that releases it on drop
    pub fn acquire_handle(self: &Arc<Self>, name: &str) -> Result<ModelHandle> {
        let model = self.acquire(name)?;
        Ok(ModelHandle {
            name: canonical_model_name(name).to_string(),
            model,
            cache: Arc::clone(self),
        })
    }

    pub fn loaded_model_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Current reference count of `name`, 0 if not loaded
    pub fn ref_count(&self, name: &str) -> u32 {
        self.entries
            .lock()
            .get(canonical_model_name(name))
            .map_or(0, |entry| entry.ref_count)
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("root", &self.root)
            .field("loaded", &self.loaded_model_count())
            .finish()
    }
}

/// One counted reference to a cached model
pub struct ModelHandle {
    name: String,
    model: Arc<WorldModel>,
    cache: Arc<ModelCache>,
}

impl Deref for ModelHandle {
    type Target = WorldModel;

    fn deref(&self) -> &WorldModel {
        &self.model
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.cache.release(&self.name);
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::box_group;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_model(dir: &Path, name: &str) {
        let model = WorldModel::new(7, 0, vec![box_group(5.0, 0.0, 10.0, 1, None)]);
        model.write_file(&dir.join(format!("{}.vmo", name))).unwrap();
    }

    #[test]
    fn test_acquire_release_counts() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "tower.wmo");
        let cache = ModelCache::new(dir.path());

        let a = cache.acquire("tower.wmo").unwrap();
        let b = cache.acquire("tower.wmo\0\0").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.ref_count("tower.wmo"), 2);
        assert_eq!(cache.loaded_model_count(), 1);

        assert!(cache.release("tower.wmo\0"));
        assert_eq!(cache.ref_count("tower.wmo"), 1);
        assert!(cache.release("tower.wmo"));
        assert_eq!(cache.loaded_model_count(), 0);

        // double release is reported and changes nothing
        assert!(!cache.release("tower.wmo"));
        assert_eq!(cache.loaded_model_count(), 0);
    }

    #[test]
    fn test_failed_parse_inserts_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.wmo.vmo"), b"VMAP_7.0WMOD").unwrap();
        let cache = ModelCache::new(dir.path());

        assert!(cache.acquire("broken.wmo").is_err());
        assert!(cache.acquire("missing.wmo").is_err());
        assert_eq!(cache.loaded_model_count(), 0);
    }

    #[test]
    fn test_handle_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "hut.wmo");
        let cache = Arc::new(ModelCache::new(dir.path()));

        let first = cache.acquire_handle("hut.wmo").unwrap();
        let second = cache.acquire_handle("hut.wmo").unwrap();
        assert_eq!(first.root_wmo_id(), 7);
        assert_eq!(cache.ref_count("hut.wmo"), 2);

        drop(first);
        assert_eq!(cache.ref_count("hut.wmo"), 1);
        drop(second);
        assert_eq!(cache.loaded_model_count(), 0);
    }

    #[test]
    fn test_concurrent_acquire_single_instance() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "shared.wmo");
        let cache = ModelCache::new(dir.path());

        let models: Vec<Arc<WorldModel>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8).map(|_| s.spawn(|| cache.acquire("shared.wmo").unwrap())).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(models.iter().all(|m| Arc::ptr_eq(m, &models[0])));
        assert_eq!(cache.ref_count("shared.wmo"), 8);
        for _ in 0..8 {
            cache.release("shared.wmo");
        }
        assert_eq!(cache.loaded_model_count(), 0);
    }
}

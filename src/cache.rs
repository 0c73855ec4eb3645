//! Per-root usage cache and per-image parse cache, per `spec.md` §3
//! "Lifecycle" and §4.7, built on `moka`, already a dependency of the
//! predecessor crate (see root `Cargo.toml`) for exactly this kind of
//! small concurrent TTL map.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::image::ImageTree;

/// Cached bytes-used for a root, invalidated on any mutation whose delta
/// can't be computed as a simple add/subtract (`spec.md` §4.7).
#[derive(Clone)]
pub struct UsageCache {
    inner: Cache<PathBuf, u64>,
}

impl UsageCache {
    pub fn new() -> Self {
        Self { inner: Cache::builder().time_to_live(Duration::from_secs(3)).build() }
    }

    pub fn get(&self, root: &PathBuf) -> Option<u64> {
        self.inner.get(root)
    }

    pub fn set(&self, root: PathBuf, bytes: u64) {
        self.inner.insert(root, bytes);
    }

    pub fn invalidate(&self, root: &PathBuf) {
        self.inner.invalidate(root);
    }

    /// Applies a known-exact signed delta to a cached entry, if present.
    pub fn apply_delta(&self, root: &PathBuf, delta: i64) {
        if let Some(cur) = self.inner.get(root) {
            let next = (cur as i64 + delta).max(0) as u64;
            self.inner.insert(root.clone(), next);
        }
    }
}

impl Default for UsageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Key for a cached disk-image parse: invalidated whenever the underlying
/// file's `(mtime, size)` no longer matches (`spec.md` §3 Lifecycle, §9 open
/// question (b) about same-second external edits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageCacheKey {
    pub mtime_unix: u64,
    pub size: u64,
}

#[derive(Clone)]
pub struct ImageParseCache {
    inner: Cache<PathBuf, (ImageCacheKey, Arc<ImageTree>)>,
}

impl ImageParseCache {
    pub fn new() -> Self {
        Self { inner: Cache::builder().max_capacity(256).build() }
    }

    pub fn get(&self, path: &PathBuf, key: ImageCacheKey) -> Option<Arc<ImageTree>> {
        match self.inner.get(path) {
            Some((cached_key, tree)) if cached_key == key => Some(tree),
            _ => None,
        }
    }

    pub fn set(&self, path: PathBuf, key: ImageCacheKey, tree: Arc<ImageTree>) {
        self.inner.insert(path, (key, tree));
    }

    pub fn invalidate(&self, path: &PathBuf) {
        self.inner.invalidate(path);
    }
}

impl Default for ImageParseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_cache_set_get_invalidate() {
        let cache = UsageCache::new();
        let root = PathBuf::from("/srv/root");
        assert_eq!(cache.get(&root), None);
        cache.set(root.clone(), 1000);
        assert_eq!(cache.get(&root), Some(1000));
        cache.apply_delta(&root, -200);
        assert_eq!(cache.get(&root), Some(800));
        cache.invalidate(&root);
        assert_eq!(cache.get(&root), None);
    }

    #[test]
    fn image_cache_miss_on_key_change() {
        let cache = ImageParseCache::new();
        let path = PathBuf::from("/srv/root/disk.d64");
        let key = ImageCacheKey { mtime_unix: 1000, size: 174848 };
        let tree = Arc::new(ImageTree::default());
        cache.set(path.clone(), key, tree.clone());
        assert!(cache.get(&path, key).is_some());

        let changed = ImageCacheKey { mtime_unix: 1001, size: 174848 };
        assert!(cache.get(&path, changed).is_none());
    }
}

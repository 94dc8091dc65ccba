// ABOUTME: In-process named caches and the invalidation contract the dispatcher uses
// ABOUTME: Also provides a read-through, write-through SubscriberStore wrapper

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use sync_store::{Snapshot, SubscriberStore};

/// Receiver of cache-invalidation signals. Invalidating a key that is not
/// cached is a no-op.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, cache: &str, key: &str);

    fn invalidate_all(&self, cache: &str);
}

/// Named key/value caches held in process memory.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, HashMap<String, Snapshot>>>,
    invalidations: AtomicU64,
}

impl CacheRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let caches = names
            .into_iter()
            .map(|name| (name.into(), HashMap::new()))
            .collect();
        Self {
            caches: RwLock::new(caches),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn get(&self, cache: &str, key: &str) -> Option<Snapshot> {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        caches.get(cache).and_then(|entries| entries.get(key)).cloned()
    }

    pub fn put(&self, cache: &str, key: &str, value: Snapshot) {
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        caches
            .entry(cache.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Drop an entry without counting it as an invalidation signal.
    pub fn evict(&self, cache: &str, key: &str) {
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = caches.get_mut(cache) {
            entries.remove(key);
        }
    }

    pub fn len(&self, cache: &str) -> usize {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        caches.get(cache).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, cache: &str) -> bool {
        self.len(cache) == 0
    }

    pub fn cache_names(&self) -> Vec<String> {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total invalidation signals received, hits or not.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl CacheInvalidator for CacheRegistry {
    fn invalidate(&self, cache: &str, key: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = caches.get_mut(cache) {
            entries.remove(key);
        }
        tracing::debug!(cache, key, "cache entry invalidated");
    }

    fn invalidate_all(&self, cache: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = caches.get_mut(cache) {
            entries.clear();
        }
        tracing::debug!(cache, "cache cleared");
    }
}

/// Read-through, write-through cache in front of a canonical store.
pub struct CachedSubscriberStore {
    inner: Arc<dyn SubscriberStore>,
    cache: Arc<CacheRegistry>,
    cache_name: String,
}

impl CachedSubscriberStore {
    pub fn new(
        inner: Arc<dyn SubscriberStore>,
        cache: Arc<CacheRegistry>,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            cache,
            cache_name: cache_name.into(),
        }
    }
}

impl SubscriberStore for CachedSubscriberStore {
    fn get(&self, key: &str) -> sync_store::Result<Option<Snapshot>> {
        if let Some(hit) = self.cache.get(&self.cache_name, key) {
            return Ok(Some(hit));
        }
        let value = self.inner.get(key)?;
        if let Some(value) = &value {
            self.cache.put(&self.cache_name, key, value.clone());
        }
        Ok(value)
    }

    fn upsert(&self, key: &str, snapshot: &Snapshot) -> sync_store::Result<()> {
        self.inner.upsert(key, snapshot)?;
        self.cache.put(&self.cache_name, key, snapshot.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> sync_store::Result<bool> {
        let removed = self.inner.remove(key)?;
        self.cache.evict(&self.cache_name, key);
        Ok(removed)
    }
}

//! Named Moka caches, one per coordinator namespace.

use std::collections::HashMap;
use std::sync::Arc;

use moka::sync::Cache;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::CacheConfig;

/// Entries of a single namespace.
///
/// Cloning is cheap and shares the same underlying cache.
#[derive(Clone)]
pub struct NamespaceCache {
    inner: Cache<String, Value>,
    name: Arc<str>,
}

impl NamespaceCache {
    pub fn new(name: impl Into<Arc<str>>, config: &CacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_entries);
        if let Some(ttl) = config.entry_ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            inner: builder.build(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, key: &str, value: Value) {
        self.inner.insert(key.to_string(), value);
    }

    /// Returns `Some(value)` if the key exists and hasn't expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key)
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }
}

impl std::fmt::Debug for NamespaceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceCache")
            .field("name", &self.name)
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

/// Registry of namespace caches, created on first use.
#[derive(Clone)]
pub struct NamespaceCaches {
    caches: Arc<RwLock<HashMap<String, NamespaceCache>>>,
    config: CacheConfig,
}

impl NamespaceCaches {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            caches: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get an existing namespace cache.
    pub fn get(&self, namespace: &str) -> Option<NamespaceCache> {
        self.caches.read().get(namespace).cloned()
    }

    /// Get a namespace cache or create an empty one.
    pub fn get_or_create(&self, namespace: &str) -> NamespaceCache {
        if let Some(cache) = self.get(namespace) {
            return cache;
        }

        let mut caches = self.caches.write();
        caches
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!("Creating namespace cache: {}", namespace);
                NamespaceCache::new(namespace, &self.config)
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }
}

impl Default for NamespaceCaches {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for NamespaceCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let caches = self.caches.read();
        f.debug_struct("NamespaceCaches")
            .field("namespace_count", &caches.len())
            .field("namespaces", &caches.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespaces_are_isolated() {
        let caches = NamespaceCaches::default();
        caches.get_or_create("registry").insert("generation", json!("a"));
        caches.get_or_create("module-kv").insert("generation", json!("b"));

        assert_eq!(caches.len(), 2);
        assert_eq!(
            caches.get("registry").and_then(|c| c.get("generation")),
            Some(json!("a"))
        );
        assert_eq!(
            caches.get("module-kv").and_then(|c| c.get("generation")),
            Some(json!("b"))
        );
        assert!(caches.get("unknown").is_none());
    }

    #[test]
    fn test_clones_share_entries() {
        let caches = NamespaceCaches::default();
        let other = caches.clone();

        let cache = caches.get_or_create("registry");
        cache.insert("snapshot", json!({ "fully_loaded": true }));
        assert_eq!(cache.name(), "registry");

        let shared = other.get_or_create("registry");
        assert!(shared.get("snapshot").is_some());
        shared.invalidate("snapshot");
        assert!(cache.get("snapshot").is_none());
    }
}

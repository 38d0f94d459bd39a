//! Per-module key/value store with cache-aside reads and write-through writes.
//!
//! Each module's data is its own coordinator namespace (`module-kv-<id>`);
//! loads and writes for one module hold that namespace's lock. `drop_all`
//! uses the shared `module-kv` namespace and broadcasts a new generation so
//! every process drops its partitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{
    CacheCoordinator, Coordination, ModuleValues, OwnerId, PartitionCache,
};
use crate::config::RegistryConfig;
use crate::database::models::{ConfigEntry, ModuleId};
use crate::database::store::{Filter, RowStore};
use crate::error::{RegistryError, Result};

pub const CONFIG_TABLE: &str = "module_config";

/// Which keys of a module to read.
#[derive(Debug, Clone, Copy)]
pub enum Keys<'a> {
    All,
    Only(&'a [&'a str]),
}

/// An entry requested from [`ModuleKvStore::get`] that does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingEntry {
    pub module_id: ModuleId,
    /// `None` when the whole module has no data.
    pub key: Option<String>,
}

impl std::fmt::Display for MissingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "module {} key '{}'", self.module_id, key),
            None => write!(f, "module {}", self.module_id),
        }
    }
}

/// Best-effort batch result: everything found plus what was missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigBatch {
    pub values: BTreeMap<ModuleId, ModuleValues>,
    pub missing: Vec<MissingEntry>,
}

impl ConfigBatch {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// All requested values, or `NotFound` naming every missing entry.
    pub fn into_complete(self) -> Result<BTreeMap<ModuleId, ModuleValues>> {
        if self.missing.is_empty() {
            return Ok(self.values);
        }
        let missing: Vec<String> = self.missing.iter().map(ToString::to_string).collect();
        Err(RegistryError::NotFound(missing.join(", ")))
    }
}

/// Local cache statistics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheStats {
    pub cached_modules: usize,
    pub fully_loaded_modules: usize,
    pub cached_keys: usize,
}

/// Repository for module key/value data.
pub struct ModuleKvStore {
    store: Arc<dyn RowStore>,
    coordination: Coordination,
    cache: RwLock<PartitionCache>,
}

impl ModuleKvStore {
    pub fn new(
        store: Arc<dyn RowStore>,
        coordinator: Arc<dyn CacheCoordinator>,
        owner: OwnerId,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            store,
            coordination: Coordination::new(coordinator, owner, config),
            cache: RwLock::new(PartitionCache::new()),
        }
    }

    fn root_namespace(&self) -> String {
        self.coordination.namespace("module-kv")
    }

    fn module_namespace(&self, module_id: ModuleId) -> String {
        self.coordination.namespace(&format!("module-kv-{module_id}"))
    }

    /// Batch read. Store and lock failures fail the whole call; entries that
    /// do not exist are reported in [`ConfigBatch::missing`].
    pub async fn get(&self, module_ids: &[ModuleId], keys: Keys<'_>) -> Result<ConfigBatch> {
        if let Keys::Only(keys) = keys {
            for key in keys {
                ConfigEntry::validate_key(key)?;
            }
        }
        self.sync_generation().await?;

        let mut ids = module_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut batch = ConfigBatch::default();
        for module_id in ids {
            let values = match keys {
                Keys::All => {
                    let values = self.load_module(module_id).await?;
                    if values.is_empty() {
                        batch.missing.push(MissingEntry {
                            module_id,
                            key: None,
                        });
                    }
                    values
                }
                Keys::Only(keys) => {
                    let values = self.load_keys(module_id, keys).await?;
                    for key in keys {
                        if !values.contains_key(*key) {
                            batch.missing.push(MissingEntry {
                                module_id,
                                key: Some((*key).to_string()),
                            });
                        }
                    }
                    values
                }
            };
            if !values.is_empty() {
                batch.values.insert(module_id, values);
            }
        }
        Ok(batch)
    }

    /// Single value, failing with `NotFound` if absent.
    pub async fn get_key(&self, module_id: ModuleId, key: &str) -> Result<Value> {
        let mut values = self
            .get(&[module_id], Keys::Only(&[key]))
            .await?
            .into_complete()?;
        values
            .remove(&module_id)
            .and_then(|mut v| v.remove(key))
            .ok_or_else(|| RegistryError::NotFound(format!("module {module_id} key '{key}'")))
    }

    /// Every value of one module, failing with `NotFound` if it has none.
    pub async fn get_module(&self, module_id: ModuleId) -> Result<ModuleValues> {
        let mut values = self.get(&[module_id], Keys::All).await?.into_complete()?;
        Ok(values.remove(&module_id).unwrap_or_default())
    }

    /// Every value of several modules; modules without data are reported missing.
    pub async fn get_modules(&self, module_ids: &[ModuleId]) -> Result<ConfigBatch> {
        self.get(module_ids, Keys::All).await
    }

    /// Write a value, creating the key if absent.
    pub async fn set_key(&self, module_id: ModuleId, key: &str, value: Value) -> Result<()> {
        ConfigEntry::validate_key(key)?;
        self.sync_generation().await?;

        let lock = self.coordination.lock(&self.module_namespace(module_id)).await?;
        let result: Result<()> = async {
            let filter = Filter::eq("module_id", module_id).and_eq("key", key);
            let row = ConfigEntry::new(module_id, key, value.clone()).into_row();
            self.store
                .upsert(CONFIG_TABLE, &filter, row)
                .await
                .map_err(|e| {
                    RegistryError::store("set_key", format!("module {module_id} key '{key}'"), e)
                })?;

            self.cache.write().set(module_id, key, value);
            debug!("Set key '{}' for module {}", key, module_id);
            Ok(())
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    /// Delete a key. Deleting an absent key succeeds.
    pub async fn drop_key(&self, module_id: ModuleId, key: &str) -> Result<()> {
        ConfigEntry::validate_key(key)?;
        self.sync_generation().await?;

        let lock = self.coordination.lock(&self.module_namespace(module_id)).await?;
        let result: Result<()> = async {
            let filter = Filter::eq("module_id", module_id).and_eq("key", key);
            let removed = self.store.delete(CONFIG_TABLE, &filter).await.map_err(|e| {
                RegistryError::store("drop_key", format!("module {module_id} key '{key}'"), e)
            })?;

            self.cache.write().remove_key(module_id, key);
            debug!("Dropped key '{}' for module {} ({} row(s))", key, module_id, removed);
            Ok(())
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    /// Delete every key of a module. Returns the number of rows removed.
    pub async fn drop_module(&self, module_id: ModuleId) -> Result<u64> {
        self.sync_generation().await?;

        let lock = self.coordination.lock(&self.module_namespace(module_id)).await?;
        let result: Result<u64> = async {
            let removed = self
                .store
                .delete(CONFIG_TABLE, &Filter::eq("module_id", module_id))
                .await
                .map_err(|e| RegistryError::store("drop_module", format!("module {module_id}"), e))?;

            self.cache.write().remove_module(module_id);
            info!("Dropped {} key(s) of module {}", removed, module_id);
            Ok(removed)
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    /// Delete every key of every module and tell other processes to drop
    /// their caches. Returns the number of rows removed.
    pub async fn drop_all(&self) -> Result<u64> {
        let namespace = self.root_namespace();
        let lock = self.coordination.lock(&namespace).await?;
        let result: Result<u64> = async {
            let removed = self
                .store
                .delete(CONFIG_TABLE, &Filter::all())
                .await
                .map_err(|e| RegistryError::store("drop_all", "all modules", e))?;

            self.cache.write().clear();
            let generation = self.coordination.bump_generation(&namespace).await?;
            self.cache.write().set_generation(Some(generation));

            info!("Dropped all module key/value data ({} row(s))", removed);
            Ok(removed)
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    pub fn cache_stats(&self) -> KvCacheStats {
        let cache = self.cache.read();
        KvCacheStats {
            cached_modules: cache.module_count(),
            fully_loaded_modules: cache.fully_loaded_count(),
            cached_keys: cache.key_count(),
        }
    }

    /// Drop local partitions if another process broadcast a new generation.
    async fn sync_generation(&self) -> Result<()> {
        let current = self.coordination.generation(&self.root_namespace()).await?;

        let mut cache = self.cache.write();
        if cache.generation() != current.as_deref() {
            debug!(
                "Module key/value generation changed ({:?} -> {:?}), clearing local cache",
                cache.generation(),
                current
            );
            cache.clear();
            cache.set_generation(current);
        }
        Ok(())
    }

    /// All values of a module, loading and marking it fully loaded on miss.
    async fn load_module(&self, module_id: ModuleId) -> Result<ModuleValues> {
        let cached = self.cache.read().module(module_id);
        if let Some(values) = cached {
            debug!("Module {} served from cache", module_id);
            return Ok(values);
        }

        let lock = self.coordination.lock(&self.module_namespace(module_id)).await?;
        let result: Result<ModuleValues> = async {
            // Another task may have loaded it while we waited for the lock.
            let cached = self.cache.read().module(module_id);
            if let Some(values) = cached {
                return Ok(values);
            }

            let values = self
                .select(module_id, Filter::eq("module_id", module_id), "get_module")
                .await?;
            self.cache.write().replace_module(module_id, values.clone());
            debug!("Loaded {} key(s) of module {} from store", values.len(), module_id);
            Ok(values)
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    /// The requested keys that exist, loading only the ones not cached.
    async fn load_keys(&self, module_id: ModuleId, keys: &[&str]) -> Result<ModuleValues> {
        let lookup = self.cache.read().lookup(module_id, keys);
        if lookup.unresolved.is_empty() {
            return Ok(lookup.found);
        }

        let lock = self.coordination.lock(&self.module_namespace(module_id)).await?;
        let result: Result<ModuleValues> = async {
            let mut lookup = self.cache.read().lookup(module_id, keys);
            if lookup.unresolved.is_empty() {
                return Ok(lookup.found);
            }

            let filter = Filter::eq("module_id", module_id).and_in("key", lookup.unresolved.clone());
            let loaded = self.select(module_id, filter, "get").await?;
            self.cache.write().merge(module_id, loaded.clone());
            debug!(
                "Loaded {} of {} missing key(s) of module {} from store",
                loaded.len(),
                lookup.unresolved.len(),
                module_id
            );
            lookup.found.extend(loaded);
            Ok(lookup.found)
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    async fn select(
        &self,
        module_id: ModuleId,
        filter: Filter,
        operation: &'static str,
    ) -> Result<ModuleValues> {
        let context = || format!("module {module_id} where {filter}");
        let rows = self
            .store
            .select(CONFIG_TABLE, &filter)
            .await
            .map_err(|e| RegistryError::store(operation, context(), e))?;

        rows.into_iter()
            .map(|row| {
                ConfigEntry::from_row(row)
                    .map(|entry| (entry.key, entry.value))
                    .map_err(|e| RegistryError::store(operation, context(), e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::cache::MemoryCoordinator;
    use crate::database::MemoryStore;

    fn test_config() -> RegistryConfig {
        RegistryConfig::default()
            .lock_timeout(Duration::from_millis(300))
            .lock_poll_interval(Duration::from_millis(5))
    }

    /// One "process" sharing the given store and coordinator.
    fn instance(store: &MemoryStore, coordinator: &MemoryCoordinator, name: &str) -> ModuleKvStore {
        ModuleKvStore::new(
            Arc::new(store.clone()),
            Arc::new(coordinator.clone()),
            OwnerId::new(name),
            &test_config(),
        )
    }

    #[tokio::test]
    async fn test_set_get_drop_key_scenario() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");

        kv.set_key(1, "theme", json!("dark")).await.unwrap();
        assert_eq!(kv.get_key(1, "theme").await.unwrap(), json!("dark"));

        kv.drop_key(1, "theme").await.unwrap();
        let err = kv.get_key(1, "theme").await.unwrap_err();
        assert!(err.is_not_found());

        // Dropping an absent key is a no-op.
        kv.drop_key(1, "theme").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_key_overwrites_existing_row() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");

        kv.set_key(1, "theme", json!("dark")).await.unwrap();
        kv.set_key(1, "theme", json!({ "mode": "light" })).await.unwrap();

        assert_eq!(store.row_count(CONFIG_TABLE), 1);
        let fresh = instance(&store, &coordinator, "worker-2");
        assert_eq!(fresh.get_key(1, "theme").await.unwrap(), json!({ "mode": "light" }));
    }

    #[tokio::test]
    async fn test_batch_get_reports_missing_alongside_values() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");

        kv.set_key(1, "theme", json!("dark")).await.unwrap();
        kv.set_key(2, "theme", json!("light")).await.unwrap();
        kv.set_key(2, "layout", json!("grid")).await.unwrap();

        let batch = kv
            .get(&[1, 2, 3], Keys::Only(&["theme", "layout"]))
            .await
            .unwrap();
        assert_eq!(batch.values[&1]["theme"], json!("dark"));
        assert_eq!(batch.values[&2].len(), 2);
        assert!(!batch.values.contains_key(&3));
        assert_eq!(
            batch.missing,
            vec![
                MissingEntry { module_id: 1, key: Some("layout".into()) },
                MissingEntry { module_id: 3, key: Some("theme".into()) },
                MissingEntry { module_id: 3, key: Some("layout".into()) },
            ]
        );

        let err = batch.into_complete().unwrap_err();
        assert!(err.to_string().contains("module 3 key 'theme'"));

        let modules = kv.get_modules(&[2, 4]).await.unwrap();
        assert_eq!(modules.values[&2].len(), 2);
        assert_eq!(modules.missing, vec![MissingEntry { module_id: 4, key: None }]);
    }

    #[tokio::test]
    async fn test_fully_loaded_module_is_served_without_store() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let writer = instance(&store, &coordinator, "writer");
        writer.set_key(1, "theme", json!("dark")).await.unwrap();
        writer.set_key(1, "layout", json!("grid")).await.unwrap();

        let reader = instance(&store, &coordinator, "reader");
        assert_eq!(reader.get_module(1).await.unwrap().len(), 2);
        let selects = store.stats().selects;

        // Misses on a fully loaded module are definitive.
        let batch = reader.get(&[1], Keys::Only(&["theme", "size"])).await.unwrap();
        assert_eq!(batch.values[&1].len(), 1);
        assert_eq!(batch.missing.len(), 1);
        reader.get_module(1).await.unwrap();
        assert_eq!(store.stats().selects, selects);

        // A write keeps the partition fully loaded.
        reader.set_key(1, "size", json!(3)).await.unwrap();
        assert_eq!(reader.get_module(1).await.unwrap()["size"], json!(3));
        assert_eq!(store.stats().selects, selects);
        assert_eq!(
            reader.cache_stats(),
            KvCacheStats { cached_modules: 1, fully_loaded_modules: 1, cached_keys: 3 }
        );
    }

    #[tokio::test]
    async fn test_partial_load_loads_only_missing_keys() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");
        kv.set_key(1, "theme", json!("dark")).await.unwrap();

        let reader = instance(&store, &coordinator, "reader");
        assert_eq!(reader.get_key(1, "theme").await.unwrap(), json!("dark"));
        let selects = store.stats().selects;
        assert_eq!(reader.get_key(1, "theme").await.unwrap(), json!("dark"));
        assert_eq!(store.stats().selects, selects);
        assert_eq!(reader.cache_stats().fully_loaded_modules, 0);
    }

    #[tokio::test]
    async fn test_drop_module_clears_partition() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");

        kv.set_key(1, "theme", json!("dark")).await.unwrap();
        kv.set_key(1, "layout", json!("grid")).await.unwrap();
        kv.set_key(2, "theme", json!("light")).await.unwrap();
        kv.get_module(1).await.unwrap();

        assert_eq!(kv.drop_module(1).await.unwrap(), 2);
        assert!(kv.get_module(1).await.unwrap_err().is_not_found());
        assert_eq!(kv.get_key(2, "theme").await.unwrap(), json!("light"));
        assert_eq!(kv.drop_module(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_all_invalidates_other_processes() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let admin = instance(&store, &coordinator, "admin");
        let worker = instance(&store, &coordinator, "worker");

        admin.set_key(1, "theme", json!("dark")).await.unwrap();
        assert_eq!(worker.get_module(1).await.unwrap().len(), 1);
        assert_eq!(worker.cache_stats().fully_loaded_modules, 1);

        assert_eq!(admin.drop_all().await.unwrap(), 1);
        assert_eq!(store.row_count(CONFIG_TABLE), 0);

        // The worker's cached partition would otherwise still answer.
        assert!(worker.get_module(1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_keys_are_rejected_before_io() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");

        let err = kv
            .set_key(1, "a-key-that-is-too-long", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidKey { .. }));
        assert!(kv.get_key(1, "").await.is_err());
        assert_eq!(store.stats().upserts, 0);
        assert_eq!(store.stats().selects, 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_wrapped_and_releases_lock() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");

        store.set_available(false);
        let err = kv.set_key(5, "theme", json!("dark")).await.unwrap_err();
        match &err {
            RegistryError::StoreFailure { operation, context, .. } => {
                assert_eq!(*operation, "set_key");
                assert!(context.contains("module 5"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(coordinator.holder("modreg:module-kv-5").is_none());

        store.set_available(true);
        kv.set_key(5, "theme", json!("dark")).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_waits_for_lock_then_times_out() {
        let store = MemoryStore::new();
        let coordinator = MemoryCoordinator::new();
        let kv = instance(&store, &coordinator, "worker-1");

        let blocker = OwnerId::new("blocker");
        let _held = coordinator
            .try_acquire("modreg:module-kv-1", &blocker, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = kv.set_key(1, "theme", json!("dark")).await.unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout { .. }));
        assert_eq!(store.stats().upserts, 0);

        // Cache hits on other modules need no lock.
        kv.set_key(2, "theme", json!("dark")).await.unwrap();
        assert_eq!(kv.get_key(2, "theme").await.unwrap(), json!("dark"));
    }
}

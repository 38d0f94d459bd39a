//! Module registry with a multi-index, cache-first architecture.
//!
//! Modules are indexed three ways in the local [`RegistryCache`]:
//! - By module id (primary)
//! - By slug
//! - By implementing class
//!
//! Every mutation runs under the registry-wide coordinator lock, re-checks
//! uniqueness against the store, writes the store, updates the local cache,
//! then drops the shared snapshot and publishes a new generation so other
//! processes rebuild their caches on their next call.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::{CacheCoordinator, Coordination, OwnerId, RegistryCache};
use crate::config::RegistryConfig;
use crate::database::models::{Module, ModuleId};
use crate::database::store::{Filter, ID_COLUMN, RowStore};
use crate::error::{RegistryError, Result};

pub const MODULE_TABLE: &str = "modules";

/// Coordinator key holding the serialized [`RegistryCache`] of a full load.
const SNAPSHOT_KEY: &str = "snapshot";

/// One of the three unique keys of a module.
#[derive(Debug, Clone, Copy)]
enum Lookup<'a> {
    Id(ModuleId),
    Slug(&'a str),
    Class(&'a str),
}

impl Lookup<'_> {
    fn find(&self, cache: &RegistryCache) -> Option<Module> {
        match self {
            Lookup::Id(id) => cache.get(*id),
            Lookup::Slug(slug) => cache.by_slug(slug),
            Lookup::Class(class) => cache.by_class(class),
        }
    }

    fn filter(&self) -> Filter {
        match self {
            Lookup::Id(id) => Filter::eq(ID_COLUMN, *id),
            Lookup::Slug(slug) => Filter::eq("slug", *slug),
            Lookup::Class(class) => Filter::eq("class", *class),
        }
    }

    fn not_found(&self) -> RegistryError {
        RegistryError::NotFound(self.to_string())
    }
}

impl std::fmt::Display for Lookup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Id(id) => write!(f, "module {id}"),
            Lookup::Slug(slug) => write!(f, "module with slug '{slug}'"),
            Lookup::Class(class) => write!(f, "module with class '{class}'"),
        }
    }
}

/// Outcome of consulting only the local cache.
enum Probe {
    Hit(Module),
    /// Cache is fully loaded and has no such module.
    Absent,
    Miss,
}

/// Local cache statistics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryCacheStats {
    pub cached_modules: usize,
    pub active_modules: usize,
    pub fully_loaded: bool,
}

/// Repository for module identities and activation state.
pub struct ModuleRegistry {
    store: Arc<dyn RowStore>,
    coordination: Coordination,
    cache: RwLock<RegistryCache>,
}

impl ModuleRegistry {
    pub fn new(
        store: Arc<dyn RowStore>,
        coordinator: Arc<dyn CacheCoordinator>,
        owner: OwnerId,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            store,
            coordination: Coordination::new(coordinator, owner, config),
            cache: RwLock::new(RegistryCache::new()),
        }
    }

    fn namespace(&self) -> String {
        self.coordination.namespace("registry")
    }

    /// Register a module, returning its id.
    ///
    /// Registering an existing slug returns the existing id unchanged, even
    /// if name or class differ. A free slug whose class is already taken
    /// fails with [`RegistryError::DuplicateClass`].
    pub async fn register(
        &self,
        slug: &str,
        name: &str,
        implementing_class: &str,
        active: bool,
    ) -> Result<ModuleId> {
        // Name and class are only checked once a new row is needed.
        Module::validate_slug(slug)?;

        match self.get_by_slug(slug).await {
            Ok(existing) => {
                debug!("Module '{}' already registered as {}", slug, existing.module_id);
                return Ok(existing.module_id);
            }
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match self.get_by_class(implementing_class).await {
            // Registered by a peer since the slug lookup.
            Ok(existing) if existing.slug == slug => return Ok(existing.module_id),
            Ok(existing) => {
                return Err(RegistryError::DuplicateClass {
                    class: implementing_class.to_string(),
                    existing: existing.module_id,
                });
            }
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // A concurrent registration of the same slug may win between the
        // lookups above and the lock taken by `add`.
        match self.add(slug, name, implementing_class, active).await {
            Err(RegistryError::DuplicateSlug { existing, .. }) => {
                debug!("Module '{}' registered concurrently as {}", slug, existing);
                Ok(existing)
            }
            other => other,
        }
    }

    /// Insert a new module row.
    ///
    /// Uniqueness of slug and class is re-checked against the store under
    /// the registry lock.
    pub async fn add(
        &self,
        slug: &str,
        name: &str,
        implementing_class: &str,
        active: bool,
    ) -> Result<ModuleId> {
        Module::validate(slug, name, implementing_class)?;

        let namespace = self.namespace();
        let lock = self.coordination.lock(&namespace).await?;
        let result: Result<ModuleId> = async {
            self.sync_generation().await?;
            if let Some(existing) = self.fetch(Lookup::Slug(slug), "add").await? {
                return Err(RegistryError::DuplicateSlug {
                    slug: slug.to_string(),
                    existing: existing.module_id,
                });
            }
            if let Some(existing) = self.fetch(Lookup::Class(implementing_class), "add").await? {
                return Err(RegistryError::DuplicateClass {
                    class: implementing_class.to_string(),
                    existing: existing.module_id,
                });
            }

            let row = Module::new_row(slug, name, implementing_class, active);
            let context = || format!("slug '{slug}', class '{implementing_class}'");
            let module_id = self
                .store
                .insert(MODULE_TABLE, vec![row])
                .await
                .map_err(|e| RegistryError::store("add", context(), e))?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    RegistryError::store("add", context(), anyhow::anyhow!("store returned no id"))
                })?;

            self.cache.write().insert(Module {
                module_id,
                slug: slug.to_string(),
                name: name.to_string(),
                implementing_class: implementing_class.to_string(),
                active,
            });
            self.publish_mutation(&namespace).await?;

            info!(
                "Registered module {} (slug '{}', class '{}', active: {})",
                module_id, slug, implementing_class, active
            );
            Ok(module_id)
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    pub async fn get_module(&self, module_id: ModuleId) -> Result<Module> {
        self.lookup(Lookup::Id(module_id)).await
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Module> {
        self.lookup(Lookup::Slug(slug)).await
    }

    pub async fn get_by_class(&self, implementing_class: &str) -> Result<Module> {
        self.lookup(Lookup::Class(implementing_class)).await
    }

    pub async fn is_active(&self, module_id: ModuleId) -> Result<bool> {
        Ok(self.get_module(module_id).await?.active)
    }

    /// Change a module's activation state.
    pub async fn set_active(&self, module_id: ModuleId, active: bool) -> Result<()> {
        let namespace = self.namespace();
        let lock = self.coordination.lock(&namespace).await?;
        let result: Result<()> = async {
            self.sync_generation().await?;
            let lookup = Lookup::Id(module_id);
            let module = self
                .fetch(lookup, "set_active")
                .await?
                .ok_or_else(|| lookup.not_found())?;
            if module.active == active {
                return Ok(());
            }

            let mut row = serde_json::Map::new();
            row.insert("active".into(), json!(active));
            self.store
                .upsert(MODULE_TABLE, &lookup.filter(), row)
                .await
                .map_err(|e| RegistryError::store("set_active", lookup.to_string(), e))?;

            self.cache.write().set_active(module_id, active);
            self.publish_mutation(&namespace).await?;

            info!("Module {} ('{}') active: {}", module_id, module.slug, active);
            Ok(())
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    /// Every registered module, ordered by id.
    pub async fn modules(&self) -> Result<Vec<Module>> {
        self.load_all().await?;
        Ok(self.cache.read().modules())
    }

    /// Every active module, ordered by id.
    pub async fn active_modules(&self) -> Result<Vec<Module>> {
        Ok(self
            .modules()
            .await?
            .into_iter()
            .filter(|m| m.active)
            .collect())
    }

    /// Remove a module. Returns `false` if it did not exist.
    ///
    /// Its slug and class become free again; a later registration gets a
    /// new id.
    pub async fn drop_module(&self, module_id: ModuleId) -> Result<bool> {
        let namespace = self.namespace();
        let lock = self.coordination.lock(&namespace).await?;
        let result: Result<bool> = async {
            self.sync_generation().await?;
            let lookup = Lookup::Id(module_id);
            let removed = self
                .store
                .delete(MODULE_TABLE, &lookup.filter())
                .await
                .map_err(|e| RegistryError::store("drop_module", lookup.to_string(), e))?;

            let cached = self.cache.write().remove(module_id);
            if removed > 0 || cached.is_some() {
                self.publish_mutation(&namespace).await?;
            }

            info!("Dropped module {}: {}", module_id, removed > 0);
            Ok(removed > 0)
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    /// Remove every module and tell other processes to drop their caches.
    /// Returns the number of modules removed.
    pub async fn drop_all(&self) -> Result<u64> {
        let namespace = self.namespace();
        let lock = self.coordination.lock(&namespace).await?;
        let result: Result<u64> = async {
            let removed = self
                .store
                .delete(MODULE_TABLE, &Filter::all())
                .await
                .map_err(|e| RegistryError::store("drop_all", "all modules", e))?;

            self.cache.write().clear();
            self.publish_mutation(&namespace).await?;

            info!("Dropped all modules ({} row(s))", removed);
            Ok(removed)
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    /// Load every module into the local cache, after which misses are
    /// answered without querying the store.
    ///
    /// A snapshot published by another process is adopted when present;
    /// otherwise all rows are read and the snapshot is published.
    pub async fn load_all(&self) -> Result<()> {
        self.sync_generation().await?;
        if self.cache.read().is_fully_loaded() {
            return Ok(());
        }

        let namespace = self.namespace();
        let lock = self.coordination.lock(&namespace).await?;
        let result: Result<()> = async {
            self.sync_generation().await?;
            if self.cache.read().is_fully_loaded() {
                return Ok(());
            }

            if let Some(snapshot) = self.coordination.get(&namespace, SNAPSHOT_KEY).await? {
                match serde_json::from_value::<RegistryCache>(snapshot) {
                    Ok(snapshot) if snapshot.is_fully_loaded() => {
                        debug!("Adopted registry snapshot with {} module(s)", snapshot.len());
                        self.cache.write().adopt(snapshot);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Ignoring unreadable registry snapshot: {}", e),
                }
            }

            let rows = self
                .store
                .select(MODULE_TABLE, &Filter::all())
                .await
                .map_err(|e| RegistryError::store("load_all", "all modules", e))?;
            let modules = rows
                .into_iter()
                .map(Module::from_row)
                .collect::<anyhow::Result<Vec<_>>>()
                .map_err(|e| RegistryError::store("load_all", "all modules", e))?;

            let snapshot = {
                let mut cache = self.cache.write();
                cache.replace_all(modules);
                serde_json::to_value(&*cache)
            };
            match snapshot {
                Ok(snapshot) => self.coordination.set(&namespace, SNAPSHOT_KEY, snapshot).await?,
                Err(e) => warn!("Failed to serialize registry snapshot: {}", e),
            }

            debug!("Loaded {} module(s) from store", self.cache.read().len());
            Ok(())
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    pub fn cache_stats(&self) -> RegistryCacheStats {
        let cache = self.cache.read();
        RegistryCacheStats {
            cached_modules: cache.len(),
            active_modules: cache.active_ids().len(),
            fully_loaded: cache.is_fully_loaded(),
        }
    }

    /// Cache-first lookup, lazily loading the module on a miss.
    async fn lookup(&self, lookup: Lookup<'_>) -> Result<Module> {
        self.sync_generation().await?;
        match self.probe(lookup) {
            Probe::Hit(module) => return Ok(module),
            Probe::Absent => return Err(lookup.not_found()),
            Probe::Miss => {}
        }

        let lock = self.coordination.lock(&self.namespace()).await?;
        let result: Result<Module> = async {
            // Another task may have loaded it, or a peer mutated the
            // registry, while we waited for the lock.
            self.sync_generation().await?;
            match self.probe(lookup) {
                Probe::Hit(module) => return Ok(module),
                Probe::Absent => return Err(lookup.not_found()),
                Probe::Miss => {}
            }
            self.fetch(lookup, "lookup")
                .await?
                .ok_or_else(|| lookup.not_found())
        }
        .await;
        self.coordination.unlock(lock).await;
        result
    }

    fn probe(&self, lookup: Lookup<'_>) -> Probe {
        let cache = self.cache.read();
        match lookup.find(&cache) {
            Some(module) => Probe::Hit(module),
            None if cache.is_fully_loaded() => Probe::Absent,
            None => Probe::Miss,
        }
    }

    /// Read a module straight from the store and cache it. Callers hold the
    /// registry lock.
    async fn fetch(&self, lookup: Lookup<'_>, operation: &'static str) -> Result<Option<Module>> {
        let rows = self
            .store
            .select(MODULE_TABLE, &lookup.filter())
            .await
            .map_err(|e| RegistryError::store(operation, lookup.to_string(), e))?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let module =
            Module::from_row(row).map_err(|e| RegistryError::store(operation, lookup.to_string(), e))?;

        debug!("Loaded {} from store", lookup);
        self.cache.write().insert(module.clone());
        Ok(Some(module))
    }

    /// Drop the shared snapshot and publish a new generation. Callers hold
    /// the registry lock, synced the generation after taking it, and have
    /// already updated the local cache.
    async fn publish_mutation(&self, namespace: &str) -> Result<()> {
        self.coordination.delete(namespace, SNAPSHOT_KEY).await?;
        let generation = self.coordination.bump_generation(namespace).await?;
        self.cache.write().set_generation(Some(generation));
        Ok(())
    }

    /// Drop the local cache if another process published a new generation.
    async fn sync_generation(&self) -> Result<()> {
        let current = self.coordination.generation(&self.namespace()).await?;

        let mut cache = self.cache.write();
        if cache.generation() != current.as_deref() {
            debug!(
                "Registry generation changed ({:?} -> {:?}), clearing local cache",
                cache.generation(),
                current
            );
            cache.clear();
            cache.set_generation(current);
        }
        Ok(())
    }
}

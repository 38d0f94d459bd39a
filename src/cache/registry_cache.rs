//! Process-local, multi-index cache of module identities.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::database::{Module, ModuleEntry, ModuleId};

/// Monolithic registry cache.
///
/// `by_class`, `by_slug` and `active_set` always describe exactly the modules
/// in `by_id`. Once `fully_loaded` is set, a lookup missing every index is a
/// definitive "not found".
///
/// The serialized form is the snapshot shared through the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCache {
    by_id: BTreeMap<ModuleId, ModuleEntry>,
    by_class: HashMap<String, ModuleId>,
    by_slug: HashMap<String, ModuleId>,
    active_set: BTreeSet<ModuleId>,
    fully_loaded: bool,
    /// Coordinator generation this cache was built against.
    #[serde(skip)]
    generation: Option<String>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a module, dropping index entries it no longer owns.
    pub fn insert(&mut self, module: Module) {
        self.remove(module.module_id);

        let id = module.module_id;
        self.by_class.insert(module.implementing_class.clone(), id);
        self.by_slug.insert(module.slug.clone(), id);
        if module.active {
            self.active_set.insert(id);
        }
        self.by_id.insert(id, module.entry());
    }

    pub fn remove(&mut self, module_id: ModuleId) -> Option<Module> {
        let entry = self.by_id.remove(&module_id)?;
        if self.by_slug.get(&entry.slug) == Some(&module_id) {
            self.by_slug.remove(&entry.slug);
        }
        if self.by_class.get(&entry.implementing_class) == Some(&module_id) {
            self.by_class.remove(&entry.implementing_class);
        }
        self.active_set.remove(&module_id);
        Some(Module::from_entry(module_id, &entry))
    }

    /// Replace the whole cache with a complete module list.
    pub fn replace_all(&mut self, modules: impl IntoIterator<Item = Module>) {
        self.clear();
        for module in modules {
            self.insert(module);
        }
        self.fully_loaded = true;
    }

    /// Adopt a snapshot published by another process, keeping our generation.
    pub fn adopt(&mut self, snapshot: RegistryCache) {
        let generation = self.generation.take();
        *self = snapshot;
        self.generation = generation;
    }

    /// Empty every index and reset `fully_loaded`.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_class.clear();
        self.by_slug.clear();
        self.active_set.clear();
        self.fully_loaded = false;
    }

    pub fn get(&self, module_id: ModuleId) -> Option<Module> {
        self.by_id
            .get(&module_id)
            .map(|entry| Module::from_entry(module_id, entry))
    }

    pub fn by_slug(&self, slug: &str) -> Option<Module> {
        self.by_slug.get(slug).and_then(|id| self.get(*id))
    }

    pub fn by_class(&self, implementing_class: &str) -> Option<Module> {
        self.by_class
            .get(implementing_class)
            .and_then(|id| self.get(*id))
    }

    pub fn set_active(&mut self, module_id: ModuleId, active: bool) -> bool {
        let Some(entry) = self.by_id.get_mut(&module_id) else {
            return false;
        };
        entry.active = active;
        if active {
            self.active_set.insert(module_id);
        } else {
            self.active_set.remove(&module_id);
        }
        true
    }

    pub fn is_active(&self, module_id: ModuleId) -> bool {
        self.active_set.contains(&module_id)
    }

    /// All cached modules ordered by id.
    pub fn modules(&self) -> Vec<Module> {
        self.by_id
            .iter()
            .map(|(id, entry)| Module::from_entry(*id, entry))
            .collect()
    }

    pub fn active_ids(&self) -> Vec<ModuleId> {
        self.active_set.iter().copied().collect()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.fully_loaded
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref()
    }

    pub fn set_generation(&mut self, generation: Option<String>) {
        self.generation = generation;
    }
}

//! Process-local cache of per-module key/value partitions.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::database::ModuleId;

/// Values of one module, by key.
pub type ModuleValues = BTreeMap<String, Value>;

/// `module_id -> key -> value`, plus the set of modules whose full key set
/// has been loaded. A partition that is not fully loaded may hold any subset
/// of the module's keys.
#[derive(Debug, Default)]
pub struct PartitionCache {
    partitions: HashMap<ModuleId, ModuleValues>,
    fully_loaded: HashSet<ModuleId>,
    generation: Option<String>,
}

/// Result of looking up specific keys in a partition.
#[derive(Debug, Default, PartialEq)]
pub struct KeyLookup {
    pub found: ModuleValues,
    /// Keys neither cached nor known absent.
    pub unresolved: Vec<String>,
}

impl PartitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values of a fully loaded module.
    pub fn module(&self, module_id: ModuleId) -> Option<ModuleValues> {
        if !self.fully_loaded.contains(&module_id) {
            return None;
        }
        Some(self.partitions.get(&module_id).cloned().unwrap_or_default())
    }

    /// Look up keys; for a fully loaded module nothing is ever unresolved.
    pub fn lookup(&self, module_id: ModuleId, keys: &[&str]) -> KeyLookup {
        let partition = self.partitions.get(&module_id);
        let complete = self.fully_loaded.contains(&module_id);
        let mut result = KeyLookup::default();

        for key in keys {
            match partition.and_then(|p| p.get(*key)) {
                Some(value) => {
                    result.found.insert((*key).to_string(), value.clone());
                }
                None if complete => {}
                None => result.unresolved.push((*key).to_string()),
            }
        }
        result
    }

    /// Store a module's complete key set and mark it fully loaded.
    pub fn replace_module(&mut self, module_id: ModuleId, values: ModuleValues) {
        if values.is_empty() {
            self.partitions.remove(&module_id);
        } else {
            self.partitions.insert(module_id, values);
        }
        self.fully_loaded.insert(module_id);
    }

    /// Merge a partial load into a module's partition.
    pub fn merge(&mut self, module_id: ModuleId, values: ModuleValues) {
        if values.is_empty() {
            return;
        }
        self.partitions.entry(module_id).or_default().extend(values);
    }

    /// Cache a single written value. A fully loaded module stays fully loaded.
    pub fn set(&mut self, module_id: ModuleId, key: &str, value: Value) {
        self.partitions
            .entry(module_id)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn remove_key(&mut self, module_id: ModuleId, key: &str) {
        if let Some(partition) = self.partitions.get_mut(&module_id) {
            partition.remove(key);
            if partition.is_empty() && !self.fully_loaded.contains(&module_id) {
                self.partitions.remove(&module_id);
            }
        }
    }

    /// Forget a module entirely, including its fully-loaded flag.
    pub fn remove_module(&mut self, module_id: ModuleId) {
        self.partitions.remove(&module_id);
        self.fully_loaded.remove(&module_id);
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
        self.fully_loaded.clear();
    }

    pub fn is_fully_loaded(&self, module_id: ModuleId) -> bool {
        self.fully_loaded.contains(&module_id)
    }

    pub fn module_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn fully_loaded_count(&self) -> usize {
        self.fully_loaded.len()
    }

    pub fn key_count(&self) -> usize {
        self.partitions.values().map(BTreeMap::len).sum()
    }

    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref()
    }

    pub fn set_generation(&mut self, generation: Option<String>) {
        self.generation = generation;
    }
}

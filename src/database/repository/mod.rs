//! Repository module - cache-backed data access for modules and their data.

mod module_kv;
mod module_registry;

pub use module_kv::{CONFIG_TABLE, ConfigBatch, Keys, KvCacheStats, MissingEntry, ModuleKvStore};
pub use module_registry::{MODULE_TABLE, ModuleRegistry, RegistryCacheStats};

//! Cache module - local caches and cross-process coordination.
//!
//! ## Architecture
//!
//! - `RegistryCache` / `PartitionCache` - per-instance caches owned by the
//!   registry and the key/value store
//! - `CacheCoordinator` - shared entries and advisory locks visible to every
//!   process (`MemoryCoordinator`, `MongoCoordinator`)
//! - `NamespaceCaches` - Moka caches backing the in-memory coordinator
//!
//! Local caches are never shared directly; other processes learn about
//! changes only through the coordinator's namespace generations.

mod config;
pub mod coordinator;
mod memory;
mod mongo;
mod namespaces;
mod partition;
mod registry_cache;

pub use config::CacheConfig;
pub use coordinator::{CacheCoordinator, Coordination, Lock, LockOptions, OwnerId};
pub use memory::MemoryCoordinator;
pub use mongo::MongoCoordinator;
pub use namespaces::{NamespaceCache, NamespaceCaches};
pub use partition::{KeyLookup, ModuleValues, PartitionCache};
pub use registry_cache::RegistryCache;

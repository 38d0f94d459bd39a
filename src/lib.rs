//! modreg - cache-backed module registry
//!
//! Keeps module identities (id, slug, name, implementing class) and each
//! module's key/value data in a row store, fronted by per-process caches
//! that several processes can share safely.
//!
//! ## Architecture
//!
//! - `config` - Lock settings and environment configuration
//! - `database` - Row stores (MongoDB, in-memory) and the two repositories,
//!   [`ModuleRegistry`] and [`ModuleKvStore`]
//! - `cache` - Local caches and the cross-process [`CacheCoordinator`]
//! - `error` - [`RegistryError`]

pub mod cache;
pub mod config;
pub mod database;
pub mod error;

pub use cache::{CacheCoordinator, MemoryCoordinator, MongoCoordinator, OwnerId};
pub use config::{Config, RegistryConfig};
pub use database::{
    ConfigBatch, Keys, MemoryStore, Module, ModuleId, ModuleKvStore, ModuleRegistry, MongoStore,
    RowStore,
};
pub use error::{RegistryError, Result};

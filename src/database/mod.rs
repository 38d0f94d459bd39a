//! Database module exports.

mod memory;
pub mod models;
mod mongo;
pub mod repository;
pub mod store;

pub use memory::{MemoryStore, StoreStats};
pub use models::*;
pub use mongo::MongoStore;
pub use repository::{
    CONFIG_TABLE, ConfigBatch, Keys, KvCacheStats, MODULE_TABLE, MissingEntry, ModuleKvStore,
    ModuleRegistry, RegistryCacheStats,
};
pub use store::{Condition, Filter, ID_COLUMN, Row, RowId, RowStore};

//! Stored models.

pub mod config_entry;
pub mod module;

pub use config_entry::{ConfigEntry, MAX_KEY_LEN};
pub use module::{MAX_CLASS_LEN, MAX_NAME_LEN, MAX_SLUG_LEN, Module, ModuleEntry, ModuleId};

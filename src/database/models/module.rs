//! Module identity model.

use serde::{Deserialize, Serialize};

use crate::database::store::Row;
use crate::error::{RegistryError, Result};

/// Store-assigned module identifier. Never reused.
pub type ModuleId = i64;

pub const MAX_SLUG_LEN: usize = 16;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_CLASS_LEN: usize = 255;

/// A registered module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    #[serde(rename = "id")]
    pub module_id: ModuleId,
    /// Short unique handle, immutable once registered.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Unique identifier of the code implementing the module.
    #[serde(rename = "class")]
    pub implementing_class: String,
    #[serde(default)]
    pub active: bool,
}

/// Per-id cache entry; the id itself is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub slug: String,
    pub name: String,
    pub implementing_class: String,
    pub active: bool,
}

impl Module {
    pub fn validate_slug(slug: &str) -> Result<()> {
        check_field("slug", slug, MAX_SLUG_LEN)
    }

    /// Check slug, name and class against their length limits.
    pub fn validate(slug: &str, name: &str, implementing_class: &str) -> Result<()> {
        Self::validate_slug(slug)?;
        check_field("name", name, MAX_NAME_LEN)?;
        check_field("implementing_class", implementing_class, MAX_CLASS_LEN)
    }

    /// Row for a module that has not been assigned an id yet.
    pub fn new_row(slug: &str, name: &str, implementing_class: &str, active: bool) -> Row {
        let mut row = Row::new();
        row.insert("slug".into(), slug.into());
        row.insert("name".into(), name.into());
        row.insert("class".into(), implementing_class.into());
        row.insert("active".into(), active.into());
        row
    }

    pub fn from_row(row: Row) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(row))?)
    }

    pub fn from_entry(module_id: ModuleId, entry: &ModuleEntry) -> Self {
        Self {
            module_id,
            slug: entry.slug.clone(),
            name: entry.name.clone(),
            implementing_class: entry.implementing_class.clone(),
            active: entry.active,
        }
    }

    pub fn entry(&self) -> ModuleEntry {
        ModuleEntry {
            slug: self.slug.clone(),
            name: self.name.clone(),
            implementing_class: self.implementing_class.clone(),
            active: self.active,
        }
    }
}

fn check_field(field: &'static str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() {
        return Err(RegistryError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    let len = value.chars().count();
    if len > max {
        return Err(RegistryError::InvalidField {
            field,
            reason: format!("{len} characters exceeds the limit of {max}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_limits() {
        assert!(Module::validate("gallery", "Gallery", "GalleryModule").is_ok());
        assert!(Module::validate("", "Gallery", "GalleryModule").is_err());
        assert!(Module::validate("a-very-long-slug-x", "Gallery", "GalleryModule").is_err());
        assert!(Module::validate("gallery", &"n".repeat(129), "GalleryModule").is_err());
        assert!(Module::validate("gallery", "Gallery", &"c".repeat(256)).is_err());
    }

    #[test]
    fn test_row_column_names() {
        let mut row = Module::new_row("gallery", "Gallery", "GalleryModule", false);
        row.insert("id".into(), json!(1));

        let module = Module::from_row(row).unwrap();
        assert_eq!(module.module_id, 1);
        assert_eq!(module.implementing_class, "GalleryModule");
        assert!(!module.active);
    }
}

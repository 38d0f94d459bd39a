//! Per-module key/value entry model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ModuleId;
use crate::database::store::Row;
use crate::error::{RegistryError, Result};

pub const MAX_KEY_LEN: usize = 16;

/// One stored `(module_id, key, value)` triple. The value is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub module_id: ModuleId,
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

impl ConfigEntry {
    pub fn new(module_id: ModuleId, key: impl Into<String>, value: Value) -> Self {
        Self {
            module_id,
            key: key.into(),
            value,
        }
    }

    /// Keys are case-sensitive, non-empty and at most [`MAX_KEY_LEN`] characters.
    pub fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(RegistryError::InvalidKey {
                key: key.to_string(),
                reason: "key must not be empty",
            });
        }
        if key.chars().count() > MAX_KEY_LEN {
            return Err(RegistryError::InvalidKey {
                key: key.to_string(),
                reason: "key exceeds 16 characters",
            });
        }
        Ok(())
    }

    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("module_id".into(), self.module_id.into());
        row.insert("key".into(), self.key.into());
        row.insert("value".into(), self.value);
        row
    }

    pub fn from_row(row: Row) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_validation() {
        assert!(ConfigEntry::validate_key("theme").is_ok());
        assert!(ConfigEntry::validate_key("exactly16chars!!").is_ok());
        assert!(matches!(
            ConfigEntry::validate_key("seventeen-chars!!"),
            Err(RegistryError::InvalidKey { .. })
        ));
        assert!(ConfigEntry::validate_key("").is_err());
    }

    #[test]
    fn test_row_ignores_store_columns() {
        let mut row = ConfigEntry::new(2, "theme", json!({ "mode": "dark" })).into_row();
        row.insert("id".into(), json!(11));

        let entry = ConfigEntry::from_row(row).unwrap();
        assert_eq!(entry.module_id, 2);
        assert_eq!(entry.value, json!({ "mode": "dark" }));
    }
}

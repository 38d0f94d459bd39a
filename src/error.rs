//! Error kinds returned by the registry and key/value store.
//!
//! Backends (row store, cache coordinator) report failures as `anyhow::Error`;
//! the components wrap them here together with the operation and the ids or
//! keys involved, so a failure can be diagnosed from the message alone.

use std::time::Duration;

use thiserror::Error;

use crate::database::ModuleId;

/// Boxed backend error kept as the `source` of wrapped failures.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// A module, or a module's key, does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("slug '{slug}' is already registered to module {existing}")]
    DuplicateSlug { slug: String, existing: ModuleId },

    #[error("class '{class}' is already registered to module {existing}")]
    DuplicateClass { class: String, existing: ModuleId },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// A module identity field is empty or too long.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("timed out after {waited:?} waiting for lock on '{namespace}'")]
    LockTimeout { namespace: String, waited: Duration },

    #[error("store failure in {operation} ({context}): {source}")]
    StoreFailure {
        operation: &'static str,
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("coordinator failure in {operation} ({context}): {source}")]
    CoordinatorFailure {
        operation: &'static str,
        context: String,
        #[source]
        source: BackendError,
    },
}

impl RegistryError {
    /// Wrap a row store error with the calling operation and its parameters.
    pub fn store(operation: &'static str, context: impl Into<String>, err: anyhow::Error) -> Self {
        Self::StoreFailure {
            operation,
            context: context.into(),
            source: err.into(),
        }
    }

    /// Wrap a cache coordinator error with the calling operation and its parameters.
    pub fn coordinator(
        operation: &'static str,
        context: impl Into<String>,
        err: anyhow::Error,
    ) -> Self {
        Self::CoordinatorFailure {
            operation,
            context: context.into(),
            source: err.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_keeps_context_and_source() {
        let err = RegistryError::store(
            "set_key",
            "module 3 key 'theme'",
            anyhow::anyhow!("connection reset"),
        );

        let message = err.to_string();
        assert!(message.contains("set_key"));
        assert!(message.contains("module 3 key 'theme'"));
        assert!(message.contains("connection reset"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(RegistryError::NotFound("module 9".into()).is_not_found());
        assert!(
            !RegistryError::InvalidKey {
                key: String::new(),
                reason: "empty"
            }
            .is_not_found()
        );
    }
}

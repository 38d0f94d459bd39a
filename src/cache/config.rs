//! Limits for the entries an in-memory coordinator keeps.

use std::time::Duration;

/// Per-namespace bounds on coordinator entries such as registry snapshots.
///
/// Namespace generations are not entries in this sense: they are kept apart
/// and never expire, whatever these limits say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: u64,
    /// Entries older than this read as absent.
    pub entry_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            entry_ttl: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    #[must_use]
    pub fn entry_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.entry_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_limits() {
        let config = CacheConfig::default()
            .max_entries(50)
            .entry_ttl(Some(Duration::from_secs(5)));
        assert_eq!(config.max_entries, 50);
        assert_eq!(config.entry_ttl, Some(Duration::from_secs(5)));
        assert_eq!(config.entry_ttl(None).entry_ttl, None);
    }
}

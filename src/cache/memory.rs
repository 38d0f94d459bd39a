//! In-memory cache coordinator.
//!
//! Entries live in per-namespace Moka caches. Generations and locks live in
//! `DashMap`s so that entry expiry and eviction never touch them. Clones
//! share state, so instances handed to several components behave like one
//! coordinator service seen from several processes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::{debug, warn};

use super::coordinator::{CacheCoordinator, GENERATION_KEY, Lock, OwnerId};
use super::{CacheConfig, NamespaceCaches};

#[derive(Clone, Debug)]
pub struct MemoryCoordinator {
    entries: NamespaceCaches,
    generations: Arc<DashMap<String, Value>>,
    locks: Arc<DashMap<String, Lock>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: NamespaceCaches::new(config),
            generations: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Current holder of a namespace lock, expired or not.
    pub fn holder(&self, namespace: &str) -> Option<OwnerId> {
        self.locks.get(namespace).map(|lock| lock.owner.clone())
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheCoordinator for MemoryCoordinator {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        if key == GENERATION_KEY {
            return Ok(self.generations.get(namespace).map(|v| v.value().clone()));
        }
        Ok(self.entries.get(namespace).and_then(|cache| cache.get(key)))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        if key == GENERATION_KEY {
            self.generations.insert(namespace.to_string(), value);
        } else {
            self.entries.get_or_create(namespace).insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        if key == GENERATION_KEY {
            self.generations.remove(namespace);
        } else if let Some(cache) = self.entries.get(namespace) {
            cache.invalidate(key);
        }
        Ok(())
    }

    async fn try_acquire(
        &self,
        namespace: &str,
        owner: &OwnerId,
        lease: Duration,
    ) -> Result<Option<Lock>> {
        let lock = Lock::new(namespace, owner, lease)?;

        match self.locks.entry(namespace.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(lock.clone());
                Ok(Some(lock))
            }
            Entry::Occupied(mut slot) => {
                if !slot.get().is_expired(Utc::now()) {
                    return Ok(None);
                }
                warn!(
                    namespace,
                    stale_owner = %slot.get().owner,
                    deadline = %slot.get().deadline,
                    "Reclaiming expired lock"
                );
                slot.insert(lock.clone());
                Ok(Some(lock))
            }
        }
    }

    async fn release_lock(&self, lock: &Lock) -> Result<()> {
        let removed = self
            .locks
            .remove_if(&lock.namespace, |_, held| held.token == lock.token);
        if removed.is_none() {
            debug!(
                "Lock on {} was already released or reclaimed from {}",
                lock.namespace, lock.owner
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::coordinator::LockOptions;
    use crate::error::RegistryError;
    use serde_json::json;

    fn options(timeout_ms: u64, lease_ms: u64) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(timeout_ms),
            lease: Duration::from_millis(lease_ms),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_entries_get_set_delete() {
        let coordinator = MemoryCoordinator::new();
        assert_eq!(coordinator.get("registry", "snapshot").await.unwrap(), None);

        coordinator
            .set("registry", "snapshot", json!({ "fully_loaded": true }))
            .await
            .unwrap();
        assert_eq!(
            coordinator.get("registry", "snapshot").await.unwrap(),
            Some(json!({ "fully_loaded": true }))
        );

        coordinator.delete("registry", "snapshot").await.unwrap();
        coordinator.delete("unknown", "snapshot").await.unwrap();
        assert_eq!(coordinator.get("registry", "snapshot").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_generations_outlive_entry_ttl() {
        let coordinator = MemoryCoordinator::with_config(
            CacheConfig::default().entry_ttl(Some(Duration::from_millis(50))),
        );
        coordinator.set("registry", GENERATION_KEY, json!("g1")).await.unwrap();
        coordinator.set("registry", "snapshot", json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(coordinator.get("registry", "snapshot").await.unwrap(), None);
        assert_eq!(
            coordinator.get("registry", GENERATION_KEY).await.unwrap(),
            Some(json!("g1"))
        );

        coordinator.delete("registry", GENERATION_KEY).await.unwrap();
        assert_eq!(coordinator.get("registry", GENERATION_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_not_reentrant() {
        let coordinator = MemoryCoordinator::new();
        let owner = OwnerId::new("worker-1");
        let lease = Duration::from_secs(30);

        let lock = coordinator
            .try_acquire("registry", &owner, lease)
            .await
            .unwrap()
            .expect("free lock");
        assert!(
            coordinator
                .try_acquire("registry", &owner, lease)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            coordinator
                .try_acquire("module-kv-1", &owner, lease)
                .await
                .unwrap()
                .is_some()
        );

        coordinator.release_lock(&lock).await.unwrap();
        assert!(coordinator.holder("registry").is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_lease_is_an_error() {
        let coordinator = MemoryCoordinator::new();
        let owner = OwnerId::new("worker-1");

        assert!(
            coordinator
                .try_acquire("registry", &owner, Duration::MAX)
                .await
                .is_err()
        );
        assert!(coordinator.holder("registry").is_none());
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let coordinator = MemoryCoordinator::new();
        let holder = OwnerId::new("holder");
        let waiter = OwnerId::new("waiter");

        let _held = coordinator
            .acquire_lock("registry", &holder, options(50, 30_000))
            .await
            .unwrap();

        let err = coordinator
            .acquire_lock("registry", &waiter, options(40, 30_000))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout { ref namespace, .. } if namespace == "registry"));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let coordinator = MemoryCoordinator::new();
        let holder = OwnerId::new("holder");
        let waiter = OwnerId::new("waiter");

        let held = coordinator
            .acquire_lock("registry", &holder, options(50, 30_000))
            .await
            .unwrap();

        let releaser = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release_lock(&held).await.unwrap();
        });

        let lock = coordinator
            .acquire_lock("registry", &waiter, options(1_000, 30_000))
            .await
            .unwrap();
        assert_eq!(lock.owner, waiter);
    }

    #[tokio::test]
    async fn test_expired_lock_of_crashed_holder_is_reclaimed() {
        let coordinator = MemoryCoordinator::new();
        let crashed = OwnerId::new("crashed");
        let survivor = OwnerId::new("survivor");

        // Never released: the holder "crashed" with a short lease.
        let stale = coordinator
            .acquire_lock("registry", &crashed, options(50, 20))
            .await
            .unwrap();

        let lock = coordinator
            .acquire_lock("registry", &survivor, options(1_000, 30_000))
            .await
            .unwrap();
        assert_eq!(coordinator.holder("registry"), Some(survivor.clone()));

        // The late release of the stale lock must not free the new holder's lock.
        coordinator.release_lock(&stale).await.unwrap();
        assert_eq!(coordinator.holder("registry"), Some(survivor));

        coordinator.release_lock(&lock).await.unwrap();
        assert!(coordinator.holder("registry").is_none());
    }
}

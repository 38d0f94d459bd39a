//! Cross-process cache coordinator contract.
//!
//! A coordinator is the only state shared between processes besides the row
//! store: namespaced key/value entries plus advisory locks. Locks carry a lease
//! deadline, so a lock left behind by a crashed holder is reclaimed once the
//! lease runs out.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};

/// Key under which each namespace publishes its invalidation generation.
/// Coordinators never expire or evict entries under this key.
pub const GENERATION_KEY: &str = "generation";

/// Identifies the process holding a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Owner id unique to this process: pid plus a random suffix.
    pub fn for_process() -> Self {
        Self(format!("{}-{}", std::process::id(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A held advisory lock.
///
/// Each acquisition gets its own token, so locks are not reentrant even for
/// the same owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub namespace: String,
    pub owner: OwnerId,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Lock {
    /// Fails if the lease cannot be represented as a deadline.
    pub fn new(namespace: &str, owner: &OwnerId, lease: Duration) -> anyhow::Result<Self> {
        let acquired_at = Utc::now();
        let deadline = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| acquired_at.checked_add_signed(lease))
            .with_context(|| format!("lock lease {lease:?} on '{namespace}' is out of range"))?;
        Ok(Self {
            namespace: namespace.to_string(),
            owner: owner.clone(),
            token: Uuid::new_v4().to_string(),
            acquired_at,
            deadline,
        })
    }

    /// Whether the lease ran out; an expired lock may be taken by anyone.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// How long to wait for a lock, how long to hold it, and how often to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl From<&RegistryConfig> for LockOptions {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            timeout: config.lock_timeout,
            lease: config.lock_lease,
            poll_interval: config.lock_poll_interval,
        }
    }
}

/// Process-wide shared cache with advisory locks, partitioned by namespace.
#[async_trait]
pub trait CacheCoordinator: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Value>>;

    async fn set(&self, namespace: &str, key: &str, value: Value) -> anyhow::Result<()>;

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()>;

    /// Take the namespace lock if it is free or its lease expired.
    /// Returns `None` when another live holder has it.
    async fn try_acquire(
        &self,
        namespace: &str,
        owner: &OwnerId,
        lease: Duration,
    ) -> anyhow::Result<Option<Lock>>;

    /// Release a lock. Releasing a lock that was already reclaimed by
    /// another owner is a no-op.
    async fn release_lock(&self, lock: &Lock) -> anyhow::Result<()>;

    /// Wait for the namespace lock, failing with [`RegistryError::LockTimeout`]
    /// once `options.timeout` elapses.
    async fn acquire_lock(
        &self,
        namespace: &str,
        owner: &OwnerId,
        options: LockOptions,
    ) -> Result<Lock> {
        let started = Instant::now();
        loop {
            match self.try_acquire(namespace, owner, options.lease).await {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => {}
                Err(e) => {
                    return Err(RegistryError::coordinator(
                        "acquire_lock",
                        format!("namespace '{namespace}', owner {owner}"),
                        e,
                    ));
                }
            }

            let waited = started.elapsed();
            if waited >= options.timeout {
                return Err(RegistryError::LockTimeout {
                    namespace: namespace.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(options.poll_interval.min(options.timeout - waited)).await;
        }
    }
}

/// A component's handle on the coordinator: its owner id, lock options and
/// namespace prefix, with backend errors mapped to [`RegistryError`].
#[derive(Clone)]
pub struct Coordination {
    coordinator: Arc<dyn CacheCoordinator>,
    owner: OwnerId,
    options: LockOptions,
    prefix: String,
}

impl Coordination {
    pub fn new(coordinator: Arc<dyn CacheCoordinator>, owner: OwnerId, config: &RegistryConfig) -> Self {
        Self {
            coordinator,
            owner,
            options: LockOptions::from(config),
            prefix: config.namespace_prefix.clone(),
        }
    }

    /// Fully qualified namespace name.
    pub fn namespace(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    pub async fn lock(&self, namespace: &str) -> Result<Lock> {
        let lock = self
            .coordinator
            .acquire_lock(namespace, &self.owner, self.options)
            .await?;
        debug!("Acquired lock on {}", namespace);
        Ok(lock)
    }

    /// Release a lock taken with [`Coordination::lock`].
    ///
    /// Failures are logged only; the lease still bounds how long the lock
    /// can block others.
    pub async fn unlock(&self, lock: Lock) {
        if let Err(e) = self.coordinator.release_lock(&lock).await {
            warn!(
                namespace = %lock.namespace,
                error = %e,
                "Failed to release lock; it will expire at {}",
                lock.deadline
            );
        }
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        self.coordinator
            .get(namespace, key)
            .await
            .map_err(|e| RegistryError::coordinator("get", format!("{namespace}/{key}"), e))
    }

    pub async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.coordinator
            .set(namespace, key, value)
            .await
            .map_err(|e| RegistryError::coordinator("set", format!("{namespace}/{key}"), e))
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.coordinator
            .delete(namespace, key)
            .await
            .map_err(|e| RegistryError::coordinator("delete", format!("{namespace}/{key}"), e))
    }

    /// Current invalidation generation of a namespace, if any was published.
    pub async fn generation(&self, namespace: &str) -> Result<Option<String>> {
        Ok(self
            .get(namespace, GENERATION_KEY)
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Publish a new generation, telling every other process to drop its
    /// local cache for the namespace. Returns the new generation.
    pub async fn bump_generation(&self, namespace: &str) -> Result<String> {
        let generation = Uuid::new_v4().to_string();
        self.set(namespace, GENERATION_KEY, Value::String(generation.clone()))
            .await?;
        debug!("Published generation {} for {}", generation, namespace);
        Ok(generation)
    }
}

impl fmt::Debug for Coordination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordination")
            .field("owner", &self.owner)
            .field("options", &self.options)
            .field("prefix", &self.prefix)
            .finish()
    }
}

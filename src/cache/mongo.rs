//! MongoDB-backed cache coordinator for multi-process deployments.
//!
//! Entries are documents keyed by `"{namespace}/{key}"` and never expire. A lock is a document
//! keyed by its namespace; it is taken with a conditional upsert that only
//! matches a missing or expired lock, so a live holder turns the upsert into a
//! duplicate-key error.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{self, Bson, DateTime as BsonDateTime, Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ReplaceOptions, UpdateOptions};
use mongodb::{Collection, Database};
use serde_json::Value;
use tracing::debug;

use super::coordinator::{CacheCoordinator, Lock, OwnerId};

const ENTRIES_COLLECTION: &str = "coordinator_entries";
const LOCKS_COLLECTION: &str = "coordinator_locks";
const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Clone)]
pub struct MongoCoordinator {
    entries: Collection<Document>,
    locks: Collection<Document>,
}

impl MongoCoordinator {
    pub fn new(db: &Database) -> Self {
        Self {
            entries: db.collection(ENTRIES_COLLECTION),
            locks: db.collection(LOCKS_COLLECTION),
        }
    }
}

fn entry_id(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

fn bson_time(time: chrono::DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(time.timestamp_millis())
}

/// Whether a write failed because the `_id` already exists.
pub(crate) fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Filter matching a lock document that may be (re)taken at `now`.
pub(crate) fn acquirable_filter(namespace: &str, now: BsonDateTime) -> Document {
    doc! { "_id": namespace, "deadline": { "$lte": now } }
}

#[async_trait]
impl CacheCoordinator for MongoCoordinator {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let document = self
            .entries
            .find_one(doc! { "_id": entry_id(namespace, key) })
            .await?;

        Ok(document
            .and_then(|d| d.get("value").cloned())
            .map(Bson::into_relaxed_extjson))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let document = doc! {
            "_id": entry_id(namespace, key),
            "namespace": namespace,
            "key": key,
            "value": bson::to_bson(&value)?,
        };

        let options = ReplaceOptions::builder().upsert(true).build();
        self.entries
            .replace_one(doc! { "_id": entry_id(namespace, key) }, document)
            .with_options(options)
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.entries
            .delete_one(doc! { "_id": entry_id(namespace, key) })
            .await?;
        Ok(())
    }

    async fn try_acquire(
        &self,
        namespace: &str,
        owner: &OwnerId,
        lease: Duration,
    ) -> Result<Option<Lock>> {
        let lock = Lock::new(namespace, owner, lease)?;
        let update = doc! {
            "$set": {
                "owner": owner.as_str(),
                "token": lock.token.as_str(),
                "acquired_at": bson_time(lock.acquired_at),
                "deadline": bson_time(lock.deadline),
            }
        };
        let options = UpdateOptions::builder().upsert(true).build();

        let result = self
            .locks
            .update_one(acquirable_filter(namespace, bson_time(lock.acquired_at)), update)
            .with_options(options)
            .await;

        match result {
            Ok(outcome) => {
                if outcome.matched_count > 0 {
                    debug!("Took over expired lock on {}", namespace);
                }
                Ok(Some(lock))
            }
            Err(e) if is_duplicate_key(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_lock(&self, lock: &Lock) -> Result<()> {
        let result = self
            .locks
            .delete_one(doc! { "_id": lock.namespace.as_str(), "token": lock.token.as_str() })
            .await?;
        if result.deleted_count == 0 {
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

    #[test]
    fn test_entry_ids_are_namespaced() {
        assert_eq!(entry_id("modreg:registry", "snapshot"), "modreg:registry/snapshot");
    }

    #[test]
    fn test_acquirable_filter_matches_expired_only() {
        let now = BsonDateTime::from_millis(1_700_000_000_000);
        let filter = acquirable_filter("modreg:registry", now);

        assert_eq!(filter.get_str("_id").unwrap(), "modreg:registry");
        let deadline = filter.get_document("deadline").unwrap();
        assert_eq!(deadline.get_datetime("$lte").unwrap(), &now);
    }
}

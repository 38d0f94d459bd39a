//! In-process row store.
//!
//! Backs tests and single-process deployments. Clones share the same tables,
//! so several component instances can stand in for separate processes that
//! talk to one database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::store::{Filter, ID_COLUMN, Row, RowId, RowStore};

#[derive(Default)]
struct Table {
    /// Last id handed out; survives deletes so ids are never reused.
    last_id: RowId,
    rows: BTreeMap<RowId, Row>,
}

impl Table {
    fn push(&mut self, mut row: Row) -> RowId {
        self.last_id += 1;
        let id = self.last_id;
        row.insert(ID_COLUMN.to_string(), Value::from(id));
        self.rows.insert(id, row);
        id
    }
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    selects: AtomicU64,
    deletes: AtomicU64,
    upserts: AtomicU64,
}

/// Number of calls each store operation has received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub inserts: u64,
    pub selects: u64,
    pub deletes: u64,
    pub upserts: u64,
}

#[derive(Default)]
struct Inner {
    tables: RwLock<HashMap<String, Table>>,
    counters: Counters,
    unavailable: AtomicBool,
}

/// Shared in-memory implementation of [`RowStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call counts since creation, shared by all clones.
    pub fn stats(&self) -> StoreStats {
        let c = &self.inner.counters;
        StoreStats {
            inserts: c.inserts.load(Ordering::Relaxed),
            selects: c.selects.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            upserts: c.upserts.load(Ordering::Relaxed),
        }
    }

    /// Number of rows currently in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Make every subsequent call fail until switched back.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Relaxed);
    }

    fn check_available(&self, operation: &str, table: &str) -> Result<()> {
        if self.inner.unavailable.load(Ordering::Relaxed) {
            bail!("memory store unavailable for {operation} on '{table}'");
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<RowId>> {
        self.inner.counters.inserts.fetch_add(1, Ordering::Relaxed);
        self.check_available("insert", table)?;

        let mut tables = self.inner.tables.write();
        let t = tables.entry(table.to_string()).or_default();
        let ids: Vec<RowId> = rows.into_iter().map(|row| t.push(row)).collect();

        debug!("Inserted {} row(s) into {}", ids.len(), table);
        Ok(ids)
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        self.inner.counters.selects.fetch_add(1, Ordering::Relaxed);
        self.check_available("select", table)?;

        let tables = self.inner.tables.read();
        let rows = tables
            .get(table)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|row| filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64> {
        self.inner.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_available("delete", table)?;

        let mut tables = self.inner.tables.write();
        let Some(t) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = t.rows.len();
        t.rows.retain(|_, row| !filter.matches(row));
        let removed = (before - t.rows.len()) as u64;

        debug!("Deleted {} row(s) from {} where {}", removed, table, filter);
        Ok(removed)
    }

    async fn upsert(&self, table: &str, filter: &Filter, row: Row) -> Result<()> {
        self.inner.counters.upserts.fetch_add(1, Ordering::Relaxed);
        self.check_available("upsert", table)?;

        let mut tables = self.inner.tables.write();
        let t = tables.entry(table.to_string()).or_default();

        let mut matched = false;
        for existing in t.rows.values_mut().filter(|r| filter.matches(r)) {
            matched = true;
            for (column, value) in &row {
                if column != ID_COLUMN {
                    existing.insert(column.clone(), value.clone());
                }
            }
        }

        if !matched {
            t.push(row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_ids_are_never_reused() {
        let store = MemoryStore::new();
        let ids = store
            .insert("modules", vec![row(json!({ "slug": "a" })), row(json!({ "slug": "b" }))])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);

        store.delete("modules", &Filter::all()).await.unwrap();
        let ids = store
            .insert("modules", vec![row(json!({ "slug": "a" }))])
            .await
            .unwrap();
        assert_eq!(ids, vec![3]);
    }

    #[tokio::test]
    async fn test_select_and_delete_respect_filter() {
        let store = MemoryStore::new();
        store
            .insert(
                "module_config",
                vec![
                    row(json!({ "module_id": 1, "key": "theme", "value": "dark" })),
                    row(json!({ "module_id": 1, "key": "size", "value": 3 })),
                    row(json!({ "module_id": 2, "key": "theme", "value": "light" })),
                ],
            )
            .await
            .unwrap();

        let rows = store
            .select("module_config", &Filter::eq("module_id", 1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.contains_key(ID_COLUMN)));

        let removed = store
            .delete("module_config", &Filter::eq("key", "theme"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.row_count("module_config"), 1);
        assert_eq!(store.delete("missing", &Filter::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_or_inserts() {
        let store = MemoryStore::new();
        let filter = Filter::eq("module_id", 1).and_eq("key", "theme");

        store
            .upsert("module_config", &filter, row(json!({ "module_id": 1, "key": "theme", "value": "dark" })))
            .await
            .unwrap();
        store
            .upsert("module_config", &filter, row(json!({ "module_id": 1, "key": "theme", "value": "light" })))
            .await
            .unwrap();

        let rows = store.select("module_config", &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["value"], json!("light"));
        assert_eq!(rows[0][ID_COLUMN], json!(1));
    }

    #[tokio::test]
    async fn test_stats_and_availability() {
        let store = MemoryStore::new();
        let clone = store.clone();

        clone.select("modules", &Filter::all()).await.unwrap();
        store.set_available(false);
        assert!(clone.select("modules", &Filter::all()).await.is_err());
        store.set_available(true);

        let stats = store.stats();
        assert_eq!(stats.selects, 2);
        assert_eq!(stats.inserts, 0);
    }
}

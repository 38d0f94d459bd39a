//! MongoDB row store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOptions, ReturnDocument,
};
use mongodb::{Client, Collection, IndexModel};
use serde_json::Value;
use tracing::{debug, info};

use super::store::{Condition, Filter, ID_COLUMN, Row, RowId, RowStore};

/// Collection holding one id sequence per table.
const COUNTERS_COLLECTION: &str = "counters";

/// [`RowStore`] backed by one MongoDB collection per table.
#[derive(Debug, Clone)]
pub struct MongoStore {
    db: mongodb::Database,
}

impl MongoStore {
    /// Connect to MongoDB with the given URI and database name.
    ///
    /// # Errors
    /// Returns error if connection or the initial ping fails.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;

        // Ping the database to verify connection
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;

        info!("Successfully connected to MongoDB");

        let db = client.database(db_name);

        Ok(Self { db })
    }

    /// Database handle, shared with [`crate::cache::MongoCoordinator`].
    pub fn database(&self) -> &mongodb::Database {
        &self.db
    }

    fn table(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }

    /// Create non-unique lookup indexes for the given columns of `table`.
    ///
    /// Uniqueness of slugs and classes is enforced by the registry under its
    /// lock, not by the database.
    pub async fn ensure_indexes(&self, table: &str, columns: &[&str]) -> Result<()> {
        let models: Vec<IndexModel> = columns
            .iter()
            .map(|column| {
                let mut keys = Document::new();
                keys.insert(*column, 1);
                IndexModel::builder().keys(keys).build()
            })
            .collect();

        if !models.is_empty() {
            self.table(table).create_indexes(models).await?;
            debug!("Ensured indexes on {} for {:?}", table, columns);
        }
        Ok(())
    }

    /// Reserve `count` consecutive ids for `table`.
    async fn reserve_ids(&self, table: &str, count: usize) -> Result<Vec<RowId>> {
        let counters: Collection<Document> = self.db.collection(COUNTERS_COLLECTION);
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let updated = counters
            .find_one_and_update(doc! { "_id": table }, doc! { "$inc": { "seq": count as i64 } })
            .with_options(options)
            .await?
            .context("counter upsert returned no document")?;

        let last = updated.get_i64("seq")?;
        let first = last - count as i64 + 1;
        Ok((first..=last).collect())
    }
}

/// Translate a [`Filter`] into a MongoDB query document.
pub(crate) fn filter_document(filter: &Filter) -> Result<Document> {
    let mut query = Document::new();
    for (column, condition) in filter.conditions() {
        let clause = match condition {
            Condition::Eq(value) => bson::to_bson(value)?,
            Condition::In(values) => Bson::Document(doc! { "$in": bson::to_bson(values)? }),
        };
        query.insert(column.clone(), clause);
    }
    Ok(query)
}

/// Convert a stored document back into a [`Row`].
pub(crate) fn document_row(document: Document) -> Row {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(row) => row,
        _ => Row::new(),
    }
}

#[async_trait]
impl RowStore for MongoStore {
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<RowId>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self.reserve_ids(table, rows.len()).await?;
        let mut documents = Vec::with_capacity(rows.len());
        for (mut row, id) in rows.into_iter().zip(&ids) {
            row.insert(ID_COLUMN.to_string(), Value::from(*id));
            documents.push(bson::to_document(&row)?);
        }

        self.table(table).insert_many(documents).await?;
        debug!("Inserted {} row(s) into {}", ids.len(), table);
        Ok(ids)
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        let mut sort = Document::new();
        sort.insert(ID_COLUMN, 1);
        let options = FindOptions::builder()
            .projection(doc! { "_id": 0 })
            .sort(sort)
            .build();

        let mut cursor = self
            .table(table)
            .find(filter_document(filter)?)
            .with_options(options)
            .await?;

        let mut rows = Vec::new();
        while let Some(result) = cursor.next().await {
            rows.push(document_row(result?));
        }

        debug!("DB select on {} where {}: {} row(s)", table, filter, rows.len());
        Ok(rows)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64> {
        let result = self
            .table(table)
            .delete_many(filter_document(filter)?)
            .await?;

        debug!("Deleted {} row(s) from {} where {}", result.deleted_count, table, filter);
        Ok(result.deleted_count)
    }

    async fn upsert(&self, table: &str, filter: &Filter, mut row: Row) -> Result<()> {
        row.remove(ID_COLUMN);
        let update = doc! { "$set": bson::to_document(&row)? };

        let result = self
            .table(table)
            .update_many(filter_document(filter)?, update)
            .await?;

        if result.matched_count == 0 {
            self.insert(table, vec![row]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_document_translation() {
        let filter = Filter::eq("module_id", 7).and_in("key", ["theme", "layout"]);
        let query = filter_document(&filter).unwrap();

        assert_eq!(query.get_i64("module_id").unwrap(), 7);
        let keys = query.get_document("key").unwrap();
        let options = keys.get_array("$in").unwrap();
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].as_str(), Some("theme"));

        assert!(filter_document(&Filter::all()).unwrap().is_empty());
    }

    #[test]
    fn test_document_row_conversion() {
        let document = doc! {
            "id": 3_i64,
            "module_id": 1_i64,
            "key": "theme",
            "value": { "mode": "dark", "sizes": [1, 2] },
        };

        let row = document_row(document);
        assert_eq!(row["id"], json!(3));
        assert_eq!(row["key"], json!("theme"));
        assert_eq!(row["value"], json!({ "mode": "dark", "sizes": [1, 2] }));
    }
}

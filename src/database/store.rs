//! Row store contract consumed by the registry and the key/value store.
//!
//! Rows are flat JSON objects. The store owns durability and id assignment;
//! callers only filter on plain column equality or membership.

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// A stored row, column name to value.
pub type Row = Map<String, Value>;

/// Store-assigned row identifier.
pub type RowId = i64;

/// Column the store fills with the assigned [`RowId`] on insert.
pub const ID_COLUMN: &str = "id";

/// Condition on a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
}

impl Condition {
    fn matches(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (Condition::Eq(expected), Some(actual)) => expected == actual,
            (Condition::In(options), Some(actual)) => options.contains(actual),
            (_, None) => false,
        }
    }
}

/// Conjunction of column conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    /// Filter matching every row of a table.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::all().and_eq(column, value)
    }

    #[must_use]
    pub fn and_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((column.to_string(), Condition::Eq(value.into())));
        self
    }

    #[must_use]
    pub fn and_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions
            .push((column.to_string(), Condition::In(values)));
        self
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    pub fn is_all(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate the filter against a row held in memory.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions
            .iter()
            .all(|(column, condition)| condition.matches(row.get(column)))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return f.write_str("*");
        }
        for (i, (column, condition)) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            match condition {
                Condition::Eq(value) => write!(f, "{column} = {value}")?,
                Condition::In(values) => {
                    write!(f, "{column} in {}", Value::Array(values.clone()))?
                }
            }
        }
        Ok(())
    }
}

/// Durable row storage.
///
/// Implementations must be safe to share between tasks and must never reuse
/// an id within a table, even after the row holding it was deleted.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert rows, assigning each a fresh id in [`ID_COLUMN`].
    /// Returns the ids in the order of `rows`.
    async fn insert(&self, table: &str, rows: Vec<Row>) -> anyhow::Result<Vec<RowId>>;

    /// Load every row matching `filter`.
    async fn select(&self, table: &str, filter: &Filter) -> anyhow::Result<Vec<Row>>;

    /// Delete every row matching `filter`, returning how many were removed.
    async fn delete(&self, table: &str, filter: &Filter) -> anyhow::Result<u64>;

    /// Overwrite the columns of `row` on every row matching `filter`, or
    /// insert `row` as a new row when nothing matches.
    async fn upsert(&self, table: &str, filter: &Filter, row: Row) -> anyhow::Result<()>;
}

//! In-memory storage for testing and development
//!
//! Committed rows live behind a shared `RwLock`. Each transaction keeps its
//! own overlay of pending writes and reads through it, so uncommitted writes
//! are visible only to the transaction that made them. Uniqueness is checked
//! when a write is made and again, under the write lock, at commit.

use super::{Row, Storage, StoreError, Transaction};
use crate::core::entity::TableSchema;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Table {
    rows: BTreeMap<i64, Row>,
    last_id: i64,
}

type Tables = HashMap<String, Table>;

/// In-memory storage implementation
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStorage {
    /// Create a new, empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of a table, in primary-key order
    pub fn committed_rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;

        Ok(tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            tables: self.tables.clone(),
            pending: HashMap::new(),
        }))
    }
}

struct PendingTable {
    schema: TableSchema,
    writes: BTreeMap<i64, Option<Row>>,
}

/// A transaction over [`InMemoryStorage`]
pub struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    pending: HashMap<String, PendingTable>,
}

impl InMemoryTransaction {
    /// Committed rows merged with this transaction's pending writes
    fn view(&self, schema: &TableSchema) -> Result<BTreeMap<i64, Row>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;

        let mut rows = tables
            .get(schema.name)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        if let Some(pending) = self.pending.get(schema.name) {
            overlay(&mut rows, &pending.writes);
        }
        Ok(rows)
    }

    fn stage(&mut self, schema: &TableSchema, pk: i64, row: Option<Row>) {
        self.pending
            .entry(schema.name.to_string())
            .or_insert_with(|| PendingTable {
                schema: schema.clone(),
                writes: BTreeMap::new(),
            })
            .writes
            .insert(pk, row);
    }

    fn next_id(&self, schema: &TableSchema) -> Result<i64, StoreError> {
        // Ids come from a shared sequence and are not reused after a rollback.
        let mut tables = self
            .tables
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;

        let table = tables.entry(schema.name.to_string()).or_default();
        table.last_id += 1;
        Ok(table.last_id)
    }
}

fn overlay(rows: &mut BTreeMap<i64, Row>, writes: &BTreeMap<i64, Option<Row>>) {
    for (pk, write) in writes {
        match write {
            Some(row) => {
                rows.insert(*pk, row.clone());
            }
            None => {
                rows.remove(pk);
            }
        }
    }
}

/// Fails when another row in `rows` holds the same value in a unique column
fn check_unique(
    schema: &TableSchema,
    rows: &BTreeMap<i64, Row>,
    pk: i64,
    row: &Row,
) -> Result<(), StoreError> {
    for column in schema.unique_columns() {
        let value = match row.get(column) {
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };
        let taken = rows
            .iter()
            .any(|(other_pk, other)| *other_pk != pk && other.get(column) == Some(value));
        if taken {
            return Err(StoreError::UniqueViolation {
                table: schema.name.to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn insert(&mut self, schema: &TableSchema, mut row: Row) -> Result<i64, StoreError> {
        let view = self.view(schema)?;
        check_unique(schema, &view, 0, &row)?;

        let pk = self.next_id(schema)?;
        row.insert("id".to_string(), Value::from(pk));
        self.stage(schema, pk, Some(row));
        Ok(pk)
    }

    async fn update(
        &mut self,
        schema: &TableSchema,
        pk: i64,
        mut row: Row,
    ) -> Result<(), StoreError> {
        let view = self.view(schema)?;
        if !view.contains_key(&pk) {
            return Err(StoreError::MissingRow {
                table: schema.name.to_string(),
                pk,
            });
        }
        row.insert("id".to_string(), Value::from(pk));
        check_unique(schema, &view, pk, &row)?;

        self.stage(schema, pk, Some(row));
        Ok(())
    }

    async fn remove(&mut self, schema: &TableSchema, pk: i64) -> Result<(), StoreError> {
        if !self.view(schema)?.contains_key(&pk) {
            return Err(StoreError::MissingRow {
                table: schema.name.to_string(),
                pk,
            });
        }
        self.stage(schema, pk, None);
        Ok(())
    }

    async fn get(&self, schema: &TableSchema, pk: i64) -> Result<Option<Row>, StoreError> {
        if let Some(write) = self
            .pending
            .get(schema.name)
            .and_then(|pending| pending.writes.get(&pk))
        {
            return Ok(write.clone());
        }

        let tables = self
            .tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        Ok(tables
            .get(schema.name)
            .and_then(|t| t.rows.get(&pk))
            .cloned())
    }

    async fn scan(&self, schema: &TableSchema) -> Result<Vec<Row>, StoreError> {
        Ok(self.view(schema)?.into_values().collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction {
            tables: shared,
            pending: staged,
        } = *self;
        let mut tables = shared
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;

        // Validate everything before applying anything.
        for (name, pending) in &staged {
            let mut merged = tables
                .get(name)
                .map(|t| t.rows.clone())
                .unwrap_or_default();
            overlay(&mut merged, &pending.writes);
            for (pk, write) in &pending.writes {
                if let Some(row) = write {
                    check_unique(&pending.schema, &merged, *pk, row)?;
                }
            }
        }

        for (name, pending) in staged {
            let table = tables.entry(name).or_default();
            overlay(&mut table.rows, &pending.writes);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ITEMS: TableSchema = TableSchema::new("items").unique(&["name"]);

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();

        let first = tx.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();
        let second = tx.insert(&ITEMS, row(json!({ "name": "b" }))).await.unwrap();

        assert_eq!((first, second), (1, 2));
        let stored = tx.get(&ITEMS, 2).await.unwrap().unwrap();
        assert_eq!(stored["id"], json!(2));
    }

    #[tokio::test]
    async fn test_pending_writes_are_private_until_commit() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();
        tx.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();

        let other = storage.begin().await.unwrap();
        assert!(other.scan(&ITEMS).await.unwrap().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(other.scan(&ITEMS).await.unwrap().len(), 1);
        assert_eq!(storage.committed_rows("items").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unique_violation_is_reported() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();
        tx.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();

        let err = tx
            .insert(&ITEMS, row(json!({ "name": "a" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { ref column, .. } if column == "name"));
    }

    #[tokio::test]
    async fn test_commit_rechecks_uniqueness() {
        let storage = InMemoryStorage::new();
        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();
        first.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();
        second.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(StoreError::UniqueViolation { .. })
        ));
        assert_eq!(storage.committed_rows("items").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_and_stays_usable() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();
        tx.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(tx.scan(&ITEMS).await.unwrap().is_empty());

        tx.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(storage.committed_rows("items").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_update_missing_rows() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();
        let pk = tx.insert(&ITEMS, row(json!({ "name": "a" }))).await.unwrap();

        tx.remove(&ITEMS, pk).await.unwrap();
        assert!(tx.get(&ITEMS, pk).await.unwrap().is_none());
        assert!(matches!(
            tx.update(&ITEMS, pk, row(json!({ "name": "b" }))).await,
            Err(StoreError::MissingRow { .. })
        ));
        assert!(matches!(
            tx.remove(&ITEMS, 99).await,
            Err(StoreError::MissingRow { .. })
        ));
    }
}

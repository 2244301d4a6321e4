//! PostgreSQL storage backend using sqlx.
//!
//! Every entity gets its own table with a `BIGSERIAL` key and a JSONB `data`
//! column holding the rest of the row. Unique columns are enforced by
//! expression indexes on `data`, so violations come from the database itself
//! and surface as [`StoreError::UniqueViolation`].
//!
//! # Feature flag
//!
//! This module is gated behind the `postgres` feature flag:
//! ```toml
//! [dependencies]
//! crudkit-rs = { version = "0.1", features = ["postgres"] }
//! ```

use super::{Row, Storage, StoreError, Transaction};
use crate::core::entity::TableSchema;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// SQLSTATE for `unique_violation`
const UNIQUE_VIOLATION: &str = "23505";

const SAVEPOINT: &str = "SAVEPOINT crudkit_write";
const RELEASE: &str = "RELEASE SAVEPOINT crudkit_write";
const ROLLBACK_TO: &str = "ROLLBACK TO SAVEPOINT crudkit_write";

/// Row storage backed by PostgreSQL.
///
/// Tables and their unique indexes are created on first use.
/// Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct PostgresStorage {
    pool: PgPool,
    created: Arc<Mutex<HashSet<&'static str>>>,
}

impl PostgresStorage {
    /// Create a new `PostgresStorage` with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            created: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Connect to `url` with a pool of at most `max_connections`
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(backend)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table of `schema` and its unique indexes if missing
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let known = self
            .created
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?
            .contains(schema.name);
        if known {
            return Ok(());
        }

        let table = quote_ident(schema.name);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, data JSONB NOT NULL)",
            table
        ))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        for column in schema.unique_columns() {
            sqlx::query(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ((data->>{}))",
                quote_ident(&index_name(schema.name, column)),
                table,
                quote_literal(column)
            ))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        }

        tracing::debug!(table = schema.name, "Ensured storage table");
        self.created
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?
            .insert(schema.name);
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PostgresTransaction {
            storage: self.clone(),
            tx: tokio::sync::Mutex::new(Some(tx)),
        }))
    }
}

/// A transaction over [`PostgresStorage`]
///
/// Each write runs under a savepoint, so a rejected write leaves the
/// transaction usable.
pub struct PostgresTransaction {
    storage: PostgresStorage,
    tx: tokio::sync::Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

impl PostgresTransaction {
    fn closed() -> StoreError {
        StoreError::Backend("transaction already finished".to_string())
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn insert(&mut self, schema: &TableSchema, mut row: Row) -> Result<i64, StoreError> {
        self.storage.ensure_table(schema).await?;
        row.remove("id");

        let tx = self.tx.get_mut().as_mut().ok_or_else(Self::closed)?;
        let conn: &mut PgConnection = tx;
        write_begin(conn).await?;
        let result = sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO {} (data) VALUES ($1) RETURNING id",
            quote_ident(schema.name)
        ))
        .bind(Json(Value::Object(row)))
        .fetch_one(&mut *conn)
        .await;
        write_end(conn, schema, result).await
    }

    async fn update(&mut self, schema: &TableSchema, pk: i64, mut row: Row) -> Result<(), StoreError> {
        self.storage.ensure_table(schema).await?;
        row.remove("id");

        let tx = self.tx.get_mut().as_mut().ok_or_else(Self::closed)?;
        let conn: &mut PgConnection = tx;
        write_begin(conn).await?;
        let result = sqlx::query(&format!(
            "UPDATE {} SET data = $1 WHERE id = $2",
            quote_ident(schema.name)
        ))
        .bind(Json(Value::Object(row)))
        .bind(pk)
        .execute(&mut *conn)
        .await;

        if write_end(conn, schema, result).await?.rows_affected() == 0 {
            return Err(StoreError::MissingRow {
                table: schema.name.to_string(),
                pk,
            });
        }
        Ok(())
    }

    async fn remove(&mut self, schema: &TableSchema, pk: i64) -> Result<(), StoreError> {
        self.storage.ensure_table(schema).await?;

        let tx = self.tx.get_mut().as_mut().ok_or_else(Self::closed)?;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", quote_ident(schema.name)))
            .bind(pk)
            .execute(&mut **tx)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRow {
                table: schema.name.to_string(),
                pk,
            });
        }
        Ok(())
    }

    async fn get(&self, schema: &TableSchema, pk: i64) -> Result<Option<Row>, StoreError> {
        self.storage.ensure_table(schema).await?;

        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        let found = sqlx::query_as::<_, (i64, Json<Value>)>(&format!(
            "SELECT id, data FROM {} WHERE id = $1",
            quote_ident(schema.name)
        ))
        .bind(pk)
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend)?;

        found.map(|(id, Json(data))| into_row(id, data)).transpose()
    }

    async fn scan(&self, schema: &TableSchema) -> Result<Vec<Row>, StoreError> {
        self.storage.ensure_table(schema).await?;

        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        let rows = sqlx::query_as::<_, (i64, Json<Value>)>(&format!(
            "SELECT id, data FROM {} ORDER BY id",
            quote_ident(schema.name)
        ))
        .fetch_all(&mut **tx)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|(id, Json(data))| into_row(id, data))
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PostgresTransaction { tx, .. } = *self;
        match tx.into_inner() {
            Some(tx) => tx.commit().await.map_err(backend),
            None => Err(Self::closed()),
        }
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.get_mut().take() {
            tx.rollback().await.map_err(backend)?;
        }
        let fresh = self.storage.pool.begin().await.map_err(backend)?;
        *self.tx.get_mut() = Some(fresh);
        Ok(())
    }
}

async fn write_begin(conn: &mut PgConnection) -> Result<(), StoreError> {
    sqlx::query(SAVEPOINT).execute(conn).await.map_err(backend)?;
    Ok(())
}

/// Release the savepoint after a successful write, or return to it
async fn write_end<T>(
    conn: &mut PgConnection,
    schema: &TableSchema,
    result: Result<T, sqlx::Error>,
) -> Result<T, StoreError> {
    let statement = if result.is_ok() { RELEASE } else { ROLLBACK_TO };
    sqlx::query(statement).execute(conn).await.map_err(backend)?;
    result.map_err(|e| map_write_error(schema, e))
}

fn map_write_error(schema: &TableSchema, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            let columns = schema.unique_columns();
            let column = db_err
                .constraint()
                .and_then(|constraint| {
                    columns
                        .iter()
                        .find(|column| index_name(schema.name, column) == constraint)
                })
                .or_else(|| columns.first())
                .map(|column| column.to_string())
                .unwrap_or_else(|| "id".to_string());
            return StoreError::UniqueViolation {
                table: schema.name.to_string(),
                column,
            };
        }
    }
    backend(err)
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn into_row(id: i64, data: Value) -> Result<Row, StoreError> {
    match data {
        Value::Object(mut row) => {
            row.insert("id".to_string(), Value::from(id));
            Ok(row)
        }
        other => Err(StoreError::Backend(format!(
            "row {} holds non-object data: {}",
            id, other
        ))),
    }
}

fn index_name(table: &str, column: &str) -> String {
    format!("{}_{}_key", table, column)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

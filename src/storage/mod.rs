//! Transactional row storage
//!
//! The repository layer talks to storage through two traits: [`Storage`]
//! opens transactions and [`Transaction`] reads and writes JSON rows inside
//! one. Writes are visible to the transaction that made them immediately
//! (so generated keys and constraint violations surface at once) and to
//! everyone else only after [`Transaction::commit`].

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::{InMemoryStorage, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresStorage, PostgresTransaction};

use crate::core::entity::TableSchema;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A stored row: column name → JSON value
pub type Row = Map<String, Value>;

/// Errors raised by storage backends
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}.{column}")]
    UniqueViolation { table: String, column: String },

    #[error("row {pk} not found in {table}")]
    MissingRow { table: String, pk: i64 },

    #[error("storage lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("{0}")]
    Backend(String),
}

/// A backend able to open transactions
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a new transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// One open transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Insert a row and return the primary key assigned to it.
    ///
    /// The key is written into the row's `id` column.
    async fn insert(&mut self, schema: &TableSchema, row: Row) -> Result<i64, StoreError>;

    /// Replace the row stored under `pk`
    async fn update(&mut self, schema: &TableSchema, pk: i64, row: Row)
    -> Result<(), StoreError>;

    /// Remove the row stored under `pk`
    async fn remove(&mut self, schema: &TableSchema, pk: i64) -> Result<(), StoreError>;

    async fn get(&self, schema: &TableSchema, pk: i64) -> Result<Option<Row>, StoreError>;

    /// All rows of a table in primary-key order
    async fn scan(&self, schema: &TableSchema) -> Result<Vec<Row>, StoreError>;

    /// Make every pending write visible and end the transaction
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every pending write. The transaction stays open.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

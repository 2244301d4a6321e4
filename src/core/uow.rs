//! Unit of work
//!
//! One [`UnitOfWork`] wraps one storage transaction for the lifetime of a
//! request. Repositories and services receive it by `&mut` and only write
//! through it; the outermost boundary (the route pipeline) decides whether it
//! commits. Dropping a unit of work without committing discards its writes.

use super::error::CrudError;
use crate::storage::{Storage, StoreError, Transaction};

/// Message used for every uniqueness failure surfaced to clients
pub const DUPLICATE_MESSAGE: &str = "Duplicate key or unique constraint violated.";

pub struct UnitOfWork {
    tx: Option<Box<dyn Transaction>>,
    actor: Option<String>,
}

impl UnitOfWork {
    /// Open a unit of work on a fresh transaction
    pub async fn begin(storage: &dyn Storage) -> Result<Self, CrudError> {
        let tx = storage.begin().await.map_err(translate)?;
        Ok(Self::from_transaction(tx))
    }

    pub fn from_transaction(tx: Box<dyn Transaction>) -> Self {
        Self {
            tx: Some(tx),
            actor: None,
        }
    }

    /// Identity on whose behalf writes are made (the token subject)
    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn set_actor(&mut self, actor: impl Into<String>) {
        self.actor = Some(actor.into());
    }

    /// Whether `commit` already ran
    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }

    pub fn transaction(&self) -> Result<&(dyn Transaction + 'static), CrudError> {
        self.tx.as_deref().ok_or_else(finished)
    }

    pub fn transaction_mut(&mut self) -> Result<&mut (dyn Transaction + 'static), CrudError> {
        self.tx.as_deref_mut().ok_or_else(finished)
    }

    /// Commit every write made through this unit of work.
    ///
    /// A unit of work commits at most once; later use fails.
    pub async fn commit(&mut self) -> Result<(), CrudError> {
        let tx = self.tx.take().ok_or_else(finished)?;
        tx.commit().await.map_err(|err| {
            tracing::warn!(error = %err, "Commit failed, transaction discarded");
            translate(err)
        })
    }

    /// Discard pending writes. The unit of work stays usable.
    pub async fn rollback(&mut self) -> Result<(), CrudError> {
        match self.tx.as_deref_mut() {
            Some(tx) => tx.rollback().await.map_err(translate),
            None => Ok(()),
        }
    }
}

fn finished() -> CrudError {
    CrudError::Internal("unit of work already committed".to_string())
}

/// Map a storage failure onto the domain error taxonomy
pub fn translate(err: StoreError) -> CrudError {
    match err {
        StoreError::UniqueViolation { .. } => CrudError::DuplicateEntry(DUPLICATE_MESSAGE.to_string()),
        other => CrudError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::TableSchema;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    const NOTES: TableSchema = TableSchema::new("notes");

    #[tokio::test]
    async fn test_commit_happens_once() {
        let storage = InMemoryStorage::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let row = json!({ "body": "hi" }).as_object().cloned().unwrap();
        uow.transaction_mut()
            .unwrap()
            .insert(&NOTES, row)
            .await
            .unwrap();

        uow.commit().await.unwrap();
        assert!(uow.is_finished());
        assert!(matches!(uow.commit().await, Err(CrudError::Internal(_))));
        assert_eq!(storage.committed_rows("notes").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_without_commit_discards() {
        let storage = InMemoryStorage::new();
        {
            let mut uow = UnitOfWork::begin(&storage).await.unwrap();
            let row = json!({ "body": "hi" }).as_object().cloned().unwrap();
            uow.transaction_mut()
                .unwrap()
                .insert(&NOTES, row)
                .await
                .unwrap();
        }
        assert!(storage.committed_rows("notes").unwrap().is_empty());
    }

    #[test]
    fn test_translate_unique_violation() {
        let err = translate(StoreError::UniqueViolation {
            table: "notes".into(),
            column: "body".into(),
        });
        assert!(matches!(err, CrudError::DuplicateEntry(ref m) if m == DUPLICATE_MESSAGE));
        assert!(matches!(
            translate(StoreError::Backend("boom".into())),
            CrudError::Storage(_)
        ));
    }
}

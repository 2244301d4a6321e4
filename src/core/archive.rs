//! Archival store for permanently deleted rows
//!
//! Force-deleting a row first copies every column into an [`ArchivedRecord`]
//! keyed by the origin table and primary key. Archived records are only ever
//! appended.

use super::entity::Entity;
use super::error::CrudError;
use super::filter::FilterMap;
use super::repository::Repository;
use super::uow::UnitOfWork;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Snapshot of a force-deleted row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedRecord {
    pub id: i64,
    pub original_table: String,
    pub original_pk: String,
    pub data: Value,
    pub archived_at: DateTime<Utc>,
}

crate::impl_model!(
    ArchivedRecord,
    table = "archived_records",
    fields = {
        original_table: String,
        original_pk: String,
        archived_at: DateTime<Utc>,
    },
);

/// Append a snapshot of `entity` to the archive
pub async fn archive<M: Entity>(
    uow: &mut UnitOfWork,
    entity: &M,
) -> Result<ArchivedRecord, CrudError> {
    let snapshot = serde_json::to_value(entity)
        .map_err(|e| CrudError::Internal(format!("cannot snapshot {}: {}", M::entity_name(), e)))?;

    let mut data = Map::new();
    data.insert("original_table".into(), json!(M::schema().name));
    data.insert("original_pk".into(), json!(entity.id().to_string()));
    data.insert("data".into(), snapshot);
    data.insert("archived_at".into(), json!(Utc::now()));

    let record = Repository::<ArchivedRecord>::new().create(uow, data).await?;
    tracing::info!(
        table = M::schema().name,
        pk = entity.id(),
        archive_id = record.id,
        "Archived row before permanent deletion"
    );
    Ok(record)
}

/// Every archived snapshot of one origin row, oldest first
pub async fn archived_rows(
    uow: &mut UnitOfWork,
    table: &str,
    pk: i64,
) -> Result<Vec<ArchivedRecord>, CrudError> {
    let mut filters = FilterMap::new();
    filters.insert("original_table".into(), json!(table));
    filters.insert("original_pk".into(), json!(pk.to_string()));

    Repository::<ArchivedRecord>::new()
        .find_all_by(uow, &filters, Default::default())
        .await
}

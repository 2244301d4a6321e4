//! Generic repository over one entity type
//!
//! The repository is the only writer of the columns an entity's
//! [`TableSchema`] manages (`id`, `uuid`, timestamps and `deleted_at`). Every
//! operation runs inside the caller's [`UnitOfWork`]; a storage failure rolls
//! the unit of work back before the error is returned.

use super::archive::{self, ArchivedRecord};
use super::change::{ChangeAction, ChangeEvent, ChangeRecorder, NoopRecorder};
use super::entity::{DeletedState, Entity, EntityRef, TableSchema};
use super::error::CrudError;
use super::filter::{CompiledFilter, FilterMap, FilterPolicy};
use super::query::{ListParams, PaginationResult, sort_entities};
use super::uow::{UnitOfWork, translate};
use crate::storage::{Row, StoreError};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

pub struct Repository<M> {
    policy: FilterPolicy,
    recorder: Arc<dyn ChangeRecorder>,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for Repository<M> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            recorder: self.recorder.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Entity> Default for Repository<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Entity> Repository<M> {
    pub fn new() -> Self {
        Self {
            policy: FilterPolicy::default(),
            recorder: Arc::new(NoopRecorder),
            _model: PhantomData,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ChangeRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_filter_policy(mut self, policy: FilterPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn filter_policy(&self) -> FilterPolicy {
        self.policy
    }

    fn schema() -> &'static TableSchema {
        M::schema()
    }

    /// Insert a new row built from `data`.
    ///
    /// Values supplied for managed columns are discarded. The row is written
    /// through the transaction at once, so uniqueness violations surface here.
    pub async fn create(&self, uow: &mut UnitOfWork, data: Map<String, Value>) -> Result<M, CrudError> {
        let schema = Self::schema();
        let mut row = without_managed(schema, data);
        let now = json!(Utc::now());
        if schema.uuid {
            row.insert("uuid".into(), json!(Uuid::new_v4()));
        }
        if schema.timestamps {
            row.insert("created_at".into(), now.clone());
            row.insert("updated_at".into(), now);
        }
        if schema.soft_delete {
            row.insert("deleted_at".into(), Value::Null);
        }

        // Reject payloads the model cannot hold before touching storage.
        let mut candidate = row.clone();
        candidate.insert("id".into(), json!(0));
        decode::<M>(candidate)?;

        let inserted = uow.transaction_mut()?.insert(schema, row).await;
        let pk = settle(uow, schema, inserted).await?;
        let entity = self.reload(uow, pk).await?;
        tracing::debug!(table = schema.name, pk, "Row created");

        let event = ChangeEvent::new(ChangeAction::Create, schema.name, pk, None, Some(Value::Object(encode(&entity)?)));
        self.recorder.record(uow, event).await?;
        Ok(entity)
    }

    pub async fn get_by_id(
        &self,
        uow: &mut UnitOfWork,
        id: i64,
        state: DeletedState,
    ) -> Result<Option<M>, CrudError> {
        let schema = Self::schema();
        let fetched = uow.transaction()?.get(schema, id).await;
        let entity = settle(uow, schema, fetched).await?.map(hydrate::<M>).transpose()?;
        Ok(entity.filter(|e| state.admits(e.deleted_at())))
    }

    pub async fn get_by_uuid(
        &self,
        uow: &mut UnitOfWork,
        uuid: Uuid,
        state: DeletedState,
    ) -> Result<Option<M>, CrudError> {
        let schema = Self::schema();
        if !schema.uuid {
            return Ok(None);
        }
        let rows = self.scan(uow).await?;
        let row = rows.into_iter().find(|row| {
            row.get("uuid")
                .and_then(Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok())
                == Some(uuid)
        });
        let entity = row.map(hydrate::<M>).transpose()?;
        Ok(entity.filter(|e| state.admits(e.deleted_at())))
    }

    /// Look an entity up by whichever identifier `key` carries
    pub async fn get(
        &self,
        uow: &mut UnitOfWork,
        key: EntityRef,
        state: DeletedState,
    ) -> Result<Option<M>, CrudError> {
        match key {
            EntityRef::Id(id) => self.get_by_id(uow, id, state).await,
            EntityRef::Uuid(uuid) => self.get_by_uuid(uow, uuid, state).await,
        }
    }

    /// First match in primary-key order
    pub async fn find_one_by(
        &self,
        uow: &mut UnitOfWork,
        filters: &FilterMap,
        state: DeletedState,
    ) -> Result<Option<M>, CrudError> {
        Ok(self.find_all_by(uow, filters, state).await?.into_iter().next())
    }

    /// Every match in primary-key order
    pub async fn find_all_by(
        &self,
        uow: &mut UnitOfWork,
        filters: &FilterMap,
        state: DeletedState,
    ) -> Result<Vec<M>, CrudError> {
        self.matching(uow, filters, state, self.policy).await
    }

    async fn matching(
        &self,
        uow: &mut UnitOfWork,
        filters: &FilterMap,
        state: DeletedState,
        policy: FilterPolicy,
    ) -> Result<Vec<M>, CrudError> {
        let filter = CompiledFilter::<M>::compile(filters, policy)?;
        let entities = self.load_all(uow).await?;
        Ok(entities
            .into_iter()
            .filter(|e| state.admits(e.deleted_at()) && filter.matches(e))
            .collect())
    }

    /// Filter, count, sort, then cut one page
    pub async fn paginate(
        &self,
        uow: &mut UnitOfWork,
        params: &ListParams,
    ) -> Result<PaginationResult<M>, CrudError> {
        let page = params.page.max(1);
        let per_page = params.per_page.max(1);

        let policy = params.policy.unwrap_or(self.policy);
        let mut matched = self
            .matching(uow, &params.filters, params.deleted_state, policy)
            .await?;
        let total = matched.len();
        sort_entities(&mut matched, &params.order_by);

        let items = matched
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        tracing::debug!(
            table = Self::schema().name,
            total,
            page,
            per_page,
            "Paginated listing"
        );
        Ok(PaginationResult::new(items, total, page, per_page))
    }

    /// Write a mutated entity back, refreshing `updated_at`.
    ///
    /// `id`, `uuid` and `created_at` keep their stored values.
    pub async fn save(&self, uow: &mut UnitOfWork, entity: &M) -> Result<M, CrudError> {
        self.rewrite(uow, entity, ChangeAction::Update, |_| {}).await
    }

    /// Soft delete when the model supports it, otherwise remove the row.
    ///
    /// A hard delete here does not archive.
    pub async fn delete(&self, uow: &mut UnitOfWork, entity: &M, soft: bool) -> Result<(), CrudError> {
        let schema = Self::schema();
        if soft && schema.soft_delete {
            self.rewrite(uow, entity, ChangeAction::SoftDelete, |row| {
                row.insert("deleted_at".into(), json!(Utc::now()));
            })
            .await?;
            return Ok(());
        }

        self.remove(uow, entity, ChangeAction::Delete).await
    }

    /// Clear the soft-delete marker. Active entities are returned unchanged.
    pub async fn restore(&self, uow: &mut UnitOfWork, entity: &M) -> Result<M, CrudError> {
        if !entity.is_deleted() {
            return Ok(entity.clone());
        }
        self.rewrite(uow, entity, ChangeAction::Restore, |row| {
            row.insert("deleted_at".into(), Value::Null);
        })
        .await
    }

    /// Archive a snapshot of the entity, then remove its row
    pub async fn force_delete(
        &self,
        uow: &mut UnitOfWork,
        entity: &M,
    ) -> Result<ArchivedRecord, CrudError> {
        let record = archive::archive(uow, entity).await?;
        self.remove(uow, entity, ChangeAction::ForceDelete).await?;
        Ok(record)
    }

    async fn rewrite(
        &self,
        uow: &mut UnitOfWork,
        entity: &M,
        action: ChangeAction,
        patch: impl FnOnce(&mut Row) + Send,
    ) -> Result<M, CrudError> {
        let schema = Self::schema();
        let pk = entity.id();
        let fetched = uow.transaction()?.get(schema, pk).await;
        let stored = settle(uow, schema, fetched)
            .await?
            .ok_or_else(|| CrudError::not_found(M::entity_name(), pk))?;

        let mut row = encode(entity)?;
        for column in ["id", "uuid", "created_at"] {
            if let Some(value) = stored.get(column) {
                row.insert(column.into(), value.clone());
            }
        }
        patch(&mut row);
        if schema.timestamps {
            row.insert("updated_at".into(), json!(Utc::now()));
        }
        decode::<M>(row.clone())?;

        let updated = uow.transaction_mut()?.update(schema, pk, row).await;
        settle(uow, schema, updated).await?;
        let entity = self.reload(uow, pk).await?;
        tracing::debug!(table = schema.name, pk, action = %action, "Row rewritten");

        let event = ChangeEvent::new(
            action,
            schema.name,
            pk,
            Some(Value::Object(stored)),
            Some(Value::Object(encode(&entity)?)),
        );
        self.recorder.record(uow, event).await?;
        Ok(entity)
    }

    async fn remove(&self, uow: &mut UnitOfWork, entity: &M, action: ChangeAction) -> Result<(), CrudError> {
        let schema = Self::schema();
        let pk = entity.id();
        let removed = uow.transaction_mut()?.remove(schema, pk).await;
        match settle(uow, schema, removed).await {
            Err(CrudError::Storage(StoreError::MissingRow { .. })) => {
                return Err(CrudError::not_found(M::entity_name(), pk));
            }
            other => other?,
        }
        tracing::debug!(table = schema.name, pk, action = %action, "Row removed");

        let event = ChangeEvent::new(action, schema.name, pk, Some(Value::Object(encode(entity)?)), None);
        self.recorder.record(uow, event).await
    }

    async fn reload(&self, uow: &mut UnitOfWork, pk: i64) -> Result<M, CrudError> {
        let schema = Self::schema();
        let fetched = uow.transaction()?.get(schema, pk).await;
        match settle(uow, schema, fetched).await? {
            Some(row) => hydrate(row),
            None => Err(CrudError::Internal(format!(
                "row {} vanished from {} within its own transaction",
                pk, schema.name
            ))),
        }
    }

    async fn scan(&self, uow: &mut UnitOfWork) -> Result<Vec<Row>, CrudError> {
        let schema = Self::schema();
        let scanned = uow.transaction()?.scan(schema).await;
        settle(uow, schema, scanned).await
    }

    async fn load_all(&self, uow: &mut UnitOfWork) -> Result<Vec<M>, CrudError> {
        self.scan(uow).await?.into_iter().map(hydrate).collect()
    }
}

/// Turn a storage result into a domain result, rolling the unit of work back
/// on failure
async fn settle<T>(
    uow: &mut UnitOfWork,
    schema: &TableSchema,
    result: Result<T, StoreError>,
) -> Result<T, CrudError> {
    let err = match result {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    match &err {
        StoreError::UniqueViolation { column, .. } => {
            tracing::warn!(table = schema.name, column = %column, "Unique constraint violated")
        }
        StoreError::MissingRow { .. } => {
            tracing::debug!(table = schema.name, error = %err, "Row missing")
        }
        other => tracing::error!(table = schema.name, error = %other, "Storage operation failed"),
    }
    if let Err(rollback) = uow.rollback().await {
        tracing::error!(error = %rollback, "Rollback after storage failure also failed");
    }
    Err(translate(err))
}

fn without_managed(schema: &TableSchema, mut data: Map<String, Value>) -> Row {
    for column in schema.managed_columns() {
        data.remove(column);
    }
    data
}

/// Payload → model. Failures are the caller's fault.
fn decode<M: Entity>(row: Row) -> Result<M, CrudError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| CrudError::invalid("_schema", e.to_string()))
}

/// Stored row → model. Failures mean storage holds something the model
/// cannot represent.
fn hydrate<M: Entity>(row: Row) -> Result<M, CrudError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| {
        CrudError::Internal(format!("cannot read {} row: {}", M::entity_name(), e))
    })
}

fn encode<M: Entity>(entity: &M) -> Result<Row, CrudError> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(_) => Err(CrudError::Internal(format!(
            "{} does not serialize to an object",
            M::entity_name()
        ))),
        Err(e) => Err(CrudError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use chrono::DateTime;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Product {
        id: i64,
        uuid: Uuid,
        name: String,
        price: f64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    }

    crate::impl_model!(
        Product,
        table = "products",
        features = [uuid, timestamps, soft_delete],
        unique = ["name"],
        fields = { name: String, price: f64 },
    );

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        id: i64,
        body: String,
    }

    crate::impl_model!(Note, table = "notes", fields = { body: String });

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn seeded(names: &[(&str, f64)]) -> (InMemoryStorage, UnitOfWork, Repository<Product>) {
        let storage = InMemoryStorage::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let repo = Repository::<Product>::new();
        for (name, price) in names {
            repo.create(&mut uow, data(json!({ "name": name, "price": price })))
                .await
                .unwrap();
        }
        (storage, uow, repo)
    }

    #[tokio::test]
    async fn test_create_discards_managed_columns() {
        let (_storage, mut uow, repo) = seeded(&[]).await;
        let forged = Uuid::new_v4();
        let product = repo
            .create(
                &mut uow,
                data(json!({
                    "id": 999,
                    "uuid": forged,
                    "deleted_at": "2020-01-01T00:00:00Z",
                    "name": "lamp",
                    "price": 12.5
                })),
            )
            .await
            .unwrap();

        assert_eq!(product.id, 1);
        assert_ne!(product.uuid, forged);
        assert!(product.deleted_at.is_none());
        assert_eq!(product.created_at, product.updated_at);
    }

    #[tokio::test]
    async fn test_create_rejects_payload_the_model_cannot_hold() {
        let (_storage, mut uow, repo) = seeded(&[]).await;
        let err = repo
            .create(&mut uow, data(json!({ "name": "lamp" })))
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_duplicate_leaves_unit_of_work_usable() {
        let (storage, mut uow, repo) = seeded(&[]).await;
        repo.create(&mut uow, data(json!({ "name": "lamp", "price": 1.0 })))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let err = repo
            .create(&mut uow, data(json!({ "name": "lamp", "price": 2.0 })))
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::DuplicateEntry(_)));
        assert_eq!(err.to_string(), "Duplicate key or unique constraint violated.");

        repo.create(&mut uow, data(json!({ "name": "desk", "price": 3.0 })))
            .await
            .unwrap();
        uow.commit().await.unwrap();
        assert_eq!(storage.committed_rows("products").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_soft_delete_round_trip() {
        let (_storage, mut uow, repo) = seeded(&[("lamp", 1.0)]).await;
        let product = repo.get_by_id(&mut uow, 1, DeletedState::Active).await.unwrap().unwrap();

        repo.delete(&mut uow, &product, true).await.unwrap();
        assert!(repo.get_by_id(&mut uow, 1, DeletedState::Active).await.unwrap().is_none());
        let deleted = repo
            .get_by_uuid(&mut uow, product.uuid, DeletedState::DeletedOnly)
            .await
            .unwrap()
            .unwrap();
        assert!(deleted.is_deleted());

        let restored = repo.restore(&mut uow, &deleted).await.unwrap();
        assert!(!restored.is_deleted());
        assert_eq!(restored.uuid, product.uuid);
        assert_eq!(restored.created_at, product.created_at);
        assert!(repo.get_by_id(&mut uow, 1, DeletedState::DeletedOnly).await.unwrap().is_none());
        assert!(repo.get_by_id(&mut uow, 1, DeletedState::Active).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restore_of_active_entity_is_noop() {
        let (_storage, mut uow, repo) = seeded(&[("lamp", 1.0)]).await;
        let product = repo.get_by_id(&mut uow, 1, DeletedState::All).await.unwrap().unwrap();
        let same = repo.restore(&mut uow, &product).await.unwrap();
        assert_eq!(same.updated_at, product.updated_at);
    }

    #[tokio::test]
    async fn test_delete_without_soft_delete_support_removes_row() {
        let storage = InMemoryStorage::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let repo = Repository::<Note>::new();
        let note = repo.create(&mut uow, data(json!({ "body": "hi" }))).await.unwrap();

        repo.delete(&mut uow, &note, true).await.unwrap();
        assert!(repo.get_by_id(&mut uow, note.id, DeletedState::All).await.unwrap().is_none());
        assert!(archive::archived_rows(&mut uow, "notes", note.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_delete_archives_snapshot() {
        let (storage, mut uow, repo) = seeded(&[("lamp", 1.0), ("desk", 2.0)]).await;
        let product = repo.get_by_id(&mut uow, 2, DeletedState::All).await.unwrap().unwrap();

        let record = repo.force_delete(&mut uow, &product).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(record.original_table, "products");
        assert_eq!(record.original_pk, "2");
        assert_eq!(record.data, serde_json::to_value(&product).unwrap());

        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        for state in [DeletedState::Active, DeletedState::DeletedOnly, DeletedState::All] {
            assert!(repo.get_by_id(&mut uow, 2, state).await.unwrap().is_none());
        }
        let archived = archive::archived_rows(&mut uow, "products", 2).await.unwrap();
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn test_save_keeps_identity_and_refreshes_updated_at() {
        let (_storage, mut uow, repo) = seeded(&[("lamp", 1.0)]).await;
        let mut product = repo.get_by_id(&mut uow, 1, DeletedState::All).await.unwrap().unwrap();
        let original = product.clone();
        product.price = 9.0;
        product.uuid = Uuid::new_v4();

        let saved = repo.save(&mut uow, &product).await.unwrap();
        assert_eq!(saved.price, 9.0);
        assert_eq!(saved.uuid, original.uuid);
        assert!(saved.updated_at >= original.updated_at);
    }

    #[tokio::test]
    async fn test_paginate_filters_counts_and_sorts() {
        let (_storage, mut uow, repo) =
            seeded(&[("Book", 10.0), ("Pen", 2.0), ("Notebook", 5.0)]).await;

        let params = ListParams::new().filter("name", "ilike__book").order_by("-price");
        let result = repo.paginate(&mut uow, &params).await.unwrap();
        assert_eq!(result.total(), 2);
        let names: Vec<_> = result.items().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Book", "Notebook"]);

        let second = repo
            .paginate(&mut uow, &ListParams::new().per_page(2).page(2).order_by("name"))
            .await
            .unwrap();
        assert_eq!(second.total(), 3);
        assert_eq!(second.total_pages(), 2);
        assert!(!second.has_next());
        assert!(second.has_prev());
        assert_eq!(second.items()[0].name, "Pen");
    }

    #[tokio::test]
    async fn test_paginate_ignores_unknown_sort_fields() {
        let (_storage, mut uow, repo) = seeded(&[("b", 1.0), ("a", 2.0)]).await;
        let result = repo
            .paginate(&mut uow, &ListParams::new().order_by("colour"))
            .await
            .unwrap();
        let ids: Vec<_> = result.items().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_find_one_by_uses_primary_key_order() {
        let (_storage, mut uow, repo) = seeded(&[("a", 5.0), ("b", 5.0)]).await;
        let mut filters = FilterMap::new();
        filters.insert("price".into(), json!("gte__5"));
        let found = repo
            .find_one_by(&mut uow, &filters, DeletedState::Active)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "a");
    }
}

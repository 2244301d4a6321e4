//! Hook-driven service layer
//!
//! [`CrudService`] defines the orchestration of every operation once and
//! calls into a [`ServiceHooks`] implementation at fixed points. Override only
//! the hooks you need; everything else falls through to the defaults.
//!
//! ```rust,ignore
//! struct InvoiceHooks;
//!
//! #[async_trait]
//! impl ServiceHooks<Invoice> for InvoiceHooks {
//!     async fn pre_delete(&self, _uow: &mut UnitOfWork, invoice: &Invoice, _payload: Option<&Value>)
//!         -> Result<(), CrudError>
//!     {
//!         if invoice.paid {
//!             return Err(CrudError::business("Paid invoices cannot be deleted."));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let service = CrudService::with_hooks(InvoiceHooks);
//! ```
//!
//! The service never commits. Whoever opened the [`UnitOfWork`] decides.

use super::archive::ArchivedRecord;
use super::entity::{DeletedState, Entity, EntityRef};
use super::error::CrudError;
use super::query::{ListParams, PaginationResult};
use super::repository::Repository;
use super::uow::UnitOfWork;
use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Extension points around each service operation
#[async_trait]
pub trait ServiceHooks<M: Entity>: Send + Sync + 'static {
    /// Adjust or reject the payload of a create
    async fn pre_create(
        &self,
        _uow: &mut UnitOfWork,
        data: Map<String, Value>,
    ) -> Result<Map<String, Value>, CrudError> {
        Ok(data)
    }

    async fn post_create(&self, _uow: &mut UnitOfWork, entity: M) -> Result<M, CrudError> {
        Ok(entity)
    }

    /// Apply an update payload to the loaded entity
    async fn pre_update(
        &self,
        _uow: &mut UnitOfWork,
        entity: &mut M,
        data: Map<String, Value>,
    ) -> Result<(), CrudError> {
        apply_changes(entity, data)
    }

    async fn post_update(&self, _uow: &mut UnitOfWork, entity: M) -> Result<M, CrudError> {
        Ok(entity)
    }

    async fn pre_delete(
        &self,
        _uow: &mut UnitOfWork,
        _entity: &M,
        _payload: Option<&Value>,
    ) -> Result<(), CrudError> {
        Ok(())
    }

    async fn post_delete(&self, _uow: &mut UnitOfWork, _entity: &M) -> Result<(), CrudError> {
        Ok(())
    }

    async fn pre_restore(&self, _uow: &mut UnitOfWork, _entity: &M) -> Result<(), CrudError> {
        Ok(())
    }

    async fn post_restore(&self, _uow: &mut UnitOfWork, entity: M) -> Result<M, CrudError> {
        Ok(entity)
    }

    async fn pre_force_delete(
        &self,
        _uow: &mut UnitOfWork,
        _entity: &M,
        _payload: Option<&Value>,
    ) -> Result<(), CrudError> {
        Ok(())
    }

    async fn post_force_delete(
        &self,
        _uow: &mut UnitOfWork,
        _record: &ArchivedRecord,
    ) -> Result<(), CrudError> {
        Ok(())
    }

    async fn pre_get(&self, _uow: &mut UnitOfWork, key: EntityRef) -> Result<EntityRef, CrudError> {
        Ok(key)
    }

    async fn post_get(&self, _uow: &mut UnitOfWork, entity: Option<M>) -> Result<Option<M>, CrudError> {
        Ok(entity)
    }

    async fn pre_list(&self, _uow: &mut UnitOfWork, params: ListParams) -> Result<ListParams, CrudError> {
        Ok(params)
    }

    async fn post_list(
        &self,
        _uow: &mut UnitOfWork,
        result: PaginationResult<M>,
    ) -> Result<PaginationResult<M>, CrudError> {
        Ok(result)
    }
}

/// Hooks that change nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl<M: Entity> ServiceHooks<M> for DefaultHooks {}

/// Copy every key of `data` that the entity already has onto it.
///
/// Unknown keys and repository-managed columns are skipped.
pub fn apply_changes<M: Entity>(entity: &mut M, data: Map<String, Value>) -> Result<(), CrudError> {
    let managed = M::schema().managed_columns();
    let mut current = match serde_json::to_value(&*entity) {
        Ok(Value::Object(current)) => current,
        _ => {
            return Err(CrudError::Internal(format!(
                "{} does not serialize to an object",
                M::entity_name()
            )));
        }
    };

    for (key, value) in data {
        if managed.contains(&key.as_str()) || !current.contains_key(&key) {
            tracing::debug!(entity = M::entity_name(), field = %key, "Skipping update key");
            continue;
        }
        current.insert(key, value);
    }

    *entity = serde_json::from_value(Value::Object(current))
        .map_err(|e| CrudError::invalid("_schema", e.to_string()))?;
    Ok(())
}

/// Generic CRUD orchestration over a repository
pub struct CrudService<M, H = DefaultHooks> {
    repository: Repository<M>,
    hooks: H,
}

impl<M: Entity> CrudService<M, DefaultHooks> {
    pub fn new() -> Self {
        Self::with_hooks(DefaultHooks)
    }
}

impl<M: Entity> Default for CrudService<M, DefaultHooks> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Entity, H: ServiceHooks<M>> CrudService<M, H> {
    pub fn with_hooks(hooks: H) -> Self {
        Self {
            repository: Repository::new(),
            hooks,
        }
    }

    /// Replace the repository, e.g. to attach a change recorder
    pub fn with_repository(mut self, repository: Repository<M>) -> Self {
        self.repository = repository;
        self
    }

    pub fn repository(&self) -> &Repository<M> {
        &self.repository
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    async fn resolve(
        &self,
        uow: &mut UnitOfWork,
        key: EntityRef,
        state: DeletedState,
    ) -> Result<M, CrudError> {
        self.repository
            .get(uow, key, state)
            .await?
            .ok_or_else(|| CrudError::not_found(M::entity_name(), key))
    }

    pub async fn create(&self, uow: &mut UnitOfWork, data: Map<String, Value>) -> Result<M, CrudError> {
        let data = self.hooks.pre_create(uow, data).await?;
        let entity = self.repository.create(uow, data).await?;
        tracing::info!(entity = M::entity_name(), id = entity.id(), "Created");
        self.hooks.post_create(uow, entity).await
    }

    pub async fn update(
        &self,
        uow: &mut UnitOfWork,
        key: EntityRef,
        data: Map<String, Value>,
    ) -> Result<M, CrudError> {
        let mut entity = self.resolve(uow, key, DeletedState::Active).await?;
        self.hooks.pre_update(uow, &mut entity, data).await?;
        let entity = self.repository.save(uow, &entity).await?;
        tracing::info!(entity = M::entity_name(), id = entity.id(), "Updated");
        self.hooks.post_update(uow, entity).await
    }

    /// Soft delete when supported. Returns the entity as it was loaded.
    pub async fn delete(
        &self,
        uow: &mut UnitOfWork,
        key: EntityRef,
        payload: Option<&Value>,
    ) -> Result<M, CrudError> {
        let entity = self.resolve(uow, key, DeletedState::Active).await?;
        self.hooks.pre_delete(uow, &entity, payload).await?;
        self.repository.delete(uow, &entity, true).await?;
        tracing::info!(entity = M::entity_name(), id = entity.id(), "Deleted");
        self.hooks.post_delete(uow, &entity).await?;
        Ok(entity)
    }

    pub async fn restore(&self, uow: &mut UnitOfWork, key: EntityRef) -> Result<M, CrudError> {
        let entity = self.resolve(uow, key, DeletedState::All).await?;
        self.hooks.pre_restore(uow, &entity).await?;
        let entity = self.repository.restore(uow, &entity).await?;
        tracing::info!(entity = M::entity_name(), id = entity.id(), "Restored");
        self.hooks.post_restore(uow, entity).await
    }

    pub async fn force_delete(
        &self,
        uow: &mut UnitOfWork,
        key: EntityRef,
        payload: Option<&Value>,
    ) -> Result<ArchivedRecord, CrudError> {
        let entity = self.resolve(uow, key, DeletedState::All).await?;
        self.hooks.pre_force_delete(uow, &entity, payload).await?;
        let record = self.repository.force_delete(uow, &entity).await?;
        tracing::info!(
            entity = M::entity_name(),
            id = entity.id(),
            archive_id = record.id,
            "Permanently deleted"
        );
        self.hooks.post_force_delete(uow, &record).await?;
        Ok(record)
    }

    pub async fn get(
        &self,
        uow: &mut UnitOfWork,
        key: EntityRef,
        state: DeletedState,
    ) -> Result<Option<M>, CrudError> {
        let key = self.hooks.pre_get(uow, key).await?;
        let entity = self.repository.get(uow, key, state).await?;
        self.hooks.post_get(uow, entity).await
    }

    pub async fn get_by_id(
        &self,
        uow: &mut UnitOfWork,
        id: i64,
        state: DeletedState,
    ) -> Result<Option<M>, CrudError> {
        self.get(uow, EntityRef::Id(id), state).await
    }

    pub async fn get_by_uuid(
        &self,
        uow: &mut UnitOfWork,
        uuid: Uuid,
        state: DeletedState,
    ) -> Result<Option<M>, CrudError> {
        self.get(uow, EntityRef::Uuid(uuid), state).await
    }

    pub async fn paginate(
        &self,
        uow: &mut UnitOfWork,
        params: ListParams,
    ) -> Result<PaginationResult<M>, CrudError> {
        let params = self.hooks.pre_list(uow, params).await?;
        let result = self.repository.paginate(uow, &params).await?;
        self.hooks.post_list(uow, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: i64,
        uuid: Uuid,
        name: String,
        stock: i64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    }

    crate::impl_model!(
        Widget,
        table = "widgets",
        features = [uuid, timestamps, soft_delete],
        unique = ["name"],
        fields = { name: String, stock: i64 },
    );

    struct GuardedHooks;

    #[async_trait]
    impl ServiceHooks<Widget> for GuardedHooks {
        async fn pre_create(
            &self,
            _uow: &mut UnitOfWork,
            mut data: Map<String, Value>,
        ) -> Result<Map<String, Value>, CrudError> {
            data.entry("stock").or_insert(json!(0));
            Ok(data)
        }

        async fn pre_delete(
            &self,
            _uow: &mut UnitOfWork,
            widget: &Widget,
            _payload: Option<&Value>,
        ) -> Result<(), CrudError> {
            if widget.stock > 0 {
                return Err(CrudError::business("Widgets in stock cannot be deleted."));
            }
            Ok(())
        }
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_update_copies_known_unmanaged_keys() {
        let storage = InMemoryStorage::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let service = CrudService::<Widget>::new();
        let widget = service
            .create(&mut uow, data(json!({ "name": "bolt", "stock": 3 })))
            .await
            .unwrap();

        let updated = service
            .update(
                &mut uow,
                EntityRef::Uuid(widget.uuid),
                data(json!({ "stock": 7, "id": 50, "colour": "red" })),
            )
            .await
            .unwrap();
        assert_eq!(updated.stock, 7);
        assert_eq!(updated.id, widget.id);
    }

    #[tokio::test]
    async fn test_update_not_found_leaves_no_partial_state() {
        let storage = InMemoryStorage::new();
        let service = CrudService::<Widget>::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        service
            .create(&mut uow, data(json!({ "name": "bolt", "stock": 3 })))
            .await
            .unwrap();
        uow.commit().await.unwrap();
        let before = storage.committed_rows("widgets").unwrap();

        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let err = service
            .update(&mut uow, EntityRef::Id(42), data(json!({ "stock": 1 })))
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::NotFound { .. }));
        drop(uow);

        assert_eq!(storage.committed_rows("widgets").unwrap(), before);
    }

    #[tokio::test]
    async fn test_hooks_shape_and_veto_operations() {
        let storage = InMemoryStorage::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let service = CrudService::with_hooks(GuardedHooks);

        let empty = service
            .create(&mut uow, data(json!({ "name": "nut" })))
            .await
            .unwrap();
        assert_eq!(empty.stock, 0);
        service
            .delete(&mut uow, EntityRef::Id(empty.id), None)
            .await
            .unwrap();

        let stocked = service
            .create(&mut uow, data(json!({ "name": "bolt", "stock": 2 })))
            .await
            .unwrap();
        let err = service
            .delete(&mut uow, EntityRef::Id(stocked.id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::BusinessLogic(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_resolution_states() {
        let storage = InMemoryStorage::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let service = CrudService::<Widget>::new();
        let widget = service
            .create(&mut uow, data(json!({ "name": "bolt", "stock": 0 })))
            .await
            .unwrap();
        let key = EntityRef::Uuid(widget.uuid);

        service.delete(&mut uow, key, None).await.unwrap();
        assert!(matches!(
            service.delete(&mut uow, key, None).await,
            Err(CrudError::NotFound { .. })
        ));
        assert!(service.get(&mut uow, key, DeletedState::Active).await.unwrap().is_none());

        let restored = service.restore(&mut uow, key).await.unwrap();
        assert!(restored.deleted_at.is_none());

        service.delete(&mut uow, key, None).await.unwrap();
        let record = service.force_delete(&mut uow, key, None).await.unwrap();
        assert_eq!(record.original_pk, widget.id.to_string());
        assert!(service.get(&mut uow, key, DeletedState::All).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_paginate_runs_list_hooks() {
        struct CappedHooks;

        #[async_trait]
        impl ServiceHooks<Widget> for CappedHooks {
            async fn pre_list(
                &self,
                _uow: &mut UnitOfWork,
                params: ListParams,
            ) -> Result<ListParams, CrudError> {
                Ok(params.per_page(1))
            }
        }

        let storage = InMemoryStorage::new();
        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        let service = CrudService::with_hooks(CappedHooks);
        for name in ["a", "b"] {
            service
                .create(&mut uow, data(json!({ "name": name, "stock": 1 })))
                .await
                .unwrap();
        }

        let page = service.paginate(&mut uow, ListParams::new()).await.unwrap();
        assert_eq!(page.items().len(), 1);
        assert_eq!(page.total_pages(), 2);
    }
}

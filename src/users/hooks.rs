//! Service hooks for users and roles

use super::models::{Role, User};
use super::password::{PasswordHasher, validate_password_strength};
use crate::core::entity::DeletedState;
use crate::core::error::CrudError;
use crate::core::filter::FilterMap;
use crate::core::repository::Repository;
use crate::core::service::{ServiceHooks, apply_changes};
use crate::core::uow::UnitOfWork;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Rejects taken usernames and turns `password` into `password_hash`
pub struct UserHooks {
    hasher: Arc<dyn PasswordHasher>,
}

impl UserHooks {
    pub fn new(hasher: Arc<dyn PasswordHasher>) -> Self {
        Self { hasher }
    }

    fn hash_password(&self, password: Value) -> Result<String, CrudError> {
        let password = password
            .as_str()
            .ok_or_else(|| CrudError::invalid("password", "Not a valid string."))?;
        validate_password_strength(password)?;
        self.hasher.hash(password)
    }
}

/// Look a user up by exact username, soft-deleted ones included
pub(crate) async fn find_by_username(
    uow: &mut UnitOfWork,
    username: &str,
) -> Result<Option<User>, CrudError> {
    let mut filters = FilterMap::new();
    filters.insert("username".into(), json!({ "eq": username }));
    Repository::<User>::new()
        .find_one_by(uow, &filters, DeletedState::All)
        .await
}

#[async_trait]
impl ServiceHooks<User> for UserHooks {
    async fn pre_create(
        &self,
        uow: &mut UnitOfWork,
        mut data: Map<String, Value>,
    ) -> Result<Map<String, Value>, CrudError> {
        if let Some(username) = data.get("username").and_then(Value::as_str) {
            if find_by_username(uow, username).await?.is_some() {
                return Err(CrudError::business("Username already exists."));
            }
        }

        if let Some(password) = data.remove("password") {
            let hash = self.hash_password(password)?;
            data.insert("password_hash".into(), Value::String(hash));
        }
        Ok(data)
    }

    async fn pre_update(
        &self,
        _uow: &mut UnitOfWork,
        user: &mut User,
        mut data: Map<String, Value>,
    ) -> Result<(), CrudError> {
        // Hashes are only ever written from a password
        data.remove("password_hash");
        if let Some(password) = data.remove("password") {
            user.password_hash = self.hash_password(password)?;
        }
        apply_changes(user, data)
    }
}

/// Protects system roles from deletion and renaming
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleHooks;

#[async_trait]
impl ServiceHooks<Role> for RoleHooks {
    async fn pre_update(
        &self,
        _uow: &mut UnitOfWork,
        role: &mut Role,
        data: Map<String, Value>,
    ) -> Result<(), CrudError> {
        if role.is_system_role {
            if let Some(name) = data.get("name").and_then(Value::as_str) {
                if name != role.name {
                    return Err(CrudError::business(format!(
                        "System role '{}' cannot be renamed.",
                        role.name
                    )));
                }
            }
        }
        apply_changes(role, data)
    }

    async fn pre_delete(
        &self,
        _uow: &mut UnitOfWork,
        role: &Role,
        _payload: Option<&Value>,
    ) -> Result<(), CrudError> {
        deletable(role)
    }

    async fn pre_force_delete(
        &self,
        _uow: &mut UnitOfWork,
        role: &Role,
        _payload: Option<&Value>,
    ) -> Result<(), CrudError> {
        deletable(role)
    }
}

fn deletable(role: &Role) -> Result<(), CrudError> {
    if role.is_system_role {
        return Err(CrudError::business(format!(
            "System role '{}' cannot be deleted.",
            role.name
        )));
    }
    Ok(())
}

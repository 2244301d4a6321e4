//! Idempotent seeding of the default permissions, admin role and admin user

use super::hooks::find_by_username;
use super::models::{Permission, Role};
use super::service::AuthService;
use crate::core::entity::DeletedState;
use crate::core::error::CrudError;
use crate::core::filter::FilterMap;
use crate::core::uow::UnitOfWork;
use crate::storage::Storage;
use serde::Serialize;
use serde_json::{Map, Value, json};

/// Permissions managed by the built-in user routes
pub const DEFAULT_PERMISSIONS: &[&str] = &[
    "create:user",
    "read:user",
    "update:user",
    "delete:user",
    "create:role",
    "read:role",
    "update:role",
    "delete:role",
    "create:permission",
    "read:permission",
    "update:permission",
    "delete:permission",
    "assign_role:user",
    "revoke_role:user",
    "read_roles:user",
    "assign_permission:role",
    "revoke_permission:role",
    "read_permissions:role",
];

/// Name of the seeded system role
pub const ADMIN_ROLE: &str = "admin";

/// What [`seed_default_auth`] changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub created_permissions: usize,
    pub created_admin_user: bool,
    pub admin_role_id: i64,
    pub admin_username: String,
}

fn by_name(name: &str) -> FilterMap {
    let mut filters = FilterMap::new();
    filters.insert("name".into(), json!({ "eq": name }));
    filters
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Seed default permissions, a system `admin` role holding all of them, and
/// an admin user assigned to that role, then commit.
///
/// Running it again creates nothing new. An existing admin user gets its
/// password reset to `admin_password`.
pub async fn seed_default_auth(
    storage: &dyn Storage,
    auth: &AuthService,
    admin_username: &str,
    admin_password: &str,
) -> Result<SeedReport, CrudError> {
    let mut uow = UnitOfWork::begin(storage).await?;
    match seed(&mut uow, auth, admin_username, admin_password).await {
        Ok(report) => {
            uow.commit().await?;
            tracing::info!(
                created_permissions = report.created_permissions,
                created_admin_user = report.created_admin_user,
                admin = %report.admin_username,
                "Seeded default auth data"
            );
            Ok(report)
        }
        Err(e) => {
            if let Err(rollback) = uow.rollback().await {
                tracing::error!(error = %rollback, "Rollback after failed seed failed");
            }
            Err(e)
        }
    }
}

async fn seed(
    uow: &mut UnitOfWork,
    auth: &AuthService,
    admin_username: &str,
    admin_password: &str,
) -> Result<SeedReport, CrudError> {
    let permissions = auth.permissions().repository();
    let mut created_permissions = 0;
    let mut granted: Vec<Permission> = Vec::with_capacity(DEFAULT_PERMISSIONS.len());
    for name in DEFAULT_PERMISSIONS {
        let permission = match permissions.find_one_by(uow, &by_name(name), DeletedState::All).await? {
            Some(existing) => existing,
            None => {
                created_permissions += 1;
                permissions.create(uow, object(json!({ "name": name }))).await?
            }
        };
        granted.push(permission);
    }

    let roles = auth.roles().repository();
    let admin_role: Role = match roles.find_one_by(uow, &by_name(ADMIN_ROLE), DeletedState::All).await? {
        Some(role) => role,
        None => {
            roles
                .create(
                    uow,
                    object(json!({
                        "name": ADMIN_ROLE,
                        "display_name": "Administrator",
                        "is_system_role": true,
                    })),
                )
                .await?
        }
    };
    for permission in &granted {
        auth.assign_permission(uow, admin_role.id, permission.id).await?;
    }

    // Seeded credentials skip the strength rules applied to user input
    let password_hash = auth.hasher().hash(admin_password)?;
    let users = auth.users().repository();
    let (admin, created_admin_user) = match find_by_username(uow, admin_username).await? {
        Some(mut existing) => {
            existing.password_hash = password_hash;
            (users.save(uow, &existing).await?, false)
        }
        None => {
            let data = json!({ "username": admin_username, "password_hash": password_hash });
            (users.create(uow, object(data)).await?, true)
        }
    };
    auth.assign_role(uow, admin.uuid, admin_role.id, None).await?;

    Ok(SeedReport {
        created_permissions,
        created_admin_user,
        admin_role_id: admin_role.id,
        admin_username: admin_username.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let storage = InMemoryStorage::new();
        let auth = AuthService::new(&JwtConfig::ephemeral());

        let first = seed_default_auth(&storage, &auth, "root", "initial-pass1").await.unwrap();
        assert_eq!(first.created_permissions, DEFAULT_PERMISSIONS.len());
        assert!(first.created_admin_user);

        let second = seed_default_auth(&storage, &auth, "root", "rotated-pass2").await.unwrap();
        assert_eq!(second.created_permissions, 0);
        assert!(!second.created_admin_user);
        assert_eq!(second.admin_role_id, first.admin_role_id);

        assert_eq!(storage.committed_rows("users").unwrap().len(), 1);
        assert_eq!(storage.committed_rows("user_roles").unwrap().len(), 1);
        assert_eq!(
            storage.committed_rows("role_permissions").unwrap().len(),
            DEFAULT_PERMISSIONS.len()
        );

        let mut uow = UnitOfWork::begin(&storage).await.unwrap();
        tokio_test::assert_err!(auth.login(&mut uow, "root", "initial-pass1").await);
        let login = auth.login(&mut uow, "root", "rotated-pass2").await.unwrap();

        let roles = auth.roles_for_user(&mut uow, login.user.uuid).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert!(roles[0].is_system_role);
    }
}

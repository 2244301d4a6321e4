//! Authentication and role/permission management

use super::hooks::{RoleHooks, UserHooks, find_by_username};
use super::models::{Permission, Role, RolePermission, User, UserRole};
use super::password::{Argon2Hasher, PasswordHasher, validate_password_strength};
use crate::config::JwtConfig;
use crate::core::auth::{Claims, JwtIssuer, TokenType};
use crate::core::entity::{DeletedState, Entity};
use crate::core::error::CrudError;
use crate::core::filter::FilterMap;
use crate::core::repository::Repository;
use crate::core::service::CrudService;
use crate::core::uow::UnitOfWork;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Adds application-specific claims to every access token
pub trait ClaimsLoader: Send + Sync {
    fn load(&self, user: &User) -> Map<String, Value>;
}

/// A successful login
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

/// Users, roles and permissions, plus the token exchange built on them
pub struct AuthService {
    users: Arc<CrudService<User, UserHooks>>,
    roles: Arc<CrudService<Role, RoleHooks>>,
    permissions: Arc<CrudService<Permission>>,
    user_roles: Repository<UserRole>,
    role_permissions: Repository<RolePermission>,
    hasher: Arc<dyn PasswordHasher>,
    issuer: JwtIssuer,
    claims_loader: Option<Arc<dyn ClaimsLoader>>,
}

impl fmt::Debug for AuthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthService")
            .field("issuer", &self.issuer)
            .field("claims_loader", &self.claims_loader.is_some())
            .finish()
    }
}

fn filters(value: Value) -> FilterMap {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => FilterMap::new(),
    }
}

impl AuthService {
    /// Argon2 hashing, tokens signed with `config`
    pub fn new(config: &JwtConfig) -> Self {
        Self::with_hasher(config, Arc::new(Argon2Hasher))
    }

    pub fn with_hasher(config: &JwtConfig, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self {
            users: Arc::new(CrudService::with_hooks(UserHooks::new(hasher.clone()))),
            roles: Arc::new(CrudService::with_hooks(RoleHooks)),
            permissions: Arc::new(CrudService::new()),
            user_roles: Repository::new(),
            role_permissions: Repository::new(),
            hasher,
            issuer: JwtIssuer::new(config),
            claims_loader: None,
        }
    }

    pub fn with_claims_loader(mut self, loader: Arc<dyn ClaimsLoader>) -> Self {
        self.claims_loader = Some(loader);
        self
    }

    pub fn users(&self) -> &Arc<CrudService<User, UserHooks>> {
        &self.users
    }

    pub fn roles(&self) -> &Arc<CrudService<Role, RoleHooks>> {
        &self.roles
    }

    pub fn permissions(&self) -> &Arc<CrudService<Permission>> {
        &self.permissions
    }

    pub fn hasher(&self) -> &Arc<dyn PasswordHasher> {
        &self.hasher
    }

    /// Check credentials, stamp `last_login_at` and issue a token pair
    pub async fn login(
        &self,
        uow: &mut UnitOfWork,
        username: &str,
        password: &str,
    ) -> Result<LoginResult, CrudError> {
        let user = match find_by_username(uow, username).await? {
            Some(user) if self.hasher.verify(password, &user.password_hash)? => user,
            _ => {
                tracing::warn!(username, "Login rejected");
                return Err(CrudError::AuthenticationFailed("Invalid credentials.".into()));
            }
        };
        if !user.is_active {
            return Err(CrudError::AuthenticationFailed("User account is not active.".into()));
        }
        if user.is_deleted() {
            return Err(CrudError::AuthenticationFailed(
                "User account has been deleted.".into(),
            ));
        }

        let mut user = user;
        user.last_login_at = Some(Utc::now());
        let user = self.users.repository().save(uow, &user).await?;

        let (access_token, refresh_token) = self.issue_tokens(uow, &user).await?;
        tracing::info!(user = %user.uuid, "User logged in");
        Ok(LoginResult {
            user,
            access_token,
            refresh_token,
        })
    }

    /// Signed access and refresh tokens for `user`
    pub async fn issue_tokens(
        &self,
        uow: &mut UnitOfWork,
        user: &User,
    ) -> Result<(String, String), CrudError> {
        let access = self.access_claims(uow, user).await?;
        let refresh = self.issuer.refresh_claims(user.uuid.to_string());
        Ok((self.issuer.sign(&access)?, self.issuer.sign(&refresh)?))
    }

    /// Access claims carrying the user's current roles and permissions
    pub async fn access_claims(&self, uow: &mut UnitOfWork, user: &User) -> Result<Claims, CrudError> {
        let roles = self.roles_of(uow, user.id).await?;

        let mut permissions = BTreeSet::new();
        for role in &roles {
            for permission in self.permissions_of(uow, role.id).await? {
                permissions.insert(permission.name);
            }
        }

        let mut claims = self
            .issuer
            .access_claims(user.uuid.to_string())
            .with_user_id(user.id)
            .with_roles(roles.iter().map(|role| role.name.clone()))
            .with_permissions(permissions)
            .super_admin(roles.iter().any(|role| role.is_system_role));
        if let Some(loader) = &self.claims_loader {
            claims.extra.extend(loader.load(user));
        }
        Ok(claims)
    }

    /// Exchange refresh-token claims for a fresh access token
    pub async fn refresh(&self, uow: &mut UnitOfWork, claims: &Claims) -> Result<String, CrudError> {
        if claims.token_type != TokenType::Refresh {
            return Err(CrudError::InvalidToken("expected a refresh token".into()));
        }
        let user = self.user_from_claims(uow, claims).await?;
        if !user.is_active {
            return Err(CrudError::AuthenticationFailed("User account is not active.".into()));
        }
        let access = self.access_claims(uow, &user).await?;
        self.issuer.sign(&access)
    }

    /// The user a token was issued to
    pub async fn current_user(&self, uow: &mut UnitOfWork, claims: &Claims) -> Result<User, CrudError> {
        self.user_from_claims(uow, claims).await
    }

    pub async fn change_password(
        &self,
        uow: &mut UnitOfWork,
        user_uuid: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), CrudError> {
        let invalid = || CrudError::AuthenticationFailed("Invalid credentials.".into());
        let mut user = self
            .users
            .repository()
            .get_by_uuid(uow, user_uuid, DeletedState::Active)
            .await?
            .ok_or_else(invalid)?;
        if !self.hasher.verify(current_password, &user.password_hash)? {
            return Err(invalid());
        }

        validate_password_strength(new_password)?;
        user.password_hash = self.hasher.hash(new_password)?;
        self.users.repository().save(uow, &user).await?;
        tracing::info!(user = %user.uuid, "Password changed");
        Ok(())
    }

    /// Give `user_uuid` the role; assigning twice is a no-op
    pub async fn assign_role(
        &self,
        uow: &mut UnitOfWork,
        user_uuid: Uuid,
        role_id: i64,
        assigned_by_user_id: Option<i64>,
    ) -> Result<(), CrudError> {
        let user = self.user(uow, user_uuid).await?;
        let role = self.role(uow, role_id).await?;

        let existing = self
            .user_roles
            .find_one_by(
                uow,
                &filters(json!({ "user_id": user.id, "role_id": role.id })),
                DeletedState::All,
            )
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        let data = json!({
            "user_id": user.id,
            "role_id": role.id,
            "assigned_by_user_id": assigned_by_user_id,
            "assigned_at": Utc::now(),
        });
        self.user_roles
            .create(uow, data.as_object().cloned().unwrap_or_default())
            .await?;
        tracing::info!(user = %user.uuid, role = %role.name, "Role assigned");
        Ok(())
    }

    pub async fn revoke_role(
        &self,
        uow: &mut UnitOfWork,
        user_uuid: Uuid,
        role_id: i64,
    ) -> Result<(), CrudError> {
        let user = self.user(uow, user_uuid).await?;
        let assignment = self
            .user_roles
            .find_one_by(
                uow,
                &filters(json!({ "user_id": user.id, "role_id": role_id })),
                DeletedState::All,
            )
            .await?;
        if let Some(assignment) = assignment {
            self.user_roles.delete(uow, &assignment, false).await?;
            tracing::info!(user = %user.uuid, role_id, "Role revoked");
        }
        Ok(())
    }

    pub async fn roles_for_user(&self, uow: &mut UnitOfWork, user_uuid: Uuid) -> Result<Vec<Role>, CrudError> {
        let user = self.user(uow, user_uuid).await?;
        self.roles_of(uow, user.id).await
    }

    /// Grant a permission to a role; granting twice is a no-op
    pub async fn assign_permission(
        &self,
        uow: &mut UnitOfWork,
        role_id: i64,
        permission_id: i64,
    ) -> Result<(), CrudError> {
        let role = self.role(uow, role_id).await?;
        let permission = self.permission(uow, permission_id).await?;

        let existing = self
            .role_permissions
            .find_one_by(
                uow,
                &filters(json!({ "role_id": role.id, "permission_id": permission.id })),
                DeletedState::All,
            )
            .await?;
        if existing.is_none() {
            let data = json!({ "role_id": role.id, "permission_id": permission.id });
            self.role_permissions
                .create(uow, data.as_object().cloned().unwrap_or_default())
                .await?;
            tracing::info!(role = %role.name, permission = %permission.name, "Permission assigned");
        }
        Ok(())
    }

    pub async fn revoke_permission(
        &self,
        uow: &mut UnitOfWork,
        role_id: i64,
        permission_id: i64,
    ) -> Result<(), CrudError> {
        let role = self.role(uow, role_id).await?;
        let permission = self.permission(uow, permission_id).await?;

        let grant = self
            .role_permissions
            .find_one_by(
                uow,
                &filters(json!({ "role_id": role.id, "permission_id": permission.id })),
                DeletedState::All,
            )
            .await?;
        if let Some(grant) = grant {
            self.role_permissions.delete(uow, &grant, false).await?;
            tracing::info!(role = %role.name, permission = %permission.name, "Permission revoked");
        }
        Ok(())
    }

    pub async fn role_permissions(
        &self,
        uow: &mut UnitOfWork,
        role_id: i64,
    ) -> Result<Vec<Permission>, CrudError> {
        let role = self.role(uow, role_id).await?;
        self.permissions_of(uow, role.id).await
    }

    async fn user_from_claims(&self, uow: &mut UnitOfWork, claims: &Claims) -> Result<User, CrudError> {
        let uuid = Uuid::parse_str(&claims.sub)
            .map_err(|_| CrudError::InvalidToken("subject is not a user uuid".into()))?;
        self.user(uow, uuid).await
    }

    async fn user(&self, uow: &mut UnitOfWork, uuid: Uuid) -> Result<User, CrudError> {
        self.users
            .repository()
            .get_by_uuid(uow, uuid, DeletedState::Active)
            .await?
            .ok_or_else(|| CrudError::not_found(User::entity_name(), uuid))
    }

    async fn role(&self, uow: &mut UnitOfWork, id: i64) -> Result<Role, CrudError> {
        self.roles
            .repository()
            .get_by_id(uow, id, DeletedState::All)
            .await?
            .ok_or_else(|| CrudError::not_found(Role::entity_name(), id))
    }

    async fn permission(&self, uow: &mut UnitOfWork, id: i64) -> Result<Permission, CrudError> {
        self.permissions
            .repository()
            .get_by_id(uow, id, DeletedState::All)
            .await?
            .ok_or_else(|| CrudError::not_found(Permission::entity_name(), id))
    }

    async fn roles_of(&self, uow: &mut UnitOfWork, user_id: i64) -> Result<Vec<Role>, CrudError> {
        let assignments = self
            .user_roles
            .find_all_by(uow, &filters(json!({ "user_id": user_id })), DeletedState::All)
            .await?;

        let mut roles = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            if let Some(role) = self
                .roles
                .repository()
                .get_by_id(uow, assignment.role_id, DeletedState::All)
                .await?
            {
                roles.push(role);
            }
        }
        Ok(roles)
    }

    async fn permissions_of(&self, uow: &mut UnitOfWork, role_id: i64) -> Result<Vec<Permission>, CrudError> {
        let grants = self
            .role_permissions
            .find_all_by(uow, &filters(json!({ "role_id": role_id })), DeletedState::All)
            .await?;

        let mut permissions = Vec::with_capacity(grants.len());
        for grant in grants {
            if let Some(permission) = self
                .permissions
                .repository()
                .get_by_id(uow, grant.permission_id, DeletedState::All)
                .await?
            {
                permissions.push(permission);
            }
        }
        Ok(permissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::{JwtVerifier, TokenVerifier};
    use crate::core::entity::EntityRef;
    use crate::storage::InMemoryStorage;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn jwt() -> JwtConfig {
        JwtConfig {
            secret: "service-test-secret".into(),
            ..JwtConfig::default()
        }
    }

    async fn setup() -> (InMemoryStorage, UnitOfWork, AuthService) {
        let storage = InMemoryStorage::new();
        let uow = UnitOfWork::begin(&storage).await.unwrap();
        (storage, uow, AuthService::new(&jwt()))
    }

    async fn create_user(uow: &mut UnitOfWork, auth: &AuthService, name: &str) -> User {
        auth.users()
            .create(uow, data(json!({ "username": name, "password": "passw0rd1" })))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_hashes_password_and_rejects_taken_username() {
        let (_storage, mut uow, auth) = setup().await;
        let user = create_user(&mut uow, &auth, "alice").await;
        assert_ne!(user.password_hash, "passw0rd1");
        assert!(auth.hasher().verify("passw0rd1", &user.password_hash).unwrap());
        assert!(user.is_active);

        let err = auth
            .users()
            .create(&mut uow, data(json!({ "username": "alice", "password": "other1234" })))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Username already exists.");

        let weak = auth
            .users()
            .create(&mut uow, data(json!({ "username": "bob", "password": "short" })))
            .await
            .unwrap_err();
        assert!(matches!(weak, CrudError::BusinessLogic(_)));
    }

    #[tokio::test]
    async fn test_login_builds_claims_from_roles() {
        let (_storage, mut uow, auth) = setup().await;
        let user = create_user(&mut uow, &auth, "alice").await;
        let role = auth
            .roles()
            .create(&mut uow, data(json!({ "name": "editor", "display_name": "Editor" })))
            .await
            .unwrap();
        for name in ["update:post", "create:post"] {
            let permission = auth
                .permissions()
                .create(&mut uow, data(json!({ "name": name })))
                .await
                .unwrap();
            auth.assign_permission(&mut uow, role.id, permission.id).await.unwrap();
            auth.assign_permission(&mut uow, role.id, permission.id).await.unwrap();
        }
        assert_eq!(auth.role_permissions(&mut uow, role.id).await.unwrap().len(), 2);
        auth.assign_role(&mut uow, user.uuid, role.id, None).await.unwrap();
        auth.assign_role(&mut uow, user.uuid, role.id, None).await.unwrap();

        let login = auth.login(&mut uow, "alice", "passw0rd1").await.unwrap();
        assert!(login.user.last_login_at.is_some());

        let claims = JwtVerifier::new(&jwt())
            .verify(&login.access_token)
            .unwrap();
        assert_eq!(claims.sub, user.uuid.to_string());
        assert_eq!(claims.user_id, Some(user.id));
        assert_eq!(claims.roles, vec!["editor".to_string()]);
        assert_eq!(claims.permissions, vec!["create:post".to_string(), "update:post".to_string()]);
        assert!(!claims.is_super_admin);
        assert_eq!(auth.roles_for_user(&mut uow, user.uuid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_login_failures() {
        let (_storage, mut uow, auth) = setup().await;
        let user = create_user(&mut uow, &auth, "alice").await;

        let wrong = auth.login(&mut uow, "alice", "nope12345").await.unwrap_err();
        assert_eq!(wrong.to_string(), "Invalid credentials.");
        let unknown = auth.login(&mut uow, "mallory", "passw0rd1").await.unwrap_err();
        assert_eq!(unknown.to_string(), "Invalid credentials.");

        auth.users()
            .update(&mut uow, EntityRef::from(user.uuid), data(json!({ "is_active": false })))
            .await
            .unwrap();
        let inactive = auth.login(&mut uow, "alice", "passw0rd1").await.unwrap_err();
        assert_eq!(inactive.to_string(), "User account is not active.");
    }

    #[tokio::test]
    async fn test_refresh_requires_refresh_token() {
        let (_storage, mut uow, auth) = setup().await;
        let user = create_user(&mut uow, &auth, "alice").await;
        let verifier = JwtVerifier::new(&jwt());
        let (access, refresh) = auth.issue_tokens(&mut uow, &user).await.unwrap();

        let access_claims = verifier.verify(&access).unwrap();
        assert!(matches!(
            auth.refresh(&mut uow, &access_claims).await,
            Err(CrudError::InvalidToken(_))
        ));

        let refresh_claims = verifier.verify(&refresh).unwrap();
        let fresh = auth.refresh(&mut uow, &refresh_claims).await.unwrap();
        assert_eq!(verifier.verify(&fresh).unwrap().token_type, TokenType::Access);
    }

    #[tokio::test]
    async fn test_change_password() {
        let (_storage, mut uow, auth) = setup().await;
        let user = create_user(&mut uow, &auth, "alice").await;

        let err = auth
            .change_password(&mut uow, user.uuid, "wrong1234", "newpassw0rd")
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::AuthenticationFailed(_)));

        auth.change_password(&mut uow, user.uuid, "passw0rd1", "newpassw0rd")
            .await
            .unwrap();
        tokio_test::assert_ok!(auth.login(&mut uow, "alice", "newpassw0rd").await);
    }

    #[tokio::test]
    async fn test_system_role_is_protected() {
        let (_storage, mut uow, auth) = setup().await;
        let admin = auth
            .roles()
            .create(
                &mut uow,
                data(json!({ "name": "admin", "display_name": "Admin", "is_system_role": true })),
            )
            .await
            .unwrap();
        let key = EntityRef::Id(admin.id);

        let rename = auth
            .roles()
            .update(&mut uow, key, data(json!({ "name": "root" })))
            .await
            .unwrap_err();
        assert_eq!(rename.to_string(), "System role 'admin' cannot be renamed.");

        let delete = auth.roles().delete(&mut uow, key, None).await.unwrap_err();
        assert_eq!(delete.to_string(), "System role 'admin' cannot be deleted.");

        let relabel = auth
            .roles()
            .update(&mut uow, key, data(json!({ "display_name": "Administrators" })))
            .await
            .unwrap();
        assert_eq!(relabel.display_name, "Administrators");
    }

    #[tokio::test]
    async fn test_unknown_user_and_role() {
        let (_storage, mut uow, auth) = setup().await;
        let user = create_user(&mut uow, &auth, "alice").await;

        let missing_role = auth.assign_role(&mut uow, user.uuid, 99, None).await.unwrap_err();
        assert_eq!(missing_role.to_string(), "Role with ID/identifier '99' not found.");

        let ghost = Uuid::new_v4();
        let missing_user = auth.roles_for_user(&mut uow, ghost).await.unwrap_err();
        assert!(matches!(missing_user, CrudError::NotFound { .. }));
    }
}

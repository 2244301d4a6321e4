//! HTTP surface of the users module
//!
//! CRUD routes for users, roles and permissions, plus the token exchange
//! and the role/permission assignment endpoints:
//!
//! | Method | Path | Permission |
//! |--------|------|------------|
//! | POST | `/auth/login` | public |
//! | POST | `/auth/refresh` | public, refresh token as bearer |
//! | GET | `/auth/me` | authenticated |
//! | POST | `/auth/logout` | public |
//! | POST | `/users/change-password` | authenticated |
//! | POST, GET, DELETE | `/roles/users/{user_uuid}` | `assign_role:user`, `read_roles:user`, `revoke_role:user` |
//! | GET, POST, DELETE | `/roles/{id}/permissions` | `read_permissions:role`, `assign_permission:role`, `revoke_permission:role` |

use super::models::User;
use super::schemas::{
    AssignRoleRequest, ChangePasswordRequest, LoginRequest, PermissionCreate, PermissionIdRequest,
    PermissionOut, PermissionUpdate, RoleCreate, RoleOut, RoleUpdate, UserCreate, UserOut, UserUpdate,
};
use super::service::AuthService;
use crate::core::auth::{TokenVerifier, bearer_token};
use crate::core::entity::{Entity, IdField};
use crate::core::error::CrudError;
use crate::core::schema::{CrudSchemas, InputSpec, Schema, TypedSchema};
use crate::server::context::AppContext;
use crate::server::custom::{CustomRoute, custom_router};
use crate::server::pipeline::{Handler, Reply, RequestContext};
use crate::server::routes::CrudRoutes;
use async_trait::async_trait;
use axum::Router;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthAction {
    Login,
    Refresh,
    Me,
    Logout,
    ChangePassword,
    AssignRole,
    UserRoles,
    RevokeRole,
    RolePermissions,
    AssignPermission,
    RevokePermission,
}

struct AuthHandler {
    action: AuthAction,
    auth: Arc<AuthService>,
    verifier: Arc<dyn TokenVerifier>,
}

/// Deserialize the merged, already validated inputs
fn payload<T: DeserializeOwned>(ctx: &RequestContext) -> Result<T, CrudError> {
    serde_json::from_value(Value::Object(ctx.data()))
        .map_err(|e| CrudError::invalid("_schema", e.to_string()))
}

fn dump<Out, T>(record: &T) -> Result<Value, CrudError>
where
    Out: DeserializeOwned + Serialize + validator::Validate + 'static,
    T: Serialize,
{
    let raw = serde_json::to_value(record).map_err(|e| CrudError::Internal(e.to_string()))?;
    TypedSchema::<Out>::new().dump(raw)
}

fn dump_all<Out, T>(records: &[T]) -> Result<Value, CrudError>
where
    Out: DeserializeOwned + Serialize + validator::Validate + 'static,
    T: Serialize,
{
    records
        .iter()
        .map(dump::<Out, T>)
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn caller_uuid(ctx: &RequestContext) -> Result<Uuid, CrudError> {
    let claims = ctx.claims()?;
    Uuid::parse_str(&claims.sub).map_err(|_| CrudError::InvalidToken("subject is not a user uuid".into()))
}

fn user_uuid(ctx: &RequestContext) -> Result<Uuid, CrudError> {
    let raw = ctx.require_path_id(User::entity_name())?;
    Uuid::parse_str(raw).map_err(|_| CrudError::not_found(User::entity_name(), raw))
}

fn role_id(ctx: &RequestContext) -> Result<i64, CrudError> {
    let raw = ctx.require_path_id("Role")?;
    raw.parse().map_err(|_| CrudError::not_found("Role", raw))
}

#[async_trait]
impl Handler for AuthHandler {
    async fn call(&self, ctx: &mut RequestContext) -> Result<Reply, CrudError> {
        let auth = self.auth.as_ref();
        match self.action {
            AuthAction::Login => {
                let request: LoginRequest = payload(ctx)?;
                let login = auth.login(&mut ctx.uow, &request.username, &request.password).await?;
                Ok(Reply::ok(json!({
                    "access_token": login.access_token,
                    "refresh_token": login.refresh_token,
                    "user": dump::<UserOut, _>(&login.user)?,
                })))
            }
            AuthAction::Refresh => {
                let claims = self.verifier.verify(bearer_token(&ctx.headers)?)?;
                let access_token = auth.refresh(&mut ctx.uow, &claims).await?;
                Ok(Reply::ok(json!({ "access_token": access_token })))
            }
            AuthAction::Me => {
                let claims = ctx.claims()?.clone();
                let user = auth.current_user(&mut ctx.uow, &claims).await?;
                Ok(Reply::ok(dump::<UserOut, _>(&user)?))
            }
            // Tokens are stateless; clients drop them
            AuthAction::Logout => Ok(Reply::message("Logged out")),
            AuthAction::ChangePassword => {
                let uuid = caller_uuid(ctx)?;
                let request: ChangePasswordRequest = payload(ctx)?;
                auth.change_password(
                    &mut ctx.uow,
                    uuid,
                    &request.current_password,
                    &request.new_password,
                )
                .await?;
                Ok(Reply::message("Password changed successfully"))
            }
            AuthAction::AssignRole => {
                let uuid = user_uuid(ctx)?;
                let request: AssignRoleRequest = payload(ctx)?;
                let assigned_by = ctx.claims()?.user_id;
                auth.assign_role(&mut ctx.uow, uuid, request.role_id, assigned_by).await?;
                Ok(Reply::message("Role assigned successfully"))
            }
            AuthAction::UserRoles => {
                let uuid = user_uuid(ctx)?;
                let roles = auth.roles_for_user(&mut ctx.uow, uuid).await?;
                Ok(Reply::ok(dump_all::<RoleOut, _>(&roles)?))
            }
            AuthAction::RevokeRole => {
                let uuid = user_uuid(ctx)?;
                let request: AssignRoleRequest = payload(ctx)?;
                auth.revoke_role(&mut ctx.uow, uuid, request.role_id).await?;
                Ok(Reply::message("Role revoked successfully"))
            }
            AuthAction::RolePermissions => {
                let id = role_id(ctx)?;
                let permissions = auth.role_permissions(&mut ctx.uow, id).await?;
                Ok(Reply::ok(dump_all::<PermissionOut, _>(&permissions)?))
            }
            AuthAction::AssignPermission => {
                let id = role_id(ctx)?;
                let request: PermissionIdRequest = payload(ctx)?;
                auth.assign_permission(&mut ctx.uow, id, request.permission_id).await?;
                Ok(Reply::message("Permission assigned to role"))
            }
            AuthAction::RevokePermission => {
                let id = role_id(ctx)?;
                let request: PermissionIdRequest = payload(ctx)?;
                auth.revoke_permission(&mut ctx.uow, id, request.permission_id).await?;
                Ok(Reply::message("Permission revoked from role"))
            }
        }
    }
}

/// Route group for users, roles, permissions and authentication
pub struct UserRoutes {
    auth: Arc<AuthService>,
}

impl UserRoutes {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self { auth }
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    fn handler(&self, action: AuthAction, app: &AppContext) -> Arc<dyn Handler> {
        Arc::new(AuthHandler {
            action,
            auth: self.auth.clone(),
            verifier: app.verifier.clone(),
        })
    }

    fn custom_routes(&self, app: &AppContext) -> Vec<CustomRoute> {
        vec![
            CustomRoute::post("/auth/login", self.handler(AuthAction::Login, app))
                .public()
                .input(InputSpec::json(TypedSchema::<LoginRequest>::shared()))
                .transactional(),
            CustomRoute::post("/auth/refresh", self.handler(AuthAction::Refresh, app)).public(),
            CustomRoute::get("/auth/me", self.handler(AuthAction::Me, app)),
            CustomRoute::post("/auth/logout", self.handler(AuthAction::Logout, app)).public(),
            CustomRoute::post("/users/change-password", self.handler(AuthAction::ChangePassword, app))
                .input(InputSpec::json(TypedSchema::<ChangePasswordRequest>::shared()))
                .transactional(),
            CustomRoute::post("/roles/users/{user_uuid}", self.handler(AuthAction::AssignRole, app))
                .permission("assign_role:user")
                .input(InputSpec::json(TypedSchema::<AssignRoleRequest>::shared()))
                .transactional(),
            CustomRoute::get("/roles/users/{user_uuid}", self.handler(AuthAction::UserRoles, app))
                .permission("read_roles:user"),
            CustomRoute::delete("/roles/users/{user_uuid}", self.handler(AuthAction::RevokeRole, app))
                .permission("revoke_role:user")
                .input(InputSpec::json(TypedSchema::<AssignRoleRequest>::shared()))
                .transactional(),
            CustomRoute::get("/roles/{id}/permissions", self.handler(AuthAction::RolePermissions, app))
                .permission("read_permissions:role"),
            CustomRoute::post("/roles/{id}/permissions", self.handler(AuthAction::AssignPermission, app))
                .permission("assign_permission:role")
                .input(InputSpec::json(TypedSchema::<PermissionIdRequest>::shared()))
                .transactional(),
            CustomRoute::delete("/roles/{id}/permissions", self.handler(AuthAction::RevokePermission, app))
                .permission("revoke_permission:role")
                .input(InputSpec::json(TypedSchema::<PermissionIdRequest>::shared()))
                .transactional(),
        ]
    }

    /// Every user, role, permission and auth route under the configured
    /// url prefix
    pub fn build(&self, app: &AppContext) -> Router {
        let users = CrudRoutes::new(self.auth.users().clone(), "user")
            .prefix("/users")
            .id_field(IdField::Uuid)
            .schemas(CrudSchemas::typed::<UserOut, UserCreate, UserUpdate>());
        let roles = CrudRoutes::new(self.auth.roles().clone(), "role")
            .prefix("/roles")
            .id_field(IdField::Id)
            .schemas(CrudSchemas::typed::<RoleOut, RoleCreate, RoleUpdate>());
        let permissions = CrudRoutes::new(self.auth.permissions().clone(), "permission")
            .prefix("/permissions")
            .id_field(IdField::Id)
            .schemas(CrudSchemas::typed::<PermissionOut, PermissionCreate, PermissionUpdate>());

        tracing::info!("Registering user, role and auth routes");
        users
            .build(app)
            .merge(roles.build(app))
            .merge(permissions.build(app))
            .merge(custom_router(&app.config.url_prefix, self.custom_routes(app), app))
    }
}

/// User routes backed by an [`AuthService`] signing with the app's JWT
/// settings
pub fn user_routes(app: &AppContext) -> Router {
    UserRoutes::new(Arc::new(AuthService::new(&app.config.jwt))).build(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::bootstrap::seed_default_auth;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_and_me() {
        let app = AppContext::in_memory();
        let auth = Arc::new(AuthService::new(&app.config.jwt));
        seed_default_auth(app.storage.as_ref(), &auth, "admin", "adminpass1")
            .await
            .unwrap();
        let router = UserRoutes::new(auth).build(&app);

        let response = router
            .clone()
            .oneshot(post(
                "/api/v1/auth/login",
                json!({ "username": "admin", "password": "adminpass1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["user"].get("password_hash").is_none());
        let token = body["access_token"].as_str().unwrap().to_string();

        let response = router
            .oneshot(
                Request::get("/api/v1/auth/me")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["username"], "admin");
    }

    #[tokio::test]
    async fn test_bad_login_is_unauthorized() {
        let app = AppContext::in_memory();
        let router = user_routes(&app);

        let response = router
            .oneshot(post(
                "/api/v1/auth/login",
                json!({ "username": "ghost", "password": "whatever1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "Invalid credentials.");
    }

    #[tokio::test]
    async fn test_logout_is_public() {
        let router = user_routes(&AppContext::in_memory());
        let response = router
            .oneshot(post("/api/v1/auth/logout", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "Logged out");
    }
}

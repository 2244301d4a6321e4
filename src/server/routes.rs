//! CRUD route generation
//!
//! [`CrudRoutes`] wires a [`CrudService`] into up to eight REST routes. Each
//! route is described by a [`RouteName`], configured by a [`RouteConfig`] and
//! compiled once into a [`Pipeline`] when the router is built.
//!
//! ```rust,ignore
//! let widgets = CrudRoutes::new(CrudService::<Widget>::new(), "widget")
//!     .prefix("/widgets")
//!     .schemas(CrudSchemas::typed::<WidgetOut, WidgetIn, WidgetPatch>())
//!     .enable(RouteName::Restore);
//! ```

use super::context::AppContext;
use super::entity_registry::EntityDescriptor;
use super::pipeline::{
    Endpoint, Handler, Middleware, Pipeline, Reply, RequestContext, RouteOptions,
};
use crate::config::{PaginationConfig, RouteSettings};
use crate::core::entity::{DeletedState, Entity, EntityRef, IdField};
use crate::core::error::CrudError;
use crate::core::filter::FilterPolicy;
use crate::core::schema::{CrudSchemas, InputSpec, ListQuerySchema, Schema};
use crate::core::service::{CrudService, DefaultHooks, ServiceHooks};
use async_trait::async_trait;
use axum::Router;
use axum::routing::MethodFilter;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The generated routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteName {
    List,
    ListDeleted,
    Get,
    Create,
    Update,
    Delete,
    Restore,
    ForceDelete,
}

impl RouteName {
    pub const ALL: [RouteName; 8] = [
        RouteName::List,
        RouteName::ListDeleted,
        RouteName::Get,
        RouteName::Create,
        RouteName::Update,
        RouteName::Delete,
        RouteName::Restore,
        RouteName::ForceDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteName::List => "list",
            RouteName::ListDeleted => "list_deleted",
            RouteName::Get => "get",
            RouteName::Create => "create",
            RouteName::Update => "update",
            RouteName::Delete => "delete",
            RouteName::Restore => "restore",
            RouteName::ForceDelete => "force_delete",
        }
    }

    pub fn method(&self) -> MethodFilter {
        match self {
            RouteName::List | RouteName::ListDeleted | RouteName::Get => MethodFilter::GET,
            RouteName::Create | RouteName::Restore => MethodFilter::POST,
            RouteName::Update => MethodFilter::PATCH,
            RouteName::Delete | RouteName::ForceDelete => MethodFilter::DELETE,
        }
    }

    /// Path below the entity prefix. The root is the empty string.
    pub fn suffix(&self) -> &'static str {
        match self {
            RouteName::List | RouteName::Create => "",
            RouteName::ListDeleted => "/deleted",
            RouteName::Get | RouteName::Update | RouteName::Delete => "/{id}",
            RouteName::Restore => "/{id}/restore",
            RouteName::ForceDelete => "/{id}/force",
        }
    }

    pub fn default_enabled(&self) -> bool {
        !matches!(
            self,
            RouteName::ListDeleted | RouteName::Restore | RouteName::ForceDelete
        )
    }

    /// `<route>:<entity>` for every route except `list` and `get`
    pub fn default_permission(&self, entity: &str) -> Option<String> {
        match self {
            RouteName::List | RouteName::Get => None,
            other => Some(format!("{}:{}", other.as_str(), entity)),
        }
    }

    /// Whether the route writes and therefore commits
    pub fn transactional(&self) -> bool {
        !matches!(
            self,
            RouteName::List | RouteName::ListDeleted | RouteName::Get
        )
    }
}

impl fmt::Display for RouteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouteName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("unknown route '{}'", s))
    }
}

/// Configuration of one generated route. Unset values keep the route's
/// defaults.
#[derive(Clone, Default)]
pub struct RouteConfig {
    pub enabled: Option<bool>,
    pub auth_required: Option<bool>,
    /// `Some(None)` removes the default permission
    pub permission: Option<Option<String>>,
    /// Custom middleware, run nearest the handler; the first is outermost
    pub middleware: Vec<Arc<dyn Middleware>>,
    /// Replaces the route's default input schemas
    pub input: Option<Vec<InputSpec>>,
    /// Replaces the main schema when dumping responses
    pub output: Option<Arc<dyn Schema>>,
}

impl RouteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Serve the route without authentication
    pub fn public(mut self) -> Self {
        self.auth_required = Some(false);
        self
    }

    pub fn auth_required(mut self, required: bool) -> Self {
        self.auth_required = Some(required);
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(Some(permission.into()));
        self
    }

    pub fn no_permission(mut self) -> Self {
        self.permission = Some(None);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn input(mut self, inputs: Vec<InputSpec>) -> Self {
        self.input = Some(inputs);
        self
    }

    pub fn output(mut self, schema: Arc<dyn Schema>) -> Self {
        self.output = Some(schema);
        self
    }

    /// Overlay the values present in `settings`
    pub fn apply(&mut self, settings: &RouteSettings) {
        if let Some(enabled) = settings.enabled {
            self.enabled = Some(enabled);
        }
        if let Some(auth_required) = settings.auth_required {
            self.auth_required = Some(auth_required);
        }
        if let Some(permission) = &settings.permission {
            self.permission = Some(permission.clone());
        }
    }
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("enabled", &self.enabled)
            .field("auth_required", &self.auth_required)
            .field("permission", &self.permission)
            .field("middleware", &self.middleware.len())
            .field("input", &self.input)
            .field("output", &self.output.is_some())
            .finish()
    }
}

/// Per-route configuration of one entity
#[derive(Debug, Clone, Default)]
pub struct RoutesConfig {
    routes: HashMap<RouteName, RouteConfig>,
}

impl RoutesConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, name: RouteName, config: RouteConfig) -> Self {
        self.routes.insert(name, config);
        self
    }

    pub fn get(&self, name: RouteName) -> Option<&RouteConfig> {
        self.routes.get(&name)
    }

    pub fn get_mut(&mut self, name: RouteName) -> &mut RouteConfig {
        self.routes.entry(name).or_default()
    }

    /// Overlay settings loaded from configuration, keyed by route name
    pub fn merge_settings(&mut self, settings: &IndexMap<String, RouteSettings>) {
        for (name, route_settings) in settings {
            match name.parse::<RouteName>() {
                Ok(route) => self.get_mut(route).apply(route_settings),
                Err(reason) => tracing::warn!(route = %name, %reason, "Ignoring route settings"),
            }
        }
    }
}

/// CRUD routes for one entity type
pub struct CrudRoutes<M: Entity, H: ServiceHooks<M> = DefaultHooks> {
    service: Arc<CrudService<M, H>>,
    schemas: CrudSchemas,
    entity: String,
    prefix: String,
    id_field: IdField,
    routes: RoutesConfig,
}

impl<M: Entity, H: ServiceHooks<M>> CrudRoutes<M, H> {
    /// Routes for `entity` mounted at `/<entity>`
    pub fn new(service: impl Into<Arc<CrudService<M, H>>>, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Self {
            service: service.into(),
            schemas: CrudSchemas::default(),
            prefix: format!("/{}", entity),
            entity,
            id_field: IdField::default(),
            routes: RoutesConfig::default(),
        }
    }

    pub fn schemas(mut self, schemas: CrudSchemas) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_matches('/');
        self.prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        };
        self
    }

    pub fn id_field(mut self, id_field: IdField) -> Self {
        self.id_field = id_field;
        self
    }

    pub fn routes(mut self, routes: RoutesConfig) -> Self {
        self.routes = routes;
        self
    }

    /// Replace the configuration of one route
    pub fn configure(mut self, name: RouteName, config: RouteConfig) -> Self {
        self.routes = self.routes.route(name, config);
        self
    }

    /// Turn on a route that is disabled by default
    pub fn enable(mut self, name: RouteName) -> Self {
        self.routes.get_mut(name).enabled = Some(true);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn service(&self) -> &Arc<CrudService<M, H>> {
        &self.service
    }

    /// Effective options of every enabled route, after configuration file
    /// overrides
    fn resolve(&self, app: &AppContext) -> Vec<(RouteName, RouteOptions, Option<Arc<dyn Schema>>)> {
        let mut routes = self.routes.clone();
        if let Some(settings) = app.config.routes_for(&self.entity) {
            routes.merge_settings(settings);
        }

        RouteName::ALL
            .into_iter()
            .filter_map(|name| {
                let config = routes.get(name).cloned().unwrap_or_default();
                if !config.enabled.unwrap_or_else(|| name.default_enabled()) {
                    return None;
                }
                let options = RouteOptions {
                    label: format!("{}.{}", self.entity, name),
                    auth_required: config.auth_required.unwrap_or(true),
                    permission: match config.permission {
                        Some(permission) => permission,
                        None => name.default_permission(&self.entity),
                    },
                    inputs: config
                        .input
                        .unwrap_or_else(|| self.default_inputs(name, &app.config.pagination)),
                    transactional: name.transactional(),
                    middleware: config.middleware,
                };
                Some((name, options, config.output))
            })
            .collect()
    }

    fn default_inputs(&self, name: RouteName, limits: &PaginationConfig) -> Vec<InputSpec> {
        match name {
            RouteName::List | RouteName::ListDeleted => {
                let query = self
                    .schemas
                    .query
                    .clone()
                    .unwrap_or_else(|| Arc::new(ListQuerySchema::new(limits.clone())));
                vec![InputSpec::query(query)]
            }
            RouteName::Create => vec![InputSpec::json(self.schemas.input.clone())],
            RouteName::Update => vec![InputSpec::json(self.schemas.update.clone()).partial()],
            _ => Vec::new(),
        }
    }

    /// Compile every enabled route into an axum router
    pub fn build(&self, app: &AppContext) -> Router {
        let base = format!("{}{}", app.config.url_prefix.trim_end_matches('/'), self.prefix);
        let mut router = Router::new();

        for (name, options, output) in self.resolve(app) {
            let handler = CrudHandler {
                route: name,
                service: self.service.clone(),
                entity: self.entity.clone(),
                id_field: self.id_field,
                output: output.unwrap_or_else(|| self.schemas.main.clone()),
                limits: app.config.pagination.clone(),
                policy: app.config.filters.policy,
            };
            let pipeline = Pipeline::assemble(Arc::new(handler), &options, app);
            let endpoint = Endpoint::new(pipeline, app.storage.clone());

            let path = format!("{}{}", base, name.suffix());
            tracing::debug!(
                entity = %self.entity,
                route = %name,
                path = %path,
                permission = ?options.permission,
                "Registering route"
            );
            if name.suffix().is_empty() {
                // Root routes answer with and without the trailing slash
                let root = endpoint.into_method_router(name.method(), "/");
                if !path.is_empty() {
                    router = router.route(&path, root.clone());
                }
                router = router.route(&format!("{}/", path), root);
            } else {
                router = router.route(&path, endpoint.into_method_router(name.method(), &path));
            }
        }
        router
    }
}

impl<M: Entity, H: ServiceHooks<M>> EntityDescriptor for CrudRoutes<M, H> {
    fn entity_type(&self) -> &str {
        &self.entity
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn build_routes(&self, app: &AppContext) -> Router {
        self.build(app)
    }
}

struct CrudHandler<M: Entity, H: ServiceHooks<M>> {
    route: RouteName,
    service: Arc<CrudService<M, H>>,
    entity: String,
    id_field: IdField,
    output: Arc<dyn Schema>,
    limits: PaginationConfig,
    /// Forced on listings when set; otherwise the repository decides
    policy: Option<FilterPolicy>,
}

impl<M: Entity, H: ServiceHooks<M>> CrudHandler<M, H> {
    /// Malformed identifiers are reported as not found
    fn key(&self, ctx: &RequestContext) -> Result<EntityRef, CrudError> {
        let raw = ctx.require_path_id(M::entity_name())?;
        self.id_field
            .parse(raw)
            .ok_or_else(|| CrudError::not_found(M::entity_name(), raw))
    }

    fn dump(&self, entity: &M) -> Result<Value, CrudError> {
        let value = serde_json::to_value(entity).map_err(|e| CrudError::Internal(e.to_string()))?;
        self.output.dump(value)
    }

    fn label(&self) -> String {
        let mut chars = self.entity.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    async fn list(
        &self,
        ctx: &mut RequestContext,
        forced: Option<DeletedState>,
    ) -> Result<Reply, CrudError> {
        let raw = if ctx.inputs.is_empty() {
            Value::Object(ctx.query.clone())
        } else {
            Value::Object(ctx.data())
        };
        let mut params = ListQuerySchema::new(self.limits.clone()).params(raw)?;
        if let Some(state) = forced {
            params.deleted_state = state;
        }
        if let Some(policy) = self.policy {
            params.policy = Some(policy);
        }

        let page = self.service.paginate(&mut ctx.uow, params).await?;
        let page = page.try_map(|entity| self.dump(&entity))?;
        let body = serde_json::to_value(page.into_response())
            .map_err(|e| CrudError::Internal(e.to_string()))?;
        Ok(Reply::ok(body))
    }
}

/// `deleted_state` query parameter of a single-entity lookup
fn requested_state(ctx: &RequestContext) -> Result<DeletedState, CrudError> {
    match ctx.query.get("deleted_state").and_then(Value::as_str) {
        Some(raw) => raw
            .parse()
            .map_err(|reason: String| CrudError::invalid("deleted_state", reason)),
        None => Ok(DeletedState::Active),
    }
}

#[async_trait]
impl<M: Entity, H: ServiceHooks<M>> Handler for CrudHandler<M, H> {
    async fn call(&self, ctx: &mut RequestContext) -> Result<Reply, CrudError> {
        match self.route {
            RouteName::List => self.list(ctx, None).await,
            RouteName::ListDeleted => self.list(ctx, Some(DeletedState::DeletedOnly)).await,
            RouteName::Get => {
                let key = self.key(ctx)?;
                let state = requested_state(ctx)?;
                let entity = self
                    .service
                    .get(&mut ctx.uow, key, state)
                    .await?
                    .ok_or_else(|| CrudError::not_found(M::entity_name(), key))?;
                Ok(Reply::ok(self.dump(&entity)?))
            }
            RouteName::Create => {
                let data = ctx.data();
                let entity = self.service.create(&mut ctx.uow, data).await?;
                Ok(Reply::created(self.dump(&entity)?))
            }
            RouteName::Update => {
                let key = self.key(ctx)?;
                let data = ctx.data();
                if data.is_empty() {
                    return Err(CrudError::invalid(
                        "_schema",
                        "At least one field must be provided for update.",
                    ));
                }
                let entity = self.service.update(&mut ctx.uow, key, data).await?;
                Ok(Reply::ok(self.dump(&entity)?))
            }
            RouteName::Delete => {
                let key = self.key(ctx)?;
                self.service
                    .delete(&mut ctx.uow, key, ctx.body.as_ref())
                    .await?;
                Ok(Reply::message(format!("{} deleted successfully.", self.label())))
            }
            RouteName::Restore => {
                let key = self.key(ctx)?;
                let entity = self.service.restore(&mut ctx.uow, key).await?;
                Ok(Reply::ok(self.dump(&entity)?))
            }
            RouteName::ForceDelete => {
                let key = self.key(ctx)?;
                self.service
                    .force_delete(&mut ctx.uow, key, ctx.body.as_ref())
                    .await?;
                Ok(Reply::message(format!("{} permanently deleted.", self.label())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrudkitConfig;
    use crate::storage::InMemoryStorage;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Gadget {
        id: i64,
        uuid: Uuid,
        name: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    }

    crate::impl_model!(
        Gadget,
        table = "gadgets",
        features = [uuid, timestamps, soft_delete],
        fields = { name: String }
    );

    fn app_with(config: CrudkitConfig) -> AppContext {
        AppContext::new(Arc::new(InMemoryStorage::new()), config)
    }

    fn names(routes: &CrudRoutes<Gadget>, app: &AppContext) -> Vec<RouteName> {
        routes.resolve(app).into_iter().map(|(name, _, _)| name).collect()
    }

    #[test]
    fn test_route_name_round_trip() {
        for name in RouteName::ALL {
            assert_eq!(name.as_str().parse::<RouteName>().unwrap(), name);
        }
        assert!("archive".parse::<RouteName>().is_err());
    }

    #[test]
    fn test_default_permissions() {
        assert_eq!(RouteName::List.default_permission("gadget"), None);
        assert_eq!(RouteName::Get.default_permission("gadget"), None);
        assert_eq!(
            RouteName::ForceDelete.default_permission("gadget").as_deref(),
            Some("force_delete:gadget")
        );
        assert_eq!(
            RouteName::ListDeleted.default_permission("gadget").as_deref(),
            Some("list_deleted:gadget")
        );
    }

    #[test]
    fn test_lifecycle_routes_are_opt_in() {
        let app = AppContext::in_memory();
        let routes = CrudRoutes::new(CrudService::<Gadget>::new(), "gadget");
        assert_eq!(
            names(&routes, &app),
            vec![
                RouteName::List,
                RouteName::Get,
                RouteName::Create,
                RouteName::Update,
                RouteName::Delete
            ]
        );

        let routes = routes.enable(RouteName::Restore);
        assert!(names(&routes, &app).contains(&RouteName::Restore));
    }

    #[test]
    fn test_configuration_file_overrides_code() {
        let config = CrudkitConfig::from_yaml_str(
            r#"
routes:
  gadget:
    delete: { enabled: false }
    create: { permission: null, auth_required: false }
    force_delete: { enabled: true }
    bogus: { enabled: true }
"#,
        )
        .unwrap();
        let app = app_with(config);
        let routes = CrudRoutes::new(CrudService::<Gadget>::new(), "gadget")
            .configure(RouteName::Create, RouteConfig::new().permission("make:gadget"));

        let resolved = routes.resolve(&app);
        let names: Vec<_> = resolved.iter().map(|(name, _, _)| *name).collect();
        assert!(!names.contains(&RouteName::Delete));
        assert!(names.contains(&RouteName::ForceDelete));

        let (_, create, _) = resolved
            .iter()
            .find(|(name, _, _)| *name == RouteName::Create)
            .unwrap();
        assert_eq!(create.permission, None);
        assert!(!create.auth_required);
        assert!(create.transactional);
        assert_eq!(create.inputs.len(), 1);
    }

    #[test]
    fn test_prefix_is_normalized() {
        let routes = CrudRoutes::new(CrudService::<Gadget>::new(), "gadget").prefix("gadgets/");
        assert_eq!(EntityDescriptor::prefix(&routes), "/gadgets");
        assert_eq!(routes.entity(), "gadget");
    }

    #[tokio::test]
    async fn test_handler_messages_use_entity_label() {
        let app = AppContext::in_memory();
        let service = Arc::new(CrudService::<Gadget>::new());
        let handler = CrudHandler {
            route: RouteName::Delete,
            service: service.clone(),
            entity: "gadget".into(),
            id_field: IdField::Id,
            output: Arc::new(crate::core::schema::PassthroughSchema),
            limits: PaginationConfig::default(),
            policy: None,
        };

        let mut ctx = RequestContext::new(app.begin().await.unwrap());
        let created = service
            .create(&mut ctx.uow, serde_json::json!({ "name": "a" }).as_object().unwrap().clone())
            .await
            .unwrap();
        ctx.path_id = Some(created.id.to_string());

        let reply = handler.call(&mut ctx).await.unwrap();
        assert_eq!(reply.body["message"], "Gadget deleted successfully.");

        ctx.path_id = Some("not-a-number".into());
        assert!(matches!(
            handler.call(&mut ctx).await,
            Err(CrudError::NotFound { .. })
        ));
    }
}

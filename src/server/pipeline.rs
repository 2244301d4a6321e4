//! Request pipeline: middleware chain around a handler
//!
//! Every route is compiled once, at registration, into a [`Pipeline`]:
//!
//! ```text
//! [activity log] → auth → permission → validation → transaction → custom middleware → handler
//! ```
//!
//! Each stage receives the [`RequestContext`] and a [`Next`] it may call to
//! continue. Errors short-circuit and are rendered by `IntoResponse for
//! CrudError`.

use super::context::AppContext;
use crate::core::auth::{Claims, TokenType, TokenVerifier, bearer_token, require_permission};
use crate::core::error::CrudError;
use crate::core::schema::{InputLocation, InputSpec};
use crate::core::uow::UnitOfWork;
use crate::storage::Storage;
use async_trait::async_trait;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter, on};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Instant;

/// Everything a handler can see about one request
pub struct RequestContext {
    /// Set once the request authenticated
    pub claims: Option<Claims>,
    pub headers: HeaderMap,
    /// Raw value of the route's path parameter
    pub path_id: Option<String>,
    /// Path parameters by name
    pub path: Map<String, Value>,
    /// Query parameters, all as strings
    pub query: Map<String, Value>,
    /// Decoded JSON body
    pub body: Option<Value>,
    /// Schema-loaded inputs keyed by argument name
    pub inputs: IndexMap<String, Value>,
    /// The request's unit of work
    pub uow: UnitOfWork,
}

impl RequestContext {
    pub fn new(uow: UnitOfWork) -> Self {
        Self {
            claims: None,
            headers: HeaderMap::new(),
            path_id: None,
            path: Map::new(),
            query: Map::new(),
            body: None,
            inputs: IndexMap::new(),
            uow,
        }
    }

    /// Claims of the authenticated caller
    pub fn claims(&self) -> Result<&Claims, CrudError> {
        self.claims.as_ref().ok_or(CrudError::AuthRequired)
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Every loaded object input merged into one map, in schema order
    pub fn data(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for value in self.inputs.values() {
            if let Value::Object(fields) = value {
                merged.extend(fields.clone());
            }
        }
        merged
    }

    /// The path id, or `NotFound` for `entity` when absent
    pub fn require_path_id(&self, entity: &str) -> Result<&str, CrudError> {
        self.path_id
            .as_deref()
            .ok_or_else(|| CrudError::not_found(entity, ""))
    }
}

/// A successful response
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self::with_status(StatusCode::OK, body)
    }

    pub fn created(body: Value) -> Self {
        Self::with_status(StatusCode::CREATED, body)
    }

    pub fn with_status(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    /// `{"message": ...}` with 200
    pub fn message(message: impl Into<String>) -> Self {
        Self::ok(json!({ "message": message.into() }))
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// The innermost stage of a pipeline
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &mut RequestContext) -> Result<Reply, CrudError>;
}

/// A pipeline stage wrapping everything after it
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Reply, CrudError>;
}

/// The remainder of a pipeline
pub struct Next<'a> {
    handler: &'a dyn Handler,
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Run the remaining stages
    pub fn run<'b>(self, ctx: &'b mut RequestContext) -> BoxFuture<'b, Result<Reply, CrudError>>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((stage, rest)) => stage.handle(
                ctx,
                Next {
                    handler: self.handler,
                    rest,
                },
            ),
            None => self.handler.call(ctx),
        }
    }
}

/// Handler built from a closure returning a boxed future
pub struct FnHandler<F>(F);

/// Wrap a closure as a [`Handler`]
///
/// ```rust,ignore
/// let ping = handler_fn(|_ctx| Box::pin(async { Ok(Reply::message("pong")) }));
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'c> Fn(&'c mut RequestContext) -> BoxFuture<'c, Result<Reply, CrudError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'c> Fn(&'c mut RequestContext) -> BoxFuture<'c, Result<Reply, CrudError>>
        + Send
        + Sync
        + 'static,
{
    async fn call(&self, ctx: &mut RequestContext) -> Result<Reply, CrudError> {
        (self.0)(ctx).await
    }
}

/// Verify the bearer token and store the claims on the context
async fn authenticate(verifier: &dyn TokenVerifier, ctx: &mut RequestContext) -> Result<(), CrudError> {
    let token = bearer_token(&ctx.headers)?;
    let claims = verifier.verify(token)?;
    if claims.token_type != TokenType::Access {
        return Err(CrudError::InvalidToken("expected an access token".into()));
    }
    tracing::debug!(sub = %claims.sub, "Request authenticated");
    ctx.uow.set_actor(claims.sub.clone());
    ctx.claims = Some(claims);
    Ok(())
}

/// Requires a valid access token
pub struct AuthMiddleware {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthMiddleware {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Reply, CrudError> {
        authenticate(self.verifier.as_ref(), ctx).await?;
        next.run(ctx).await
    }
}

/// Requires one permission, authenticating first if nothing did yet
pub struct PermissionMiddleware {
    permission: String,
    verifier: Arc<dyn TokenVerifier>,
}

impl PermissionMiddleware {
    pub fn new(permission: impl Into<String>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            permission: permission.into(),
            verifier,
        }
    }
}

#[async_trait]
impl Middleware for PermissionMiddleware {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Reply, CrudError> {
        if ctx.claims.is_none() {
            authenticate(self.verifier.as_ref(), ctx).await?;
        }
        require_permission(ctx.claims()?, &self.permission)?;
        next.run(ctx).await
    }
}

/// Loads each input through its schema into `ctx.inputs`
pub struct ValidationMiddleware {
    inputs: Vec<InputSpec>,
}

impl ValidationMiddleware {
    pub fn new(inputs: Vec<InputSpec>) -> Self {
        Self { inputs }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Reply, CrudError> {
        for spec in &self.inputs {
            let raw = match spec.location {
                InputLocation::Json => ctx.body.clone().unwrap_or(Value::Null),
                InputLocation::Query => Value::Object(ctx.query.clone()),
                InputLocation::Path => Value::Object(ctx.path.clone()),
            };
            let loaded = spec.schema.load(raw, spec.partial)?;
            ctx.inputs.insert(spec.key(), loaded);
        }
        next.run(ctx).await
    }
}

/// Commits the unit of work when the rest of the pipeline succeeds and
/// rolls it back otherwise
pub struct TransactionMiddleware;

#[async_trait]
impl Middleware for TransactionMiddleware {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Reply, CrudError> {
        match next.run(ctx).await {
            Ok(reply) => {
                ctx.uow.commit().await?;
                Ok(reply)
            }
            Err(err) => {
                if let Err(rollback) = ctx.uow.rollback().await {
                    tracing::error!(error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Logs the start, end and failure of every call it wraps.
///
/// Bodies are never logged; they may carry credentials.
pub struct ActivityLog {
    route: String,
}

impl ActivityLog {
    pub fn new(route: impl Into<String>) -> Self {
        Self { route: route.into() }
    }
}

#[async_trait]
impl Middleware for ActivityLog {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Reply, CrudError> {
        let query: Vec<&str> = ctx.query.keys().map(String::as_str).collect();
        tracing::info!(
            route = %self.route,
            path_id = ?ctx.path_id,
            query = ?query,
            "Activity: calling route"
        );
        let started = Instant::now();
        let outcome = next.run(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(reply) => tracing::info!(
                route = %self.route,
                actor = ?ctx.uow.actor(),
                status = reply.status.as_u16(),
                elapsed_ms,
                "Activity: route finished"
            ),
            Err(err) => tracing::error!(
                route = %self.route,
                actor = ?ctx.uow.actor(),
                error_code = err.error_code(),
                error = %err,
                elapsed_ms,
                "Activity: route failed"
            ),
        }
        outcome
    }
}

/// Options shared by generated and custom routes
#[derive(Clone)]
pub struct RouteOptions {
    /// Name used in activity logs
    pub label: String,
    pub auth_required: bool,
    pub permission: Option<String>,
    pub inputs: Vec<InputSpec>,
    pub transactional: bool,
    /// Runs nearest the handler; the first entry is outermost
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            label: String::new(),
            auth_required: true,
            permission: None,
            inputs: Vec::new(),
            transactional: false,
            middleware: Vec::new(),
        }
    }
}

/// A handler with its middleware, compiled once
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            stages: Vec::new(),
            handler,
        }
    }

    /// Append a stage inside the ones already added
    pub fn layer(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Build the standard stage order from route options, wrapped in an
    /// [`ActivityLog`] when `logging.activity` is on
    pub fn assemble(handler: Arc<dyn Handler>, options: &RouteOptions, app: &AppContext) -> Self {
        let mut pipeline = Self::new(handler);
        if app.config.logging.activity {
            pipeline = pipeline.layer(Arc::new(ActivityLog::new(options.label.clone())));
        }
        if options.auth_required {
            pipeline = pipeline.layer(Arc::new(AuthMiddleware::new(app.verifier.clone())));
        }
        if let Some(permission) = &options.permission {
            pipeline = pipeline.layer(Arc::new(PermissionMiddleware::new(
                permission.clone(),
                app.verifier.clone(),
            )));
        }
        if !options.inputs.is_empty() {
            pipeline = pipeline.layer(Arc::new(ValidationMiddleware::new(options.inputs.clone())));
        }
        if options.transactional {
            pipeline = pipeline.layer(Arc::new(TransactionMiddleware));
        }
        for stage in &options.middleware {
            pipeline = pipeline.layer(stage.clone());
        }
        pipeline
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn execute(&self, ctx: &mut RequestContext) -> Result<Reply, CrudError> {
        Next {
            handler: self.handler.as_ref(),
            rest: &self.stages,
        }
        .run(ctx)
        .await
    }
}

/// A pipeline bound to the storage it opens units of work on
#[derive(Clone)]
pub struct Endpoint {
    pipeline: Arc<Pipeline>,
    storage: Arc<dyn Storage>,
}

impl Endpoint {
    pub fn new(pipeline: Pipeline, storage: Arc<dyn Storage>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            storage,
        }
    }

    /// Run one request through the pipeline
    pub async fn dispatch(
        &self,
        path: Option<(String, String)>,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        match self.try_dispatch(path, query, headers, body).await {
            Ok(reply) => reply.into_response(),
            Err(err) => err.into_response(),
        }
    }

    async fn try_dispatch(
        &self,
        path: Option<(String, String)>,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Reply, CrudError> {
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(
                serde_json::from_slice::<Value>(&body)
                    .map_err(|e| CrudError::invalid("_schema", format!("Invalid JSON body: {}", e)))?,
            )
        };

        let uow = UnitOfWork::begin(self.storage.as_ref()).await?;
        let mut ctx = RequestContext::new(uow);
        ctx.headers = headers;
        ctx.body = body;
        ctx.query = query
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        if let Some((name, value)) = path {
            ctx.path.insert(name, Value::String(value.clone()));
            ctx.path_id = Some(value);
        }

        self.pipeline.execute(&mut ctx).await
    }

    /// An axum method router for `method` on a path template with at most
    /// one `{param}`
    pub fn into_method_router(self, method: MethodFilter, template: &str) -> MethodRouter {
        match path_param(template) {
            Some(name) => on(
                method,
                move |Path(value): Path<String>,
                      Query(query): Query<Vec<(String, String)>>,
                      headers: HeaderMap,
                      body: Bytes| {
                    let endpoint = self.clone();
                    let name = name.clone();
                    async move { endpoint.dispatch(Some((name, value)), query, headers, body).await }
                },
            ),
            None => on(
                method,
                move |Query(query): Query<Vec<(String, String)>>, headers: HeaderMap, body: Bytes| {
                    let endpoint = self.clone();
                    async move { endpoint.dispatch(None, query, headers, body).await }
                },
            ),
        }
    }
}

/// Name of the `{param}` in a path template
fn path_param(template: &str) -> Option<String> {
    let start = template.find('{')?;
    let end = template[start..].find('}')? + start;
    Some(template[start + 1..end].to_string())
}

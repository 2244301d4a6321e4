//! Hand-written routes that run through the same pipeline as generated ones

use super::context::AppContext;
use super::pipeline::{Endpoint, Handler, Middleware, Pipeline, Reply, RequestContext, RouteOptions};
use crate::core::error::CrudError;
use crate::core::schema::InputSpec;
use async_trait::async_trait;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::MethodFilter;
use std::sync::Arc;

/// One custom route: a handler plus its pipeline options.
///
/// The path may contain at most one `{param}`; its value is exposed as
/// `RequestContext::path_id` and under its name in `RequestContext::path`.
pub struct CustomRoute {
    method: MethodFilter,
    path: String,
    handler: Arc<dyn Handler>,
    options: RouteOptions,
    status: Option<StatusCode>,
}

impl CustomRoute {
    /// Authenticated, non-transactional route without a permission
    pub fn new(method: MethodFilter, path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            method,
            path: path.into(),
            handler,
            options: RouteOptions::default(),
            status: None,
        }
    }

    pub fn get(path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::new(MethodFilter::GET, path, handler)
    }

    pub fn post(path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::new(MethodFilter::POST, path, handler)
    }

    pub fn put(path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::new(MethodFilter::PUT, path, handler)
    }

    pub fn patch(path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::new(MethodFilter::PATCH, path, handler)
    }

    pub fn delete(path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::new(MethodFilter::DELETE, path, handler)
    }

    pub fn public(mut self) -> Self {
        self.options.auth_required = false;
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.options.permission = Some(permission.into());
        self
    }

    pub fn input(mut self, input: InputSpec) -> Self {
        self.options.inputs.push(input);
        self
    }

    pub fn transactional(mut self) -> Self {
        self.options.transactional = true;
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.options.middleware.push(middleware);
        self
    }

    /// Status of a successful reply, replacing whatever the handler chose
    /// Name used in activity logs; defaults to the mounted path
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.options.label = label.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &RouteOptions {
        &self.options
    }

    /// Compile the route and add it to `router` under `base`
    pub fn mount(mut self, router: Router, base: &str, app: &AppContext) -> Router {
        let handler: Arc<dyn Handler> = match self.status {
            Some(status) => Arc::new(WithStatus {
                inner: self.handler,
                status,
            }),
            None => self.handler,
        };
        let path = format!("{}{}", base.trim_end_matches('/'), self.path);
        if self.options.label.is_empty() {
            self.options.label = path.clone();
        }
        tracing::debug!(path = %path, permission = ?self.options.permission, "Registering custom route");

        let pipeline = Pipeline::assemble(handler, &self.options, app);
        let endpoint = Endpoint::new(pipeline, app.storage.clone());
        router.route(&path, endpoint.into_method_router(self.method, &path))
    }
}

/// Mount every route under `base`
pub fn custom_router(
    base: &str,
    routes: impl IntoIterator<Item = CustomRoute>,
    app: &AppContext,
) -> Router {
    routes
        .into_iter()
        .fold(Router::new(), |router, route| route.mount(router, base, app))
}

struct WithStatus {
    inner: Arc<dyn Handler>,
    status: StatusCode,
}

#[async_trait]
impl Handler for WithStatus {
    async fn call(&self, ctx: &mut RequestContext) -> Result<Reply, CrudError> {
        let mut reply = self.inner.call(ctx).await?;
        reply.status = self.status;
        Ok(reply)
    }
}

//! HTTP surface: route generation, the request pipeline and the server builder
//!
//! - [`CrudRoutes`] generates the CRUD route set of one entity
//! - [`CustomRoute`] runs a hand-written handler through the same pipeline
//! - [`ServerBuilder`] assembles everything into one axum router
//! - [`RateLimiter`] caps requests per client

pub mod builder;
pub mod context;
pub mod custom;
pub mod entity_registry;
pub mod pipeline;
pub mod rate_limit;
pub mod routes;

pub use builder::ServerBuilder;
pub use context::AppContext;
pub use custom::{CustomRoute, custom_router};
pub use entity_registry::{EntityDescriptor, EntityRegistry};
pub use pipeline::{
    ActivityLog, AuthMiddleware, Endpoint, Handler, Middleware, Next, PermissionMiddleware, Pipeline, Reply,
    RequestContext, RouteOptions, TransactionMiddleware, ValidationMiddleware, handler_fn,
};
pub use rate_limit::RateLimiter;
pub use routes::{CrudRoutes, RouteConfig, RouteName, RoutesConfig};

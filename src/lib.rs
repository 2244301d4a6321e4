//! # crudkit
//!
//! A generic CRUD and authentication toolkit for building RESTful APIs with
//! axum.
//!
//! ## Features
//!
//! - **Entity contract**: declare a struct, implement [`Entity`](core::Entity)
//!   with [`impl_model!`] and get filtering, sorting and storage for free
//! - **Filter grammar**: `?price=gte__10,lt__100&name=like__gadget` on every
//!   list route, with strict or permissive handling of unknown fields
//! - **Soft-delete lifecycle**: delete, restore, force delete (with an
//!   archive snapshot) and deleted-only listings
//! - **Hook-driven services**: pre/post hooks around every operation, all
//!   inside one unit of work
//! - **Route generation**: the full route set per entity, each one enabled,
//!   secured and validated through code or YAML configuration
//! - **Users module**: Argon2 passwords, JWT login/refresh, roles and
//!   permissions, and an idempotent admin seed
//! - **Storage**: in-memory by default, PostgreSQL with the `postgres` feature
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use crudkit::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Widget {
//!     pub id: i64,
//!     pub uuid: Uuid,
//!     pub name: String,
//!     pub created_at: DateTime<Utc>,
//!     pub updated_at: DateTime<Utc>,
//!     pub deleted_at: Option<DateTime<Utc>>,
//! }
//!
//! impl_model!(
//!     Widget,
//!     table = "widgets",
//!     features = [uuid, timestamps, soft_delete],
//!     fields = { name: String },
//! );
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CrudkitConfig::from_yaml_file("crudkit.yaml")?.with_env_overrides();
//!     let _guard = crudkit::logging::init(&config.logging);
//!
//!     ServerBuilder::new()
//!         .with_config(config)
//!         .register(CrudRoutes::new(CrudService::<Widget>::new(), "widget").prefix("/widgets"))
//!         .with_routes(user_routes)
//!         .serve("127.0.0.1:3000")
//!         .await
//! }
//! ```

pub mod config;
pub mod core;
pub mod entities;
pub mod logging;
pub mod server;
pub mod storage;
pub mod users;

/// Re-exports of commonly used types and traits
pub mod prelude {
    // === Core ===
    pub use crate::core::{
        CrudError, CrudSchemas, CrudService, DeletedState, DefaultHooks, Entity, EntityRef,
        FilterMap, FilterPolicy, IdField, InputSpec, ListParams, PaginatedResponse,
        PaginationResult, Repository, ServiceHooks, TypedSchema, UnitOfWork,
        service::apply_changes,
    };

    // === Macros ===
    pub use crate::impl_model;

    // === Storage ===
    pub use crate::storage::{InMemoryStorage, Storage};
    #[cfg(feature = "postgres")]
    pub use crate::storage::PostgresStorage;

    // === Config ===
    pub use crate::config::{CrudkitConfig, JwtConfig, RouteSettings};

    // === Server ===
    pub use crate::server::{
        ActivityLog, AppContext, CrudRoutes, CustomRoute, EntityDescriptor, Handler, Middleware,
        Next, RateLimiter, Reply, RequestContext, RouteConfig, RouteName, RoutesConfig,
        ServerBuilder,
    };

    // === Users ===
    pub use crate::users::{AuthService, UserRoutes, seed_default_auth, user_routes};

    // === External dependencies ===
    pub use async_trait::async_trait;
    pub use chrono::{DateTime, Utc};
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{Map, Value, json};
    pub use uuid::Uuid;

    // === Axum ===
    pub use axum::Router;
}

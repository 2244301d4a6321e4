//! ServerBuilder for fluent API to build HTTP servers

use super::context::AppContext;
use super::custom::CustomRoute;
use super::entity_registry::{EntityDescriptor, EntityRegistry};
use super::rate_limit::{RateLimiter, limit_requests};
use crate::config::CrudkitConfig;
use crate::core::auth::TokenVerifier;
use crate::core::error::{CrudError, ErrorResponse};
use crate::storage::{InMemoryStorage, Storage};
use anyhow::Result;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type RouteGroup = Box<dyn FnOnce(&AppContext) -> Router + Send>;

/// Builder for creating HTTP servers with registered CRUD routes
///
/// # Example
///
/// ```ignore
/// let app = ServerBuilder::new()
///     .with_config(CrudkitConfig::from_yaml_file("crudkit.yaml")?.with_env_overrides())
///     .register(CrudRoutes::new(CrudService::<Widget>::new(), "widget").prefix("/widgets"))
///     .with_routes(users::routes::user_routes)
///     .build()?;
/// ```
pub struct ServerBuilder {
    config: CrudkitConfig,
    storage: Arc<dyn Storage>,
    verifier: Option<Arc<dyn TokenVerifier>>,
    entity_registry: EntityRegistry,
    route_groups: Vec<RouteGroup>,
    custom: Vec<CustomRoute>,
    custom_routes: Vec<Router>,
    cors: Option<CorsLayer>,
    rate_limiter: Option<RateLimiter>,
    service_name: String,
}

impl ServerBuilder {
    /// Default configuration over in-memory storage
    pub fn new() -> Self {
        Self {
            config: CrudkitConfig::default(),
            storage: Arc::new(InMemoryStorage::new()),
            verifier: None,
            entity_registry: EntityRegistry::new(),
            route_groups: Vec::new(),
            custom: Vec::new(),
            custom_routes: Vec::new(),
            cors: None,
            rate_limiter: None,
            service_name: "crudkit".to_string(),
        }
    }

    pub fn with_config(mut self, config: CrudkitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Arc::new(storage);
        self
    }

    pub fn with_shared_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    /// Replace the JWT verifier built from `config.jwt`
    pub fn with_token_verifier(mut self, verifier: impl TokenVerifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Name reported by the health route
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_cors(mut self, cors: CorsLayer) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Limit requests per client, replacing any limit from `config.rate_limit`
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Register the routes of one entity
    pub fn register(mut self, descriptor: impl EntityDescriptor + 'static) -> Self {
        self.entity_registry.register(Box::new(descriptor));
        self
    }

    /// Add routes built against the application context, such as
    /// `users::routes::user_routes`
    pub fn with_routes(mut self, group: impl FnOnce(&AppContext) -> Router + Send + 'static) -> Self {
        self.route_groups.push(Box::new(group));
        self
    }

    /// Add a custom route, mounted under the configured URL prefix
    pub fn with_custom_route(mut self, route: CustomRoute) -> Self {
        self.custom.push(route);
        self
    }

    /// Merge a plain axum router. Its handlers bypass the request pipeline.
    pub fn with_custom_routes(mut self, routes: Router) -> Self {
        self.custom_routes.push(routes);
        self
    }

    /// The context route groups are built against
    pub fn context(&self) -> AppContext {
        let app = AppContext::new(self.storage.clone(), self.config.clone());
        match &self.verifier {
            Some(verifier) => app.with_verifier(verifier.clone()),
            None => app,
        }
    }

    /// Build the final router
    ///
    /// This generates:
    /// - `GET /health`
    /// - routes for every registered entity, route group and custom route
    /// - a 404 fallback rendering the error envelope
    ///
    /// Fails when the configuration has no JWT secret or an unreadable rate
    /// limit.
    pub fn build(self) -> Result<Router> {
        self.config.validate()?;
        let rate_limiter = match self.rate_limiter.clone() {
            Some(limiter) => Some(limiter),
            None if self.config.rate_limit.enabled => {
                Some(RateLimiter::from_config(&self.config.rate_limit)?)
            }
            None => None,
        };
        let app = self.context();
        let service_name = self.service_name.clone();

        let mut router = Router::new()
            .route("/health", get(move || health_check(service_name.clone())))
            .merge(self.entity_registry.build_routes(&app));

        for group in self.route_groups {
            router = router.merge(group(&app));
        }
        for route in self.custom {
            router = route.mount(router, &app.config.url_prefix, &app);
        }
        for custom_router in self.custom_routes {
            router = router.merge(custom_router);
        }

        let mut router = router.fallback(not_found);
        if let Some(limiter) = rate_limiter {
            tracing::info!(limit = %limiter.describe(), "Rate limiting enabled");
            router = router.layer(axum::middleware::from_fn_with_state(limiter, limit_requests));
        }
        let router = router
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(TraceLayer::new_for_http());

        Ok(match self.cors {
            Some(cors) => router.layer(cors),
            None => router,
        })
    }

    /// Serve the application with graceful shutdown
    ///
    /// This will:
    /// - Bind to the provided address
    /// - Start serving requests
    /// - Handle SIGTERM and SIGINT (Ctrl+C) for graceful shutdown
    pub async fn serve(self, addr: &str) -> Result<()> {
        let app = self.build()?;
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Server listening on {}", addr);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn health_check(service: String) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": service
    }))
}

async fn not_found() -> Response {
    let body = ErrorResponse {
        message: "The requested resource was not found.".to_string(),
        error_code: "NOT_FOUND".to_string(),
        details: None,
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "handler panicked".to_string());
    CrudError::Internal(format!("panic: {}", detail)).into_response()
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, initiating graceful shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use crate::config::{JwtConfig, RateLimitConfig};
    use tower::ServiceExt;

    fn configured() -> ServerBuilder {
        ServerBuilder::new().with_config(CrudkitConfig {
            jwt: JwtConfig::ephemeral(),
            ..CrudkitConfig::default()
        })
    }

    async fn call(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_new_creates_empty_builder() {
        let builder = ServerBuilder::new();
        assert!(builder.verifier.is_none());
        assert!(builder.entity_registry.is_empty());
        assert!(builder.custom_routes.is_empty());
        assert_eq!(builder.config, CrudkitConfig::default());
    }

    #[test]
    fn test_with_custom_routes_appends_router() {
        let builder = ServerBuilder::new()
            .with_custom_routes(Router::new())
            .with_custom_routes(Router::new());
        assert_eq!(builder.custom_routes.len(), 2);
    }

    #[tokio::test]
    async fn test_health_route() {
        let router = configured().with_service_name("inventory").build().unwrap();
        let (status, body) = call(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "service": "inventory" }));
    }

    #[tokio::test]
    async fn test_unknown_route_renders_envelope() {
        let (status, body) = call(configured().build().unwrap(), "/nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_panicking_handler_is_caught() {
        let router = configured()
            .with_custom_routes(Router::new().route(
                "/boom",
                get(|| async {
                    if true {
                        panic!("kaboom");
                    }
                    "unreachable"
                }),
            ))
            .build()
            .unwrap();

        let (status, body) = call(router, "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error_code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(body["message"], "An internal server error occurred.");
    }

    #[tokio::test]
    async fn test_route_groups_see_configured_prefix() {
        let config = CrudkitConfig {
            url_prefix: "/v2".into(),
            jwt: JwtConfig::ephemeral(),
            ..CrudkitConfig::default()
        };
        let router = ServerBuilder::new()
            .with_config(config)
            .with_routes(|app: &AppContext| {
                let path = format!("{}/ping", app.config.url_prefix);
                Router::new().route(&path, get(|| async { Json(json!({ "pong": true })) }))
            })
            .build()
            .unwrap();

        let (status, body) = call(router, "/v2/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pong"], true);
    }

    #[test]
    fn test_build_refuses_missing_secret() {
        let err = ServerBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("no JWT secret configured"));
    }

    #[tokio::test]
    async fn test_rate_limit_from_config() {
        let config = CrudkitConfig {
            jwt: JwtConfig::ephemeral(),
            rate_limit: RateLimitConfig {
                enabled: true,
                limit: "2/minute".into(),
            },
            ..CrudkitConfig::default()
        };
        let router = ServerBuilder::new().with_config(config).build().unwrap();

        for _ in 0..2 {
            let (status, _) = call(router.clone(), "/health").await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = call(router, "/health").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error_code"], "RATE_LIMIT_EXCEEDED");
    }
}

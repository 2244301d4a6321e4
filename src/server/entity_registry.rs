//! Entity registry collecting route descriptors for the server builder

use super::context::AppContext;
use axum::Router;
use indexmap::IndexMap;

/// Trait that describes how to build routes for an entity
///
/// [`CrudRoutes`](super::routes::CrudRoutes) implements it; applications can
/// implement it for route groups of their own.
pub trait EntityDescriptor: Send + Sync {
    /// The entity type name (singular, e.g., "widget")
    fn entity_type(&self) -> &str;

    /// Path prefix below the configured URL prefix (e.g., "/widgets")
    fn prefix(&self) -> &str;

    /// Build the routes for this entity, with paths that already include
    /// `app.config.url_prefix`
    fn build_routes(&self, app: &AppContext) -> Router;
}

/// Registry for all entities in the application
///
/// Routes are built in registration order.
#[derive(Default)]
pub struct EntityRegistry {
    descriptors: IndexMap<String, Box<dyn EntityDescriptor>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: IndexMap::new(),
        }
    }

    /// Register an entity descriptor
    ///
    /// The entity type name is the key; registering it again replaces the
    /// earlier descriptor.
    pub fn register(&mut self, descriptor: Box<dyn EntityDescriptor>) {
        let entity_type = descriptor.entity_type().to_string();
        if self.descriptors.contains_key(&entity_type) {
            tracing::warn!(entity = %entity_type, "Replacing registered entity routes");
        }
        self.descriptors.insert(entity_type, descriptor);
    }

    /// Build a router with all registered entity routes
    pub fn build_routes(&self, app: &AppContext) -> Router {
        let mut router = Router::new();

        for descriptor in self.descriptors.values() {
            tracing::info!(
                entity = descriptor.entity_type(),
                prefix = descriptor.prefix(),
                "Mounting entity routes"
            );
            router = router.merge(descriptor.build_routes(app));
        }

        router
    }

    /// Get all registered entity types
    pub fn entity_types(&self) -> Vec<&str> {
        self.descriptors.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

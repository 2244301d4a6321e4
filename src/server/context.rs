//! Shared application context handed to route constructors

use crate::config::{CrudkitConfig, JwtConfig};
use crate::core::auth::{JwtVerifier, TokenVerifier};
use crate::core::error::CrudError;
use crate::core::uow::UnitOfWork;
use crate::storage::{InMemoryStorage, Storage};
use std::sync::Arc;

/// Storage, token verification and configuration for one application
#[derive(Clone)]
pub struct AppContext {
    pub storage: Arc<dyn Storage>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Arc<CrudkitConfig>,
}

impl AppContext {
    /// Context over `storage`, verifying tokens with the configured JWT secret
    pub fn new(storage: Arc<dyn Storage>, config: CrudkitConfig) -> Self {
        Self {
            storage,
            verifier: Arc::new(JwtVerifier::new(&config.jwt)),
            config: Arc::new(config),
        }
    }

    /// In-memory storage with default configuration and a throwaway JWT
    /// secret
    pub fn in_memory() -> Self {
        let config = CrudkitConfig {
            jwt: JwtConfig::ephemeral(),
            ..CrudkitConfig::default()
        };
        Self::new(Arc::new(InMemoryStorage::new()), config)
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Open a unit of work on this context's storage
    pub async fn begin(&self) -> Result<UnitOfWork, CrudError> {
        UnitOfWork::begin(self.storage.as_ref()).await
    }
}

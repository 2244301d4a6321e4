//! Users, roles and permissions
//!
//! A ready-made module on top of the generic CRUD layer: password hashing,
//! JWT login and refresh, role and permission assignment, and an idempotent
//! seed for the admin account.

pub mod bootstrap;
pub mod hooks;
pub mod models;
pub mod password;
pub mod routes;
pub mod schemas;
pub mod service;

pub use bootstrap::{DEFAULT_PERMISSIONS, SeedReport, seed_default_auth};
pub use hooks::{RoleHooks, UserHooks};
pub use models::{Permission, Role, RolePermission, User, UserRole};
pub use password::{Argon2Hasher, PasswordHasher};
pub use routes::{UserRoutes, user_routes};
pub use service::{AuthService, ClaimsLoader, LoginResult};

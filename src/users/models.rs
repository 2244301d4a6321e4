//! User, role and permission records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_true() -> bool {
    true
}

/// An account that can log in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub username: String,
    /// Argon2 PHC string; never part of an output schema
    pub password_hash: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

crate::impl_model!(
    User,
    table = "users",
    features = [uuid, timestamps, soft_delete],
    unique = ["username"],
    fields = {
        username: String,
        is_active: bool,
        last_login_at: Option<DateTime<Utc>>,
    },
);

/// A named bundle of permissions. System roles grant super-admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_system_role: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

crate::impl_model!(
    Role,
    table = "roles",
    features = [timestamps],
    unique = ["name"],
    fields = {
        name: String,
        display_name: String,
        description: Option<String>,
        is_system_role: bool,
    },
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: i64,
    /// e.g. `create:widget`
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

crate::impl_model!(
    Permission,
    table = "permissions",
    features = [timestamps],
    unique = ["name"],
    fields = { name: String, description: Option<String> },
);

/// Assignment of a role to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRole {
    pub id: i64,
    pub user_id: i64,
    pub role_id: i64,
    #[serde(default)]
    pub assigned_by_user_id: Option<i64>,
    pub assigned_at: DateTime<Utc>,
}

crate::impl_model!(
    UserRole,
    table = "user_roles",
    fields = {
        user_id: i64,
        role_id: i64,
        assigned_by_user_id: Option<i64>,
    },
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePermission {
    pub id: i64,
    pub role_id: i64,
    pub permission_id: i64,
}

crate::impl_model!(
    RolePermission,
    table = "role_permissions",
    fields = { role_id: i64, permission_id: i64 },
);

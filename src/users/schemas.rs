//! Request and response shapes for the user routes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A user as returned by the API; the password hash never leaves the server
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UserOut {
    pub id: i64,
    pub uuid: Uuid,
    pub username: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UserCreate {
    #[validate(length(min = 1, max = 80, message = "Length must be between 1 and 80."))]
    pub username: String,
    #[validate(length(min = 1, message = "Missing data for required field."))]
    pub password: String,
}

/// Partial update; `password` is re-hashed by the user hooks
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UserUpdate {
    #[validate(length(min = 1, max = 80, message = "Length must be between 1 and 80."))]
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RoleOut {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub is_system_role: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RoleCreate {
    #[validate(length(min = 1, max = 80, message = "Length must be between 1 and 80."))]
    pub name: String,
    #[validate(length(min = 1, max = 120, message = "Length must be between 1 and 120."))]
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_system_role: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RoleUpdate {
    #[validate(length(min = 1, max = 80, message = "Length must be between 1 and 80."))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 120, message = "Length must be between 1 and 120."))]
    pub display_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PermissionOut {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PermissionCreate {
    #[validate(length(min = 1, max = 120, message = "Length must be between 1 and 120."))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PermissionUpdate {
    #[validate(length(min = 1, max = 120, message = "Length must be between 1 and 120."))]
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Missing data for required field."))]
    pub username: String,
    #[validate(length(min = 1, message = "Missing data for required field."))]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AssignRoleRequest {
    pub role_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PermissionIdRequest {
    pub permission_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{Schema, TypedSchema};
    use serde_json::json;

    #[test]
    fn test_user_out_drops_password_hash() {
        let dumped = TypedSchema::<UserOut>::new()
            .dump(json!({
                "id": 1,
                "uuid": Uuid::new_v4(),
                "username": "alice",
                "password_hash": "$argon2id$secret",
                "is_active": true,
                "last_login_at": null,
                "created_at": Utc::now(),
                "updated_at": Utc::now(),
                "deleted_at": null,
            }))
            .unwrap();
        assert!(dumped.get("password_hash").is_none());
        assert_eq!(dumped["username"], "alice");
    }

    #[test]
    fn test_user_create_rejects_unknown_fields() {
        let schema = TypedSchema::<UserCreate>::new();
        assert!(
            schema
                .load(json!({ "username": "a", "password": "p", "is_admin": true }), false)
                .is_err()
        );
        assert!(schema.load(json!({ "username": "a", "password": "p" }), false).is_ok());
    }

    #[test]
    fn test_user_update_is_partial() {
        let loaded = TypedSchema::<UserUpdate>::new()
            .load(json!({ "is_active": false }), true)
            .unwrap();
        assert_eq!(loaded, json!({ "is_active": false }));
    }
}

//! Typed error handling for crudkit
//!
//! Every failure a request can hit is a [`CrudError`]. Each kind maps to a
//! fixed HTTP status and a stable `error_code` so clients can branch on the
//! code rather than on the message.
//!
//! # Error envelope
//!
//! ```json
//! { "message": "Widget with ID/identifier '7' not found.",
//!   "error_code": "NOT_FOUND",
//!   "details": { "entity": "Widget", "id": "7" } }
//! ```

use crate::storage::StoreError;
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;

/// The error type shared by repositories, services and routes
#[derive(Debug, thiserror::Error)]
pub enum CrudError {
    /// An id or uuid lookup found nothing
    #[error("{entity} with ID/identifier '{id}' not found.")]
    NotFound { entity: String, id: String },

    /// A uniqueness constraint was violated on write
    #[error("{0}")]
    DuplicateEntry(String),

    /// A domain rule was violated
    #[error("{0}")]
    BusinessLogic(String),

    /// Credentials were rejected
    #[error("{0}")]
    AuthenticationFailed(String),

    /// The bearer token could not be decoded or has the wrong type
    #[error("Invalid token.")]
    InvalidToken(String),

    #[error("Token has expired.")]
    TokenExpired,

    /// No bearer token was supplied on a route that requires one
    #[error("Missing authorization")]
    AuthRequired,

    /// Authenticated, but lacking the required permission
    #[error("{0}")]
    PermissionDenied(String),

    /// The client sent more requests than its window allows
    #[error("Rate limit exceeded: {limit}.")]
    RateLimited { limit: String, retry_after_secs: u64 },

    /// The input schema rejected the payload
    #[error("Validation failed")]
    ValidationFailed(FieldErrors),

    /// Any unrecognized storage failure. The cause is logged, never returned.
    #[error("A database error occurred.")]
    Storage(#[from] StoreError),

    /// Catch-all for anything unhandled
    #[error("An internal server error occurred.")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub message: String,
    /// Stable error code for programmatic handling
    pub error_code: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CrudError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        CrudError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn business(message: impl Into<String>) -> Self {
        CrudError::BusinessLogic(message.into())
    }

    /// A single-field validation failure
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        CrudError::ValidationFailed(FieldErrors::single(field, message))
    }

    /// The failure raised by the permission gate
    pub fn missing_permission(permission: &str) -> Self {
        CrudError::PermissionDenied(format!("Required permission '{}' is missing.", permission))
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            CrudError::NotFound { .. } => StatusCode::NOT_FOUND,
            CrudError::DuplicateEntry(_) => StatusCode::CONFLICT,
            CrudError::BusinessLogic(_) => StatusCode::BAD_REQUEST,
            CrudError::AuthenticationFailed(_)
            | CrudError::InvalidToken(_)
            | CrudError::TokenExpired
            | CrudError::AuthRequired => StatusCode::UNAUTHORIZED,
            CrudError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            CrudError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CrudError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CrudError::Storage(_) | CrudError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            CrudError::NotFound { .. } => "NOT_FOUND",
            CrudError::DuplicateEntry(_) => "DUPLICATE_ENTRY",
            CrudError::BusinessLogic(_) => "BUSINESS_LOGIC_ERROR",
            CrudError::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            CrudError::InvalidToken(_) => "INVALID_TOKEN",
            CrudError::TokenExpired => "TOKEN_EXPIRED",
            CrudError::AuthRequired => "AUTH_REQUIRED",
            CrudError::PermissionDenied(_) => "PERMISSION_DENIED",
            CrudError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            CrudError::ValidationFailed(_) => "VALIDATION_FAILED",
            CrudError::Storage(_) => "DATABASE_ERROR",
            CrudError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Convert to an error response
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            message: self.to_string(),
            error_code: self.error_code().to_string(),
            details: self.details(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            CrudError::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            CrudError::ValidationFailed(errors) => serde_json::to_value(errors).ok(),
            CrudError::RateLimited {
                retry_after_secs, ..
            } => Some(json!({ "retry_after": retry_after_secs })),
            _ => None,
        }
    }

    fn log(&self) {
        match self {
            CrudError::NotFound { .. } => tracing::info!("Resource not found: {}", self),
            CrudError::Storage(cause) => {
                tracing::error!(error = %cause, "Storage failure while handling request")
            }
            CrudError::Internal(cause) => {
                tracing::error!(error = %cause, "An unhandled error occurred")
            }
            other => tracing::warn!(
                error_code = other.error_code(),
                "Request failed: {}",
                other
            ),
        }
    }
}

impl IntoResponse for CrudError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.status_code();
        let mut response = (status, Json(self.to_response())).into_response();
        if let CrudError::RateLimited {
            retry_after_secs, ..
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

/// Per-field validation messages, in the order they were reported
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(IndexMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Messages reported for a field
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn merge(&mut self, other: FieldErrors) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }
}

impl From<validator::ValidationErrors> for FieldErrors {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = FieldErrors::new();
        for (field, field_errors) in fields {
            for error in field_errors {
                let message = error
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value ({}).", error.code));
                out.add(field.to_string(), message);
            }
        }
        out
    }
}

impl From<validator::ValidationErrors> for CrudError {
    fn from(errors: validator::ValidationErrors) -> Self {
        CrudError::ValidationFailed(errors.into())
    }
}

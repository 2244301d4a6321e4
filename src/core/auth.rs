//! Bearer-token authentication and the permission gate
//!
//! Tokens are HS256-signed JWTs carrying a [`Claims`] payload. Verification
//! sits behind the [`TokenVerifier`] trait so applications can plug in their
//! own scheme; [`JwtVerifier`] is the default.

use super::error::CrudError;
use crate::config::JwtConfig;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Which exchange a token is good for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    #[default]
    Access,
    Refresh,
}

/// JWT claims embedded in every token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user's uuid
    pub sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,

    #[serde(default)]
    pub roles: Vec<String>,

    /// Granted permission names, e.g. `"create:widget"`
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Bypasses every permission check
    #[serde(default)]
    pub is_super_admin: bool,

    #[serde(default)]
    pub token_type: TokenType,

    /// Issued-at time (UTC Unix timestamp)
    #[serde(default)]
    pub iat: i64,

    /// Expiration time (UTC Unix timestamp)
    pub exp: i64,

    /// Unique token identifier. Tokens minted elsewhere may omit it.
    #[serde(default)]
    pub jti: String,

    /// Application-specific claims
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn new(sub: impl Into<String>, token_type: TokenType, ttl_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub: sub.into(),
            user_id: None,
            roles: Vec::new(),
            permissions: Vec::new(),
            is_super_admin: false,
            token_type,
            iat: now,
            exp: now + ttl_secs,
            jti: Uuid::new_v4().to_string(),
            extra: Map::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn super_admin(mut self, is_super_admin: bool) -> Self {
        self.is_super_admin = is_super_admin;
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Allow when the claims hold `permission` or belong to a super-admin
pub fn require_permission(claims: &Claims, permission: &str) -> Result<(), CrudError> {
    if claims.is_super_admin || claims.has_permission(permission) {
        return Ok(());
    }
    tracing::warn!(
        sub = %claims.sub,
        permission,
        "Permission denied"
    );
    Err(CrudError::missing_permission(permission))
}

/// Pull the token out of an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, CrudError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(CrudError::AuthRequired)?
        .to_str()
        .map_err(|_| CrudError::InvalidToken("authorization header is not valid ASCII".into()))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| CrudError::InvalidToken("expected `Bearer <token>`".into()))
}

/// Turns a bearer token into claims
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, CrudError>;
}

/// HS256 verifier backed by `jsonwebtoken`
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    configured: bool,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("validation", &self.validation)
            .field("configured", &self.configured)
            .finish()
    }
}

impl JwtVerifier {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = config.leeway_secs;

        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            configured: config.is_configured(),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims, CrudError> {
        if !self.configured {
            tracing::error!("Rejecting token: no JWT secret configured");
            return Err(CrudError::InvalidToken("no signing secret configured".into()));
        }
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CrudError::TokenExpired,
                _ => CrudError::InvalidToken(e.to_string()),
            })
    }
}

/// Signs access and refresh tokens
#[derive(Clone)]
pub struct JwtIssuer {
    encoding_key: EncodingKey,
    configured: bool,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl fmt::Debug for JwtIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtIssuer")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

impl JwtIssuer {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            configured: config.is_configured(),
            access_ttl_secs: config.access_ttl_secs,
            refresh_ttl_secs: config.refresh_ttl_secs,
        }
    }

    /// Unsigned access claims for `sub`, expiring after the access lifetime
    pub fn access_claims(&self, sub: impl Into<String>) -> Claims {
        Claims::new(sub, TokenType::Access, self.access_ttl_secs)
    }

    pub fn refresh_claims(&self, sub: impl Into<String>) -> Claims {
        Claims::new(sub, TokenType::Refresh, self.refresh_ttl_secs)
    }

    /// Sign `claims`. Fails while no secret is configured.
    pub fn sign(&self, claims: &Claims) -> Result<String, CrudError> {
        if !self.configured {
            return Err(CrudError::Internal("cannot sign token: no JWT secret configured".into()));
        }
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| CrudError::Internal(format!("cannot sign token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hmac".into(),
            ..JwtConfig::default()
        }
    }

    #[test]
    fn test_super_admin_bypasses_gate() {
        let admin = Claims::new("root", TokenType::Access, 60).super_admin(true);
        assert!(require_permission(&admin, "delete:anything").is_ok());
    }

    #[test]
    fn test_missing_permission_is_denied() {
        let reader = Claims::new("u1", TokenType::Access, 60).with_permissions(["read:data"]);
        assert!(require_permission(&reader, "read:data").is_ok());

        let err = require_permission(&reader, "write:data").unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "Required permission 'write:data' is missing.");
    }

    #[test]
    fn test_sign_and_verify() {
        let issuer = JwtIssuer::new(&config());
        let verifier = JwtVerifier::new(&config());
        let mut claims = issuer
            .access_claims("abc")
            .with_user_id(7)
            .with_roles(["editor"])
            .with_permissions(["read:widget"]);
        claims.extra.insert("tenant".into(), Value::from("acme"));

        let token = issuer.sign(&claims).unwrap();
        let decoded = verifier.verify(&token).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_expired_token() {
        let issuer = JwtIssuer::new(&config());
        let claims = Claims::new("abc", TokenType::Access, -120);
        let token = issuer.sign(&claims).unwrap();

        let err = JwtVerifier::new(&config()).verify(&token).unwrap_err();
        assert!(matches!(err, CrudError::TokenExpired));
    }

    #[test]
    fn test_tampered_or_foreign_token() {
        let other = JwtConfig {
            secret: "a-completely-different-secret".into(),
            ..JwtConfig::default()
        };
        let token = JwtIssuer::new(&other)
            .sign(&Claims::new("abc", TokenType::Access, 60))
            .unwrap();

        let verifier = JwtVerifier::new(&config());
        assert!(matches!(verifier.verify(&token), Err(CrudError::InvalidToken(_))));
        assert!(matches!(verifier.verify("not.a.jwt"), Err(CrudError::InvalidToken(_))));
    }

    #[test]
    fn test_token_without_jti_or_iat() {
        let exp = Utc::now().timestamp() + 60;
        let payload = serde_json::json!({ "sub": "external", "exp": exp, "roles": ["viewer"] });
        let key = EncodingKey::from_secret(config().secret.as_bytes());
        let token = encode(&Header::new(Algorithm::HS256), &payload, &key).unwrap();

        let claims = JwtVerifier::new(&config()).verify(&token).unwrap();
        assert_eq!(claims.sub, "external");
        assert_eq!(claims.jti, "");
        assert_eq!(claims.iat, 0);
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn test_unset_secret_signs_and_accepts_nothing() {
        let unset = JwtConfig::default();
        assert!(!unset.is_configured());

        let claims = Claims::new("abc", TokenType::Access, 60);
        assert!(matches!(JwtIssuer::new(&unset).sign(&claims), Err(CrudError::Internal(_))));

        // A token signed with the empty key must not pass either
        let forged = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"")).unwrap();
        assert!(matches!(
            JwtVerifier::new(&unset).verify(&forged),
            Err(CrudError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(matches!(bearer_token(&headers), Err(CrudError::AuthRequired)));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(matches!(bearer_token(&headers), Err(CrudError::InvalidToken(_))));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers).unwrap(), "tok");
    }
}

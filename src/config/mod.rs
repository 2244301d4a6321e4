//! Configuration loading and management
//!
//! Everything here can be written in YAML and loaded with
//! [`CrudkitConfig::from_yaml_file`]; every section has a usable default.
//!
//! ```yaml
//! url_prefix: /api/v1
//! jwt:
//!   secret: change-me
//!   access_ttl_secs: 3600
//! pagination:
//!   max_per_page: 50
//! filters:
//!   policy: strict
//! rate_limit:
//!   enabled: true
//!   limit: 100/minute
//! logging:
//!   activity: true
//!   file:
//!     directory: logs
//!     file_name: server.log
//! routes:
//!   widget:
//!     restore: { enabled: true }
//!     list: { auth_required: false }
//!     delete: { permission: null }
//! ```

use crate::core::filter::FilterPolicy;
use crate::core::query::DEFAULT_PER_PAGE;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `jwt.secret`
pub const ENV_JWT_SECRET: &str = "CRUDKIT_JWT_SECRET";
/// Environment variable overriding `url_prefix`
pub const ENV_URL_PREFIX: &str = "CRUDKIT_URL_PREFIX";

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no JWT secret configured: set `jwt.secret` or CRUDKIT_JWT_SECRET")]
    MissingJwtSecret,

    #[error("invalid configuration value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrudkitConfig {
    /// Prefix every route is mounted under
    pub url_prefix: String,
    pub jwt: JwtConfig,
    pub pagination: PaginationConfig,
    pub filters: FilterConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,

    /// Per-entity route overrides: entity → route name → settings
    pub routes: IndexMap<String, IndexMap<String, RouteSettings>>,
}

impl Default for CrudkitConfig {
    fn default() -> Self {
        Self {
            url_prefix: "/api/v1".to_string(),
            jwt: JwtConfig::default(),
            pagination: PaginationConfig::default(),
            filters: FilterConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
            routes: IndexMap::new(),
        }
    }
}

impl CrudkitConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Apply `CRUDKIT_*` environment variables on top of this configuration
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(secret) = lookup(ENV_JWT_SECRET).filter(|s| !s.is_empty()) {
            self.jwt.secret = secret;
        }
        if let Some(prefix) = lookup(ENV_URL_PREFIX) {
            self.url_prefix = prefix;
        }
        self
    }

    /// Check the settings a server cannot start without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.jwt.is_configured() {
            return Err(ConfigError::MissingJwtSecret);
        }
        if self.rate_limit.enabled {
            self.rate_limit.rate()?;
        }
        Ok(())
    }

    /// Route overrides declared for one entity
    pub fn routes_for(&self, entity: &str) -> Option<&IndexMap<String, RouteSettings>> {
        self.routes.get(entity)
    }
}

/// Token signing and lifetimes
///
/// There is no default secret. Until one is set, tokens are neither issued
/// nor accepted and the server refuses to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HMAC-SHA256 secret used to sign and verify tokens
    pub secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    /// Clock skew tolerated when checking `exp`
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            access_ttl_secs: 24 * 60 * 60,
            refresh_ttl_secs: 30 * 24 * 60 * 60,
            leeway_secs: 0,
        }
    }
}

impl JwtConfig {
    /// Whether a non-blank secret is set
    pub fn is_configured(&self) -> bool {
        !self.secret.trim().is_empty()
    }

    /// Default lifetimes with a random secret that lives as long as the
    /// process, for throwaway in-memory applications
    pub fn ephemeral() -> Self {
        Self {
            secret: format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_per_page: usize,
    pub max_per_page: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_per_page: DEFAULT_PER_PAGE,
            max_per_page: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Policy forced on every HTTP listing. Unset, each repository's own
    /// policy applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<FilterPolicy>,
}

/// Per-client request limit, written like `100/minute`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub limit: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: "100/minute".to_string(),
        }
    }
}

impl RateLimitConfig {
    /// Requests allowed per window, and the window length
    pub fn rate(&self) -> Result<(u32, Duration), ConfigError> {
        parse_rate(&self.limit).map_err(|reason| ConfigError::Invalid {
            key: "rate_limit.limit",
            reason,
        })
    }
}

/// Parse `<count>/<unit>` or `<count> per <unit>`, unit being second,
/// minute, hour or day
fn parse_rate(raw: &str) -> Result<(u32, Duration), String> {
    let normalized = raw.trim().to_ascii_lowercase().replace(" per ", "/");
    let (count, unit) = normalized
        .split_once('/')
        .ok_or_else(|| format!("expected `<count>/<unit>`, got '{}'", raw))?;
    let count: u32 = count
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a request count", count.trim()))?;
    if count == 0 {
        return Err("request count must be positive".to_string());
    }
    let secs = match unit.trim().trim_end_matches('s') {
        "second" => 1,
        "minute" => 60,
        "hour" => 60 * 60,
        "day" => 24 * 60 * 60,
        other => return Err(format!("unknown time unit '{}'", other)),
    };
    Ok((count, Duration::from_secs(secs)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Include the event target (module path) in output
    pub with_target: bool,
    /// Log entry, exit and failure of every route call
    pub activity: bool,
    /// Also write to a rotating file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<LogFileConfig>,
}

/// How often the log file rolls over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFileConfig {
    pub directory: PathBuf,
    pub file_name: String,
    pub rotation: LogRotation,
    /// Rotated files kept on disk; unset keeps all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name: "server.log".to_string(),
            rotation: LogRotation::Daily,
            max_files: Some(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            activity: false,
            file: None,
        }
    }
}

/// The serializable part of one route's configuration.
///
/// Absent keys keep the route's default. `permission: null` removes the
/// default permission requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission: Option<Option<String>>,
}

/// Distinguish `key: null` (`Some(None)`) from a missing key (`None`)
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CrudkitConfig::default();
        assert_eq!(config.url_prefix, "/api/v1");
        assert_eq!(config.jwt.access_ttl_secs, 86_400);
        assert_eq!(config.pagination.max_per_page, 100);
        assert_eq!(config.filters.policy, None);
        assert!(!config.jwt.is_configured());
        assert!(!config.rate_limit.enabled);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = CrudkitConfig::from_yaml_str(
            r#"
url_prefix: /api
filters:
  policy: strict
routes:
  widget:
    restore: { enabled: true }
    delete: { permission: null }
    update: { permission: "edit:widget" }
"#,
        )
        .unwrap();

        assert_eq!(config.url_prefix, "/api");
        assert_eq!(config.pagination.default_per_page, 10);
        assert_eq!(config.filters.policy, Some(FilterPolicy::Strict));

        let widget = config.routes_for("widget").unwrap();
        assert_eq!(widget["restore"].enabled, Some(true));
        assert_eq!(widget["restore"].permission, None);
        assert_eq!(widget["delete"].permission, Some(None));
        assert_eq!(
            widget["update"].permission,
            Some(Some("edit:widget".to_string()))
        );
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = CrudkitConfig::default();
        config.routes.entry("widget".into()).or_default().insert(
            "delete".into(),
            RouteSettings {
                permission: Some(None),
                ..Default::default()
            },
        );
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(CrudkitConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let config = CrudkitConfig::default().with_overrides_from(|key| match key {
            ENV_JWT_SECRET => Some("s3cret".to_string()),
            ENV_URL_PREFIX => Some("/v2".to_string()),
            _ => None,
        });
        assert_eq!(config.jwt.secret, "s3cret");
        assert_eq!(config.url_prefix, "/v2");
    }

    #[test]
    fn test_validate_requires_secret() {
        assert!(matches!(
            CrudkitConfig::default().validate(),
            Err(ConfigError::MissingJwtSecret)
        ));

        let mut config = CrudkitConfig::default();
        config.jwt.secret = "   ".into();
        assert!(matches!(config.validate(), Err(ConfigError::MissingJwtSecret)));

        config.jwt = JwtConfig::ephemeral();
        assert!(config.validate().is_ok());
        assert_ne!(JwtConfig::ephemeral().secret, config.jwt.secret);
    }

    #[test]
    fn test_rate_strings() {
        assert_eq!(parse_rate("100/minute").unwrap(), (100, Duration::from_secs(60)));
        assert_eq!(parse_rate("5 per second").unwrap(), (5, Duration::from_secs(1)));
        assert_eq!(parse_rate("1000/hours").unwrap(), (1000, Duration::from_secs(3600)));
        assert!(parse_rate("0/minute").is_err());
        assert!(parse_rate("ten/minute").is_err());
        assert!(parse_rate("10/fortnight").is_err());
        assert!(parse_rate("100").is_err());
    }

    #[test]
    fn test_enabled_rate_limit_is_validated() {
        let mut config = CrudkitConfig::default();
        config.jwt = JwtConfig::ephemeral();
        config.rate_limit = RateLimitConfig {
            enabled: true,
            limit: "lots".into(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "rate_limit.limit", .. })
        ));
    }

    #[test]
    fn test_logging_file_section() {
        let config = CrudkitConfig::from_yaml_str(
            r#"
logging:
  activity: true
  file:
    directory: /var/log/app
    rotation: hourly
"#,
        )
        .unwrap();
        assert!(config.logging.activity);
        let file = config.logging.file.unwrap();
        assert_eq!(file.directory, PathBuf::from("/var/log/app"));
        assert_eq!(file.file_name, "server.log");
        assert_eq!(file.rotation, LogRotation::Hourly);
    }

    #[test]
    fn test_malformed_yaml_is_reported() {
        assert!(matches!(
            CrudkitConfig::from_yaml_str("pagination: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}

//! Configuration management for the collector
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with COLLECTOR__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml)
//! - Default values
//!
//! Credentials live here too. They are redacted from `Debug` output and
//! never serialized.

use crate::errors::{AppError, Result};
use config::{Config, Environment, File};
use croner::Cron;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    /// Runtime limits for collection runs
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    /// Global cron schedule
    #[serde(default)]
    #[validate(nested)]
    pub schedule: ScheduleConfig,

    /// Embedded SQLite store
    #[serde(default)]
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Per-type inter-request delays
    #[serde(default)]
    #[validate(nested)]
    pub rate_limits: RateLimitConfig,

    /// Upstream credentials
    #[serde(default)]
    pub credentials: Credentials,

    /// Outbound HTTP behaviour
    #[serde(default)]
    #[validate(nested)]
    pub http: HttpConfig,

    /// Upstream base URLs
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Logging and metrics
    #[serde(default)]
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    /// Deepest comment level kept by any fetcher (0 disables comments)
    #[serde(default = "default_max_comment_depth")]
    #[validate(range(max = 10))]
    pub max_comment_depth: u32,

    /// Hard limit on one source's fetch
    #[serde(default = "default_source_timeout")]
    #[validate(range(min = 1))]
    pub source_timeout_secs: u64,

    /// How long Stop waits for in-flight work
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ScheduleConfig {
    /// Five-field cron expression
    #[serde(default = "default_cron_expr")]
    #[validate(custom(function = "validate_cron_expr"))]
    pub cron_expr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1))]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RateLimitConfig {
    #[serde(default = "default_reddit_delay")]
    pub reddit_delay_ms: u64,

    #[serde(default = "default_hackernews_delay")]
    pub hackernews_delay_ms: u64,

    #[serde(default = "default_semantic_scholar_delay")]
    pub semantic_scholar_delay_ms: u64,

    /// Bucket capacity shared by every source of a type
    #[serde(default = "default_burst")]
    #[validate(range(min = 1))]
    pub burst: u32,
}

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Credentials {
    #[serde(default, skip_serializing)]
    pub reddit_client_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub reddit_client_secret: Option<String>,
    #[serde(default, skip_serializing)]
    pub reddit_username: Option<String>,
    #[serde(default, skip_serializing)]
    pub reddit_password: Option<String>,
    #[serde(default, skip_serializing)]
    pub semantic_scholar_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(value: &Option<String>) -> &'static str {
            if value.is_some() {
                "<redacted>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("Credentials")
            .field("reddit_client_id", &redact(&self.reddit_client_id))
            .field("reddit_client_secret", &redact(&self.reddit_client_secret))
            .field("reddit_username", &redact(&self.reddit_username))
            .field("reddit_password", &redact(&self.reddit_password))
            .field(
                "semantic_scholar_api_key",
                &redact(&self.semantic_scholar_api_key),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HttpConfig {
    /// Per-request timeout
    #[serde(default = "default_http_timeout")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    /// Total time budget for retrying one request
    #[serde(default = "default_max_retry_elapsed")]
    pub max_retry_elapsed_secs: u64,

    /// First back-off interval
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Used when a source does not set its own user agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_reddit_base")]
    pub reddit_base: String,

    #[serde(default = "default_hackernews_api")]
    pub hackernews_api: String,

    #[serde(default = "default_hackernews_web")]
    pub hackernews_web: String,

    #[serde(default = "default_semantic_scholar_api")]
    pub semantic_scholar_api: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default)]
    pub metrics_port: u16,
}

// Default value functions
fn default_max_comment_depth() -> u32 { 5 }
fn default_source_timeout() -> u64 { 300 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_cron_expr() -> String { "0 */6 * * *".to_string() }
fn default_db_path() -> String { "data/collector.db".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_busy_timeout() -> u64 { 5000 }
fn default_reddit_delay() -> u64 { 2000 }
fn default_hackernews_delay() -> u64 { 500 }
fn default_semantic_scholar_delay() -> u64 { 1000 }
fn default_burst() -> u32 { 10 }
fn default_http_timeout() -> u64 { 30 }
fn default_max_retry_elapsed() -> u64 { 60 }
fn default_initial_backoff() -> u64 { 500 }
fn default_user_agent() -> String { format!("newsloom-collector/{}", env!("CARGO_PKG_VERSION")) }
fn default_reddit_base() -> String { "https://www.reddit.com".to_string() }
fn default_hackernews_api() -> String { "https://hacker-news.firebaseio.com".to_string() }
fn default_hackernews_web() -> String { "https://news.ycombinator.com".to_string() }
fn default_semantic_scholar_api() -> String { "https://api.semanticscholar.org".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

fn validate_cron_expr(expr: &str) -> std::result::Result<(), ValidationError> {
    parse_cron(expr)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_cron_expr"))
}

fn validate_log_level(level: &str) -> std::result::Result<(), ValidationError> {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

/// Parse a standard five-field cron expression
pub fn parse_cron(expr: &str) -> Result<Cron> {
    Cron::new(expr).parse().map_err(|e| AppError::Configuration {
        message: format!("invalid cron expression {expr:?}: {e}"),
    })
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g., COLLECTOR__SCHEDULE__CRON_EXPR="*/30 * * * *"
            .add_source(
                Environment::with_prefix("COLLECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: Self = config.try_deserialize().map_err(config_error)?;
        config.validated()
    }

    /// Load from a specific file, still honouring environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("COLLECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: Self = config.try_deserialize().map_err(config_error)?;
        config.validated()
    }

    /// Run field validation, returning the config unchanged on success
    pub fn validated(self) -> Result<Self> {
        self.validate().map_err(|e| AppError::Configuration {
            message: e.to_string(),
        })?;
        Ok(self)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.server.source_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

fn config_error(err: config::ConfigError) -> AppError {
    AppError::Configuration {
        message: err.to_string(),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_comment_depth: default_max_comment_depth(),
            source_timeout_secs: default_source_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron_expr: default_cron_expr(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            reddit_delay_ms: default_reddit_delay(),
            hackernews_delay_ms: default_hackernews_delay(),
            semantic_scholar_delay_ms: default_semantic_scholar_delay(),
            burst: default_burst(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            max_retry_elapsed_secs: default_max_retry_elapsed(),
            initial_backoff_ms: default_initial_backoff(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            reddit_base: default_reddit_base(),
            hackernews_api: default_hackernews_api(),
            hackernews_web: default_hackernews_web(),
            semantic_scholar_api: default_semantic_scholar_api(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.schedule.cron_expr, "0 */6 * * *");
        assert_eq!(config.server.max_comment_depth, 5);
        assert_eq!(config.rate_limits.reddit_delay_ms, 2000);
        assert_eq!(config.rate_limits.hackernews_delay_ms, 500);
        assert_eq!(config.rate_limits.semantic_scholar_delay_ms, 1000);
        assert_eq!(config.rate_limits.burst, 10);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.source_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validated().is_ok());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let mut config = AppConfig::default();
        config.schedule.cron_expr = "every six hours".to_string();
        let err = config.validated().unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = AppConfig::default();
        config.observability.log_level = "loud".to_string();
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_credentials_redacted() {
        let creds = Credentials {
            reddit_client_secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));

        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_parse_cron() {
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("61 * * * *").is_err());
    }
}

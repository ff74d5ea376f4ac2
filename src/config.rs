use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_GATEWAY_API_BASE: &str = "https://sandbox-api-pay.line.me";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PENDING_ORDER_TTL_SECS: u64 = 30 * 60;
const DEFAULT_CURRENCY: &str = "TWD";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Payment gateway merchant channel id
    #[validate(length(min = 1, message = "gateway channel id must not be empty"))]
    pub gateway_channel_id: String,

    /// Payment gateway channel secret used for request signing.
    /// Required: a missing or empty secret is a startup failure, never a
    /// per-request one.
    #[validate(custom = "validate_channel_secret")]
    pub gateway_channel_secret: String,

    /// Payment gateway API base URL
    #[serde(default = "default_gateway_api_base")]
    pub gateway_api_base: String,

    /// Outbound gateway call timeout (seconds)
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,

    /// TTL for pending orders held across the gateway redirect (seconds)
    #[serde(default = "default_pending_order_ttl_secs")]
    pub pending_order_ttl_secs: u64,

    /// Secret used to derive the pending-order encryption key
    #[validate(length(min = 32, message = "session encryption key must be at least 32 characters"))]
    pub session_encryption_key: String,

    /// Comma-separated source IPs allowed to call the payment webhook.
    /// Unset means the allow-list check is skipped.
    #[serde(default)]
    pub webhook_allowed_ips: Option<String>,

    /// Default currency code for subscription charges
    #[serde(default = "default_currency")]
    pub default_currency: String,
}

impl AppConfig {
    /// Creates a new configuration (primarily for tests)
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        database_url: String,
        host: String,
        port: u16,
        environment: String,
        gateway_channel_id: String,
        gateway_channel_secret: String,
        session_encryption_key: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            gateway_channel_id,
            gateway_channel_secret,
            gateway_api_base: default_gateway_api_base(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            pending_order_ttl_secs: default_pending_order_ttl_secs(),
            session_encryption_key,
            webhook_allowed_ips: None,
            default_currency: default_currency(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Parsed webhook source-IP allow-list; empty when unset.
    pub fn webhook_allowed_ips(&self) -> Vec<String> {
        self.webhook_allowed_ips
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_gateway_api_base() -> String {
    DEFAULT_GATEWAY_API_BASE.to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_pending_order_ttl_secs() -> u64 {
    DEFAULT_PENDING_ORDER_TTL_SECS
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn validate_channel_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    if trimmed.is_empty() {
        let mut err = ValidationError::new("gateway_channel_secret");
        err.message = Some("gateway channel secret must not be empty".into());
        return Err(err);
    }

    // Reject obvious placeholders so an unsigned-request misconfiguration
    // cannot reach the gateway.
    const DISALLOWED: [&str; 3] = ["changeme", "your-secret", "secret"];
    if DISALLOWED
        .iter()
        .any(|&bad| trimmed.eq_ignore_ascii_case(bad))
    {
        let mut err = ValidationError::new("gateway_channel_secret");
        err.message = Some("gateway channel secret must be a real merchant secret".into());
        return Err(err);
    }

    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("subpay_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // NOTE: the gateway credentials and session key have no defaults - they
    // MUST be provided via environment variable or config file.
    let config = Config::builder()
        .set_default("database_url", "sqlite://subpay.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", 8080)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("gateway_channel_secret").is_err() {
        error!("Gateway channel secret is not configured. Set APP__GATEWAY_CHANNEL_SECRET.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "gateway_channel_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

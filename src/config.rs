//! Application configuration module
//! Loads the environment (after `.env`), validates it, and hands each
//! component its own settings block.

use crate::payments::coordinator::CoordinatorConfig;
use crate::payments::error::PaymentError;
use crate::payments::providers::MomoConfig;
use crate::workers::reconciliation::ReconciliationConfig;
use std::env;

#[cfg(feature = "cache")]
use crate::cache::CacheConfig;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub momo: MomoConfig,
    pub coordinator: CoordinatorConfig,
    pub reconciliation: ReconciliationConfig,
    pub logging: LoggingConfig,
    #[cfg(feature = "cache")]
    pub cache: CacheConfig,
    /// Run against the in-process outcome store instead of Redis.
    pub skip_externals: bool,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: LogFormat::Plain,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            momo: MomoConfig::from_env()?,
            coordinator: CoordinatorConfig::from_env(),
            reconciliation: ReconciliationConfig::from_env(),
            logging: LoggingConfig::from_env()?,
            #[cfg(feature = "cache")]
            cache: CacheConfig::from_env(),
            skip_externals: env::var("SKIP_EXTERNALS")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.momo.validate()?;
        self.coordinator.validate()?;
        self.reconciliation.validate()?;
        self.logging.validate()?;

        #[cfg(feature = "cache")]
        if !self.skip_externals {
            validate_redis_url(&self.cache.redis_url)?;
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                "plain" => LogFormat::Plain,
                _ => return Err(ConfigError::InvalidValue("LOG_FORMAT".to_string())),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

#[cfg(feature = "cache")]
fn validate_redis_url(redis_url: &str) -> Result<(), ConfigError> {
    if redis_url.is_empty() {
        return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
    }

    if !redis_url.starts_with("redis://") && !redis_url.starts_with("rediss://") {
        return Err(ConfigError::InvalidValue(
            "REDIS_URL must start with redis:// or rediss://".to_string(),
        ));
    }

    Ok(())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<PaymentError> for ConfigError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::ConfigurationError { message, field } => {
                match message.strip_suffix(" required") {
                    Some(variables) => ConfigError::MissingVariable(variables.to_string()),
                    None => ConfigError::InvalidValue(field.unwrap_or(message)),
                }
            }
            other => ConfigError::ValidationFailed(other.to_string()),
        }
    }
}

//! Application configuration module
//! Loads `.env`, reads typed sub-configs from the environment and validates them

use crate::payments::providers::mpesa::MpesaConfig;
use crate::services::payment_lifecycle::LifecycleConfig;
use crate::workers::reconciliation::ReconciliationConfig;
use std::env;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Absent when `DATABASE_URL` is unset; the binary then uses the in-memory store
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub mpesa: MpesaConfig,
    pub lifecycle: LifecycleConfig,
    pub reconciliation: ReconciliationConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        let database = if env::var("DATABASE_URL").is_ok() {
            Some(DatabaseConfig::from_env()?)
        } else {
            None
        };

        Ok(AppConfig {
            database,
            logging: LoggingConfig::from_env()?,
            mpesa: MpesaConfig::from_env()?,
            lifecycle: LifecycleConfig::from_env(),
            reconciliation: ReconciliationConfig::from_env(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.mpesa.validate()?;

        let lifecycle = &self.lifecycle;
        if lifecycle.min_amount < 1 || lifecycle.min_amount > lifecycle.max_amount {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_MIN_AMOUNT must be >= 1 and <= PAYMENT_MAX_AMOUNT".to_string(),
            ));
        }
        if lifecycle.ttl.is_zero() {
            return Err(ConfigError::InvalidValue("PAYMENT_TTL_SECS".to_string()));
        }
        if lifecycle.gateway_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("GATEWAY_TIMEOUT_SECS".to_string()));
        }
        if lifecycle.idempotency_bucket.is_zero()
            || lifecycle.idempotency_bucket > lifecycle.idempotency_window
        {
            return Err(ConfigError::InvalidValue(
                "IDEMPOTENCY_BUCKET_SECS must be non-zero and <= IDEMPOTENCY_WINDOW_SECS"
                    .to_string(),
            ));
        }

        if self.reconciliation.poll_interval.is_zero() || self.reconciliation.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "RECON_POLL_INTERVAL_SECS and RECON_BATCH_SIZE must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_or("DB_MAX_CONNECTIONS", 10)?,
            min_connections: parse_or("DB_MIN_CONNECTIONS", 2)?,
            connection_timeout_secs: parse_or("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout_secs: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
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
                "plain" | "pretty" | "text" => LogFormat::Plain,
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

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: LogFormat::Plain,
        }
    }
}

/// Read `key` and parse it, falling back to `default` when unset.
pub(crate) fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> DatabaseConfig {
        DatabaseConfig {
            url: "postgres://localhost/stk".to_string(),
            max_connections: 10,
            min_connections: 2,
            connection_timeout_secs: 30,
            idle_timeout_secs: None,
        }
    }

    #[test]
    fn test_database_config_validation() {
        assert!(database().validate().is_ok());

        let mut inverted = database();
        inverted.min_connections = 20;
        assert!(inverted.validate().is_err());

        let mut empty = database();
        empty.url.clear();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = LoggingConfig::default();
        assert!(config.validate().is_ok());
        config.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_amount_bounds_validation() {
        let mut config = AppConfig {
            database: None,
            logging: LoggingConfig::default(),
            mpesa: MpesaConfig::default(),
            lifecycle: LifecycleConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        };
        assert!(config.validate().is_ok());

        config.lifecycle.min_amount = 0;
        assert!(config.validate().is_err());

        config.lifecycle.min_amount = 500;
        config.lifecycle.max_amount = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_or_uses_default_for_unset_key() {
        let value: u64 = parse_or("STK_LIFECYCLE_TEST_SURELY_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }
}

//! Configuration module for allocation-service.

use rust_decimal::Decimal;
use service_core::config::{self as core_config, env_or};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AllocationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub drift: DriftConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub scheduler_enabled: bool,
    pub interval_secs: u64,
    pub warn_threshold: Decimal,
    pub fail_threshold: Decimal,
}

impl DriftConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            interval_secs: 3600,
            warn_threshold: Decimal::new(5, 4),
            fail_threshold: Decimal::new(5, 3),
        }
    }
}

impl AllocationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let defaults = DriftConfig::default();

        let drift = DriftConfig {
            scheduler_enabled: env_or("DRIFT_SCHEDULER_ENABLED", defaults.scheduler_enabled)?,
            interval_secs: env_or("DRIFT_INTERVAL_SECS", defaults.interval_secs)?,
            warn_threshold: env_or("DRIFT_WARN_THRESHOLD", defaults.warn_threshold)?,
            fail_threshold: env_or("DRIFT_FAIL_THRESHOLD", defaults.fail_threshold)?,
        };
        if drift.interval_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DRIFT_INTERVAL_SECS must be greater than zero"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "allocation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            drift,
        })
    }
}

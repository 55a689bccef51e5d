//! Configuration management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use etl_common::env::{parse_or, string_or};
use etl_common::EtlError;
use serde::{Deserialize, Serialize};

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/etl";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default directory holding one analytical database file per tenant.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Pause after a failed schedule tick before the loop tries again.
pub const DEFAULT_SCHEDULE_ERROR_BACKOFF_SECS: u64 = 60;

/// Timeout for outbound HTTP (api sources, webhook destinations).
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Durable Backend Configuration Constants
// ============================================================================

/// Retention applied when registering a tenant namespace.
pub const DEFAULT_NAMESPACE_RETENTION_DAYS: u32 = 7;

/// Bound on a single connection attempt to the durable backend.
pub const DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Consecutive backend failures that open the circuit.
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// Time an open circuit waits before letting a probe through.
pub const DEFAULT_BREAKER_RESET_SECS: u64 = 30;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub durable: DurableConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// What to do when a trigger arrives while the workflow already has an
/// execution in flight in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Allow,
}

impl FromStr for OverlapPolicy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(OverlapPolicy::Skip),
            "allow" => Ok(OverlapPolicy::Allow),
            other => Err(EtlError::config(format!("invalid overlap policy: {other}"))),
        }
    }
}

/// Scheduling and pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub overlap_policy: OverlapPolicy,
    pub schedule_error_backoff_secs: u64,
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    pub fn schedule_error_backoff(&self) -> Duration {
        Duration::from_secs(self.schedule_error_backoff_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Durable backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableConfig {
    /// When false every execution goes through the fallback executor
    pub enabled: bool,
    pub namespace_retention_days: u32,
    pub connect_timeout_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_secs: u64,
}

impl DurableConfig {
    pub fn namespace_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.namespace_retention_days) * 24 * 60 * 60)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn breaker_reset(&self) -> Duration {
        Duration::from_secs(self.breaker_reset_secs)
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: string_or("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: parse_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: parse_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
                idle_timeout_secs: parse_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                )?,
            },
            engine: EngineConfig {
                data_dir: PathBuf::from(string_or("ETL_DATA_DIR", DEFAULT_DATA_DIR)),
                overlap_policy: parse_or("ETL_OVERLAP_POLICY", OverlapPolicy::default())?,
                schedule_error_backoff_secs: parse_or(
                    "ETL_SCHEDULE_ERROR_BACKOFF_SECS",
                    DEFAULT_SCHEDULE_ERROR_BACKOFF_SECS,
                )?,
                http_timeout_secs: parse_or("ETL_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
            },
            durable: DurableConfig {
                enabled: parse_or("ETL_DURABLE_ENABLED", true)?,
                namespace_retention_days: parse_or(
                    "ETL_NAMESPACE_RETENTION_DAYS",
                    DEFAULT_NAMESPACE_RETENTION_DAYS,
                )?,
                connect_timeout_secs: parse_or(
                    "ETL_BACKEND_CONNECT_TIMEOUT_SECS",
                    DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS,
                )?,
                breaker_failure_threshold: parse_or(
                    "ETL_BREAKER_FAILURE_THRESHOLD",
                    DEFAULT_BREAKER_FAILURE_THRESHOLD,
                )?,
                breaker_reset_secs: parse_or("ETL_BREAKER_RESET_SECS", DEFAULT_BREAKER_RESET_SECS)?,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.engine.data_dir.as_os_str().is_empty() {
            anyhow::bail!("ETL_DATA_DIR cannot be empty");
        }

        if self.engine.http_timeout_secs == 0 {
            anyhow::bail!("HTTP timeout must be greater than 0");
        }

        if self.durable.breaker_failure_threshold == 0 {
            anyhow::bail!("Breaker failure threshold must be greater than 0");
        }

        if self.durable.namespace_retention_days == 0 {
            anyhow::bail!("Namespace retention must be at least one day");
        }

        if self.engine.overlap_policy == OverlapPolicy::Allow {
            tracing::warn!("Overlap policy is 'allow': a workflow may run concurrently with itself");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            engine: EngineConfig::default(),
            durable: DurableConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            overlap_policy: OverlapPolicy::Skip,
            schedule_error_backoff_secs: DEFAULT_SCHEDULE_ERROR_BACKOFF_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace_retention_days: DEFAULT_NAMESPACE_RETENTION_DAYS,
            connect_timeout_secs: DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS,
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_reset_secs: DEFAULT_BREAKER_RESET_SECS,
        }
    }
}

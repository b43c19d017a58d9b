/// Configuration management for Follow Service
///
/// Loads configuration from environment variables (optionally via `.env`).
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Storage backend selection and database pool
    pub storage: StorageConfig,
    /// Optional Redis counters cache
    pub cache: CacheConfig,
    /// Follow/unfollow behaviour
    pub follow: FollowConfig,
    /// Background counter reconciliation
    pub reconciliation: ReconciliationConfig,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (dev, staging, prod)
    pub env: String,
    /// Server host to bind to
    pub host: String,
    /// HTTP port
    pub http_port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    /// In-process stores; state is lost on restart
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => bail!("unknown STORAGE_BACKEND '{}', expected postgres or memory", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Required for the postgres backend
    pub database: Option<DatabaseConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Max connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Min connections in pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Server-side bound on every statement
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

/// Redis counters cache; disabled when `REDIS_URL` is unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_redis_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl CacheConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowConfig {
    /// Deadline applied to every storage step of follow/unfollow
    pub operation_timeout_ms: u64,
}

impl FollowConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Users recounted per cycle by the background sweep
    pub sweep_batch: u32,
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// Default values
fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_statement_timeout_ms() -> u64 {
    5_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_redis_command_timeout_ms() -> u64 {
    500
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let app = AppConfig {
            env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            host: std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env_or("PORT", 8090),
            log_format: match std::env::var("LOG_FORMAT") {
                Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        };

        let backend = match std::env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse().context("Invalid STORAGE_BACKEND")?,
            Err(_) => StorageBackend::Postgres,
        };

        let database = match std::env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url,
                max_connections: env_or("DB_MAX_CONNECTIONS", default_max_connections()),
                min_connections: env_or("DB_MIN_CONNECTIONS", default_min_connections()),
                statement_timeout_ms: env_or(
                    "DB_STATEMENT_TIMEOUT_MS",
                    default_statement_timeout_ms(),
                ),
            }),
            Err(_) if backend == StorageBackend::Postgres => {
                bail!("DATABASE_URL environment variable not set")
            }
            Err(_) => None,
        };

        let cache = CacheConfig {
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            ttl_secs: env_or("COUNTER_CACHE_TTL_SECS", default_cache_ttl_secs()),
            command_timeout_ms: env_or(
                "REDIS_COMMAND_TIMEOUT_MS",
                default_redis_command_timeout_ms(),
            ),
        };

        let follow = FollowConfig {
            operation_timeout_ms: env_or("FOLLOW_OPERATION_TIMEOUT_MS", 2000),
        };

        let reconciliation = ReconciliationConfig {
            enabled: env_flag("RECONCILIATION_ENABLED", true),
            interval_secs: env_or("RECONCILIATION_INTERVAL_SECS", 60),
            sweep_batch: env_or("RECONCILIATION_SWEEP_BATCH", 200),
        };

        let config = Config {
            app,
            storage: StorageConfig { backend, database },
            cache,
            follow,
            reconciliation,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(db) = &self.storage.database {
            if db.min_connections > db.max_connections {
                bail!(
                    "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                    db.min_connections,
                    db.max_connections
                );
            }
        }
        if self.follow.operation_timeout_ms == 0 {
            bail!("FOLLOW_OPERATION_TIMEOUT_MS must be greater than zero");
        }
        if self.cache.command_timeout_ms == 0 {
            bail!("REDIS_COMMAND_TIMEOUT_MS must be greater than zero");
        }
        if self.reconciliation.enabled
            && (self.reconciliation.interval_secs == 0 || self.reconciliation.sweep_batch == 0)
        {
            bail!("RECONCILIATION_INTERVAL_SECS and RECONCILIATION_SWEEP_BATCH must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "APP_ENV",
        "APP_HOST",
        "PORT",
        "LOG_FORMAT",
        "STORAGE_BACKEND",
        "DATABASE_URL",
        "DB_MAX_CONNECTIONS",
        "DB_MIN_CONNECTIONS",
        "DB_STATEMENT_TIMEOUT_MS",
        "REDIS_URL",
        "COUNTER_CACHE_TTL_SECS",
        "REDIS_COMMAND_TIMEOUT_MS",
        "FOLLOW_OPERATION_TIMEOUT_MS",
        "RECONCILIATION_ENABLED",
        "RECONCILIATION_INTERVAL_SECS",
        "RECONCILIATION_SWEEP_BATCH",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_default_values() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://test");

        let config = Config::from_env().unwrap();

        assert_eq!(config.app.env, "development");
        assert_eq!(config.app.host, "0.0.0.0");
        assert_eq!(config.app.http_port, 8090);
        assert_eq!(config.app.log_format, LogFormat::Text);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        let db = config.storage.database.unwrap();
        assert_eq!(db.max_connections, 20);
        assert_eq!(db.min_connections, 5);
        assert_eq!(db.statement_timeout_ms, 5_000);
        assert!(config.cache.redis_url.is_none());
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.cache.command_timeout(), Duration::from_millis(500));
        assert_eq!(config.follow.operation_timeout(), Duration::from_secs(2));
        assert!(config.reconciliation.enabled);
        assert_eq!(config.reconciliation.interval(), Duration::from_secs(60));
        assert_eq!(config.reconciliation.sweep_batch, 200);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_postgres_requires_database_url() {
        clear_env();
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_memory_backend_without_database() {
        clear_env();
        std::env::set_var("STORAGE_BACKEND", "memory");
        std::env::set_var("LOG_FORMAT", "json");
        std::env::set_var("RECONCILIATION_ENABLED", "false");

        let config = Config::from_env().unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.storage.database.is_none());
        assert_eq!(config.app.log_format, LogFormat::Json);
        assert!(!config.reconciliation.enabled);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_rejects_invalid_values() {
        clear_env();
        std::env::set_var("STORAGE_BACKEND", "cassandra");
        assert!(Config::from_env().is_err());

        clear_env();
        std::env::set_var("STORAGE_BACKEND", "memory");
        std::env::set_var("FOLLOW_OPERATION_TIMEOUT_MS", "0");
        assert!(Config::from_env().is_err());

        clear_env();
        std::env::set_var("STORAGE_BACKEND", "memory");
        std::env::set_var("REDIS_COMMAND_TIMEOUT_MS", "0");
        assert!(Config::from_env().is_err());

        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("DB_MIN_CONNECTIONS", "50");
        assert!(Config::from_env().is_err());
        clear_env();
    }
}

use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub fanout: FanoutConfig,
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Compare-and-swap attempts for a single document before giving up with a conflict.
    pub max_write_attempts: u32,
    /// Deadline for the second half of a dual write. Expiry counts as a failed write.
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Maximum recipients written to in parallel during a broadcast.
    pub concurrency: usize,
    /// Attempts per recipient before the append is reported as failed.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Whether the periodic ledger sweep runs in the background.
    pub enabled: bool,
    pub interval_seconds: u64,
}

fn parse_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| defaults.server.host.clone()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| defaults.database.url.clone()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            ledger: LedgerConfig {
                max_write_attempts: env::var("LEDGER_MAX_WRITE_ATTEMPTS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("LEDGER_MAX_WRITE_ATTEMPTS".to_string()))?,
                write_timeout_ms: env::var("LEDGER_WRITE_TIMEOUT_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()
                    .unwrap_or(5000u64),
            },
            fanout: FanoutConfig {
                concurrency: env::var("FANOUT_CONCURRENCY")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()
                    .unwrap_or(8usize),
                max_attempts: env::var("FANOUT_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3u32),
                initial_backoff_ms: env::var("FANOUT_INITIAL_BACKOFF_MS")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50u64),
                max_backoff_ms: env::var("FANOUT_MAX_BACKOFF_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()
                    .unwrap_or(2000u64),
            },
            reconciliation: ReconciliationConfig {
                enabled: parse_flag("RECONCILIATION_ENABLED", true),
                interval_seconds: env::var("RECONCILIATION_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "900".to_string())
                    .parse()
                    .unwrap_or(900u64),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/donations.db".to_string(),
                max_connections: 5,
            },
            ledger: LedgerConfig {
                max_write_attempts: 5,
                write_timeout_ms: 5000,
            },
            fanout: FanoutConfig {
                concurrency: 8,
                max_attempts: 3,
                initial_backoff_ms: 50,
                max_backoff_ms: 2000,
            },
            reconciliation: ReconciliationConfig {
                enabled: true,
                interval_seconds: 900,
            },
        }
    }
}

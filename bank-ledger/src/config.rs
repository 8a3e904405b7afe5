//! Configuration module for bank-ledger.

use crate::error::LedgerError;
use config::{Config as Cfg, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Listener settings, read from an optional `configuration` file and `APP__*` variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl ServerConfig {
    pub fn load() -> Result<Self, LedgerError> {
        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub server: ServerConfig,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, LedgerError> {
        dotenvy::dotenv().ok();

        let server = ServerConfig::load()?;

        Ok(Self {
            server,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "bank-ledger".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    LedgerError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parsed_var("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed_var("DATABASE_MIN_CONNECTIONS", 2),
                acquire_timeout_secs: parsed_var("DATABASE_ACQUIRE_TIMEOUT_SECS", 30),
            },
        })
    }
}

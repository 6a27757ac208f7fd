use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::ledger::{IsolationLevel, RetryPolicy};

/// Environment variable that overrides `database.url`
pub const DB_SOURCE_ENV: &str = "DB_SOURCE";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

/// Ledger engine settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Isolation level of every transfer unit of work
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Reject transfers between accounts of different currencies
    #[serde(default = "default_check_currency")]
    pub check_currency: bool,
    /// Conflict retries at REPEATABLE READ and SERIALIZABLE
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_check_currency() -> bool {
    true
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            check_currency: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`, then apply environment overrides
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config yaml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(DB_SOURCE_ENV)
            && !url.is_empty()
        {
            tracing::debug!("database.url overridden by {}", DB_SOURCE_ENV);
            self.database.url = url;
        }
    }
}

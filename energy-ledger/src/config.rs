//! Configuration for the ledger

use crate::amount::Amount;
use crate::work::{Backoff, RetryPolicy};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Bank singleton configuration
    pub bank: BankConfig,

    /// Retry policy for accrual and inbound work items
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/energy-ledger"),
            service_name: "energy-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            bank: BankConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Bank singleton configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    /// Balance the bank starts with when the store is first created
    pub initial_balance: Amount,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            initial_balance: Amount::ZERO,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `ENERGY_LEDGER_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(data_dir) = std::env::var("ENERGY_LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(balance) = std::env::var("ENERGY_LEDGER_BANK_INITIAL_BALANCE") {
            self.bank.initial_balance = balance.parse()?;
        }

        if let Ok(secs) = std::env::var("ENERGY_LEDGER_RETRY_BASE_DELAY_SECS") {
            self.retry.base_delay_secs = parse_env("ENERGY_LEDGER_RETRY_BASE_DELAY_SECS", &secs)?;
        }

        if let Ok(secs) = std::env::var("ENERGY_LEDGER_RETRY_MAX_DELAY_SECS") {
            self.retry.max_delay_secs = parse_env("ENERGY_LEDGER_RETRY_MAX_DELAY_SECS", &secs)?;
        }

        if let Ok(max) = std::env::var("ENERGY_LEDGER_RETRY_MAX_RETRIES") {
            self.retry.max_retries = parse_env("ENERGY_LEDGER_RETRY_MAX_RETRIES", &max)?;
        }

        if let Ok(backoff) = std::env::var("ENERGY_LEDGER_RETRY_BACKOFF") {
            self.retry.backoff = match backoff.trim().to_ascii_lowercase().as_str() {
                "fixed" => Backoff::Fixed,
                "exponential" => Backoff::Exponential,
                other => {
                    return Err(Error::Config(format!(
                        "ENERGY_LEDGER_RETRY_BACKOFF must be fixed or exponential, got '{}'",
                        other
                    )))
                }
            };
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "energy-ledger");
        assert_eq!(config.bank.initial_balance, Amount::ZERO);
        assert_eq!(config.retry.base_delay_secs, 600);
    }

    #[test]
    fn test_from_toml() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/energy"
            service_name = "energy-ledger"
            service_version = "0.1.0"

            [rocksdb]
            write_buffer_size_mb = 32
            max_write_buffer_number = 2
            max_background_jobs = 1
            enable_statistics = true

            [bank]
            initial_balance = "5000000"

            [retry]
            base_delay_secs = 60
            max_delay_secs = 900
            max_retries = 5
            backoff = "fixed"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/energy"));
        assert_eq!(config.bank.initial_balance, Amount::from_units(5_000_000));
        assert_eq!(config.retry.backoff, Backoff::Fixed);
        assert_eq!(config.retry.max_retries, 5);
    }
}

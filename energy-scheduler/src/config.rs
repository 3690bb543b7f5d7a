//! Configuration for the scheduler node

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sweep interval per work source (seconds)
    pub interval_secs: u64,

    /// Upper bound of the random delay added before each sweep after the first (seconds)
    pub jitter_secs: u64,

    /// Keys listed per page while a sweep walks its backlog
    pub batch_size: usize,

    /// Items processed concurrently within one sweep
    pub max_concurrency: usize,

    /// Run the accrual sweep
    pub accrual_enabled: bool,

    /// Run the inbound sweep
    pub inbound_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600, // 10 minutes
            jitter_secs: 30,
            batch_size: 500,
            max_concurrency: 16,
            accrual_enabled: true,
            inbound_enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Sweep period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::Config("interval_secs must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be positive".to_string()));
        }
        Ok(())
    }
}

/// Everything the `energy-node` process needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Ledger store, bank and retry policy
    pub ledger: energy_ledger::Config,

    /// Sweep settings
    pub scheduler: SchedulerConfig,

    /// Emit JSON log lines instead of the human-readable format
    pub log_json: bool,
}

impl NodeConfig {
    /// Load from file, then apply environment overrides
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: NodeConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.apply_env()?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = NodeConfig::default();
        config.apply_env()?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Override fields from `ENERGY_LEDGER_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.ledger.apply_env()?;

        if let Some(secs) = read_env("ENERGY_LEDGER_SCHEDULER_INTERVAL_SECS")? {
            self.scheduler.interval_secs = secs;
        }
        if let Some(secs) = read_env("ENERGY_LEDGER_SCHEDULER_JITTER_SECS")? {
            self.scheduler.jitter_secs = secs;
        }
        if let Some(size) = read_env("ENERGY_LEDGER_SCHEDULER_BATCH_SIZE")? {
            self.scheduler.batch_size = size;
        }
        if let Some(concurrency) = read_env("ENERGY_LEDGER_SCHEDULER_MAX_CONCURRENCY")? {
            self.scheduler.max_concurrency = concurrency;
        }
        if let Some(enabled) = read_env("ENERGY_LEDGER_SCHEDULER_ACCRUAL_ENABLED")? {
            self.scheduler.accrual_enabled = enabled;
        }
        if let Some(enabled) = read_env("ENERGY_LEDGER_SCHEDULER_INBOUND_ENABLED")? {
            self.scheduler.inbound_enabled = enabled;
        }
        if let Some(json) = read_env("ENERGY_LEDGER_LOG_JSON")? {
            self.log_json = json;
        }
        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

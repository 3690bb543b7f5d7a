//! Error types for the retry scheduler

use thiserror::Error;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Scheduler errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] energy_ledger::Error),

    /// Deposit feed could not be read
    #[error("Feed error: {0}")]
    Feed(String),

    /// A work key could not be interpreted by its source
    #[error("Invalid work key '{0}'")]
    InvalidKey(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Worth another attempt later
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Ledger(inner) => inner.is_transient(),
            Error::Feed(_) | Error::Io(_) => true,
            Error::InvalidKey(_) | Error::Config(_) | Error::Metrics(_) => false,
        }
    }
}

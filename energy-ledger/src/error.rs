//! Error types for the ledger
//!
//! Every error maps to a stable [`ErrorCode`] and a [`RetryDisposition`] so
//! callers can tell "never retry with this key" apart from "safe to retry
//! later" without matching on variants.

use serde::Serialize;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Non-positive, malformed or overflowing amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Source or destination does not resolve to an account
    #[error("Unknown party: {0}")]
    UnknownParty(String),

    /// A user-side balance would go negative
    #[error("Insufficient balance for {party}: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Party whose balance is short
        party: String,
        /// Balance before the attempted mutation
        available: String,
        /// Amount that was requested
        requested: String,
    },

    /// Monetary request without an idempotency key
    #[error("Idempotency key is required for balance-changing requests")]
    MissingIdempotencyKey,

    /// Same key reused for a different logical request
    #[error("Idempotency key conflict: {0}")]
    IdempotencyKeyConflict(String),

    /// Malformed external input (memo, payload)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient failure; the same request may succeed later
    #[error("Transient error: {0}")]
    Transient(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding error (fingerprints, stored responses, ETags)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Amount rejected
    InvalidAmount,
    /// Party unknown
    UnknownParty,
    /// Balance too low
    InsufficientBalance,
    /// Key missing
    IdempotencyKeyRequired,
    /// Key reused for different content
    IdempotencyKeyConflict,
    /// Input rejected
    ValidationError,
    /// Infrastructure hiccup
    TransientInfraError,
    /// Record absent
    NotFound,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidAmount => "invalid_amount",
            ErrorCode::UnknownParty => "unknown_party",
            ErrorCode::InsufficientBalance => "insufficient_balance",
            ErrorCode::IdempotencyKeyRequired => "idempotency_key_required",
            ErrorCode::IdempotencyKeyConflict => "idempotency_key_conflict",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::TransientInfraError => "transient_infra_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Whether a caller may resubmit the same request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    /// Resubmitting with this key cannot succeed
    DoNotRetry,
    /// Resubmitting later with the same key is safe
    RetryLater,
}

impl Error {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidAmount(_) => ErrorCode::InvalidAmount,
            Error::UnknownParty(_) => ErrorCode::UnknownParty,
            Error::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            Error::MissingIdempotencyKey => ErrorCode::IdempotencyKeyRequired,
            Error::IdempotencyKeyConflict(_) => ErrorCode::IdempotencyKeyConflict,
            Error::Validation(_) => ErrorCode::ValidationError,
            Error::Transient(_) | Error::Storage(_) | Error::Io(_) => ErrorCode::TransientInfraError,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Serialization(_) | Error::Json(_) | Error::Config(_) | Error::Metrics(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Retry guidance for this error
    ///
    /// Insufficient balance is retryable: no row was written, so the same
    /// key can succeed once the balance has grown.
    pub fn disposition(&self) -> RetryDisposition {
        match self.code() {
            ErrorCode::TransientInfraError | ErrorCode::InsufficientBalance => {
                RetryDisposition::RetryLater
            }
            _ => RetryDisposition::DoNotRetry,
        }
    }

    /// Transient infrastructure failure
    pub fn is_transient(&self) -> bool {
        self.code() == ErrorCode::TransientInfraError
    }
}

/// Structured error body handed to user-facing collaborators
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Stable code
    pub code: ErrorCode,
    /// Retry guidance
    pub disposition: RetryDisposition,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            disposition: err.disposition(),
            message: err.to_string(),
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispositions() {
        assert_eq!(Error::Storage("down".into()).disposition(), RetryDisposition::RetryLater);
        assert_eq!(Error::Transient("timeout".into()).disposition(), RetryDisposition::RetryLater);
        assert_eq!(
            Error::IdempotencyKeyConflict("k".into()).disposition(),
            RetryDisposition::DoNotRetry
        );
        assert_eq!(Error::Validation("memo".into()).disposition(), RetryDisposition::DoNotRetry);
        assert_eq!(Error::MissingIdempotencyKey.code().as_str(), "idempotency_key_required");
    }

    #[test]
    fn test_error_response_serializes_codes() {
        let err = Error::UnknownParty("user:42".into());
        let body = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(body["code"], "unknown_party");
        assert_eq!(body["disposition"], "do_not_retry");
    }
}

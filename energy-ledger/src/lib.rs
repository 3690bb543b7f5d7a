//! Energy Ledger
//!
//! Idempotent token ledger with per-second energy accrual and inbound
//! deposit reconciliation.
//!
//! # Architecture
//!
//! - **Single transfer primitive**: every balance change is a keyed
//!   [`Ledger::transfer`]; replays return the committed row
//! - **Keyed exclusive sections**: per-account locks, sorted acquisition
//! - **Atomic commits**: balances, ledger row and indexes in one RocksDB batch
//! - **Work items**: accrual and inbound backlogs share one retry shape
//!
//! # Invariants
//!
//! - User balances never go negative; the bank may, and such rows are flagged
//! - One ledger row per idempotency key, one credit per `tx_hash`
//! - Amounts carry 8 fractional digits and are truncated, never rounded up

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accrual;
pub mod admin;
pub mod amount;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod inbound;
pub mod ledger;
pub mod locks;
pub mod memo;
pub mod metrics;
pub mod read_model;
pub mod service;
pub mod storage;
pub mod types;
pub mod work;

// Re-exports
pub use accrual::AccrualEngine;
pub use admin::{AdminChannel, Adjustment};
pub use amount::Amount;
pub use config::Config;
pub use error::{Error, ErrorCode, ErrorResponse, Result, RetryDisposition};
pub use idempotency::{IdempotencyGuard, RequestFingerprint};
pub use inbound::{IdentityResolver, InboundReconciler, StoreResolver};
pub use ledger::Ledger;
pub use locks::{LockKey, LockManager};
pub use metrics::Metrics;
pub use read_model::{Conditional, Page, PageRequest, ReadModel};
pub use service::RequestService;
pub use storage::Storage;
pub use types::{
    Account, AccountId, BankAccount, DepositEvent, Domain, InboundEvent, InboundStatus,
    LedgerEntry, OperationType, Party, TransferRequest,
};
pub use work::{FailureOutcome, RetryPolicy, WorkItem};

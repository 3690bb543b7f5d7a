//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode on disk, JSON at the edges)
//! - Exact arithmetic ([`Amount`] for tokens and energy)
//! - Immutability of committed ledger rows

use crate::amount::Amount;
use crate::memo::ParsedMemo;
use crate::work::{RetrySchedule, WorkItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account identifier (the external numeric identity of a user)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(u64);

impl AccountId {
    /// Create new account ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identity
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Big-endian storage key
    pub fn to_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One side of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The bank singleton; may go negative
    Bank,
    /// A user's main (token) balance
    User(AccountId),
    /// A user's bonus balance
    UserBonus(AccountId),
}

impl Party {
    /// Account behind a user-side party
    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            Party::Bank => None,
            Party::User(id) | Party::UserBonus(id) => Some(*id),
        }
    }

    /// Index prefix shared by every balance of the same owner
    pub fn owner_key(&self) -> String {
        match self.account_id() {
            Some(id) => format!("user:{}", id),
            None => "bank".to_string(),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Bank => write!(f, "bank"),
            Party::User(id) => write!(f, "user:{}", id),
            Party::UserBonus(id) => write!(f, "user:{}:bonus", id),
        }
    }
}

/// Business domain that produced a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Energy to token conversion
    Exchange,
    /// Inbound on-chain deposit
    Deposit,
    /// Packaged token purchase or catalog purchase
    Shop,
    /// VIP entitlement purchase
    VipPurchase,
    /// Withdrawal request debit
    Withdrawal,
    /// Bonus credit
    Bonus,
    /// Administrative correction
    Admin,
}

/// Direction of a movement relative to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Bank to user
    Credit,
    /// User to bank
    Debit,
    /// Energy converted into tokens (bank to user)
    Conversion,
}

/// A user account (token balances, energy and accrual bookkeeping)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Identity
    pub id: AccountId,
    /// Token balance
    pub main_balance: Amount,
    /// Bonus token balance
    pub bonus_balance: Amount,
    /// Energy available for conversion
    pub available_energy: Amount,
    /// Lifetime generated energy
    pub total_generated_energy: Amount,
    /// VIP generation rate applies
    pub is_vip: bool,
    /// Last accrual checkpoint (None until the first tick)
    pub last_accrual_at: Option<DateTime<Utc>>,
    /// Accrual work-item status
    pub accrual_status: AccrualStatus,
    /// Accrual retry bookkeeping
    pub accrual_schedule: RetrySchedule,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account with zero balances
    pub fn new(id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            main_balance: Amount::ZERO,
            bonus_balance: Amount::ZERO,
            available_energy: Amount::ZERO,
            total_generated_energy: Amount::ZERO,
            is_vip: false,
            last_accrual_at: None,
            accrual_status: AccrualStatus::Pending,
            accrual_schedule: RetrySchedule::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Balance that a party addresses on this account
    pub fn balance_for(&self, party: &Party) -> Option<Amount> {
        match party {
            Party::User(id) if *id == self.id => Some(self.main_balance),
            Party::UserBonus(id) if *id == self.id => Some(self.bonus_balance),
            _ => None,
        }
    }

    /// Mutable balance that a party addresses on this account
    pub fn balance_mut(&mut self, party: &Party) -> Option<&mut Amount> {
        match party {
            Party::User(id) if *id == self.id => Some(&mut self.main_balance),
            Party::UserBonus(id) if *id == self.id => Some(&mut self.bonus_balance),
            _ => None,
        }
    }

    /// Every balance field is non-negative
    pub fn is_solvent(&self) -> bool {
        !self.main_balance.is_negative()
            && !self.bonus_balance.is_negative()
            && !self.available_energy.is_negative()
            && !self.total_generated_energy.is_negative()
    }
}

/// Accrual state of an account (never terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccrualStatus {
    /// Waiting for the next sweep
    Pending,
    /// Last attempt failed; retried once `next_retry_at` arrives
    ErrorRetryable,
}

impl WorkItem for Account {
    fn work_key(&self) -> String {
        self.id.to_string()
    }

    fn schedule(&self) -> &RetrySchedule {
        &self.accrual_schedule
    }

    fn schedule_mut(&mut self) -> &mut RetrySchedule {
        &mut self.accrual_schedule
    }

    fn is_terminal(&self) -> bool {
        false
    }

    fn mark_retryable(&mut self, _reason: &str) {
        self.accrual_status = AccrualStatus::ErrorRetryable;
    }

    // Accrual has no terminal failure: the item stays retryable at max delay.
    fn mark_exhausted(&mut self, _reason: &str) {
        self.accrual_status = AccrualStatus::ErrorRetryable;
    }
}

/// The bank singleton
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankAccount {
    /// Balance, may be negative
    pub balance: Amount,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl BankAccount {
    /// Bank with an opening balance
    pub fn new(balance: Amount, now: DateTime<Utc>) -> Self {
        Self { balance, updated_at: now }
    }

    /// Balance is below zero
    pub fn in_deficit(&self) -> bool {
        self.balance.is_negative()
    }
}

/// Balances of both parties right after a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultingBalances {
    /// Source balance after the movement
    pub source: Amount,
    /// Destination balance after the movement
    pub destination: Amount,
}

/// Immutable record of one committed movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,
    /// Commit order, strictly increasing
    pub sequence: u64,
    /// Caller-supplied key, globally unique
    pub idempotency_key: String,
    /// Business domain
    pub domain: Domain,
    /// Movement kind
    pub operation_type: OperationType,
    /// Debited party
    pub source_party: Party,
    /// Credited party
    pub destination_party: Party,
    /// Amount moved
    pub amount: Amount,
    /// Balances after the commit
    pub resulting_balances: ResultingBalances,
    /// Bank balance was negative after this commit
    pub processed_with_deficit: bool,
    /// External transaction for inbound credits
    pub tx_hash: Option<String>,
    /// Commit timestamp
    pub created_at: DateTime<Utc>,
}

/// Input to [`crate::Ledger::transfer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Caller-supplied key
    pub idempotency_key: String,
    /// Business domain
    pub domain: Domain,
    /// Movement kind
    pub operation_type: OperationType,
    /// Debited party
    pub source: Party,
    /// Credited party
    pub destination: Party,
    /// Amount to move
    pub amount: Amount,
    /// External transaction reference
    pub tx_hash: Option<String>,
}

impl TransferRequest {
    /// Bank to user main balance
    pub fn credit(key: impl Into<String>, domain: Domain, to: AccountId, amount: Amount) -> Self {
        Self {
            idempotency_key: key.into(),
            domain,
            operation_type: OperationType::Credit,
            source: Party::Bank,
            destination: Party::User(to),
            amount,
            tx_hash: None,
        }
    }

    /// User main balance to bank
    pub fn debit(key: impl Into<String>, domain: Domain, from: AccountId, amount: Amount) -> Self {
        Self {
            idempotency_key: key.into(),
            domain,
            operation_type: OperationType::Debit,
            source: Party::User(from),
            destination: Party::Bank,
            amount,
            tx_hash: None,
        }
    }

    /// Attach an external transaction reference
    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }
}

/// Deposit observed by the chain client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositEvent {
    /// External transaction hash, globally unique
    pub tx_hash: String,
    /// Amount transferred on chain
    pub amount: Amount,
    /// Free-form memo attached to the transfer
    pub memo: String,
    /// When the chain client saw the transfer
    pub observed_at: DateTime<Utc>,
    /// Sender wallet, when the client reports it
    pub from_address: Option<String>,
}

/// Reconciliation state of an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundStatus {
    /// Stored, memo not yet decoded
    Received,
    /// Memo decoded, credit pending
    Parsed,
    /// Ledger credit committed (terminal)
    Credited,
    /// Permanently rejected (terminal)
    ErrorValidation,
    /// Transient failure, retried when due
    ErrorRetryable,
}

impl InboundStatus {
    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, InboundStatus::Credited | InboundStatus::ErrorValidation)
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundStatus::Received => "received",
            InboundStatus::Parsed => "parsed",
            InboundStatus::Credited => "credited",
            InboundStatus::ErrorValidation => "error_validation",
            InboundStatus::ErrorRetryable => "error_retryable",
        }
    }
}

impl fmt::Display for InboundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound deposit tracked through reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// External transaction hash
    pub tx_hash: String,
    /// Current state
    pub status: InboundStatus,
    /// Event as observed
    pub payload: DepositEvent,
    /// Decoded memo once parsed
    pub memo: Option<ParsedMemo>,
    /// Retry bookkeeping
    pub schedule: RetrySchedule,
    /// Ledger row of the credit
    pub credited_ledger_entry_id: Option<Uuid>,
    /// First observation
    pub created_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Newly observed event
    pub fn received(payload: DepositEvent, now: DateTime<Utc>) -> Self {
        Self {
            tx_hash: payload.tx_hash.clone(),
            status: InboundStatus::Received,
            payload,
            memo: None,
            schedule: RetrySchedule::default(),
            credited_ledger_entry_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ledger idempotency key of the credit
    pub fn credit_key(&self) -> String {
        format!("inbound:{}", self.tx_hash)
    }
}

impl WorkItem for InboundEvent {
    fn work_key(&self) -> String {
        self.tx_hash.clone()
    }

    fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    fn schedule_mut(&mut self) -> &mut RetrySchedule {
        &mut self.schedule
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn mark_retryable(&mut self, _reason: &str) {
        self.status = InboundStatus::ErrorRetryable;
    }

    fn mark_exhausted(&mut self, reason: &str) {
        self.status = InboundStatus::ErrorValidation;
        self.schedule.last_error = Some(format!("retries exhausted: {}", reason));
    }
}

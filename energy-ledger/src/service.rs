//! Client request facade
//!
//! Every user-initiated monetary request passes through the idempotency
//! guard before it reaches the ledger. The ledger key is derived from the
//! client key with a per-operation prefix so client keys can never collide
//! with keys the system mints itself (such as `inbound:<tx_hash>`).

use crate::{
    amount::Amount,
    idempotency::{IdempotencyGuard, RequestFingerprint},
    ledger::Ledger,
    types::{AccountId, Domain, LedgerEntry, OperationType, Party, TransferRequest},
    Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Convert energy into tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertRequest {
    /// Account converting
    pub account: AccountId,
    /// Energy to convert
    pub amount: Amount,
}

/// Pay for a catalog item from the main balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    /// Buyer
    pub account: AccountId,
    /// Catalog item
    pub sku: String,
    /// Price in tokens
    pub price: Amount,
}

/// Withdraw tokens to an external wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    /// Account withdrawing
    pub account: AccountId,
    /// Tokens to withdraw
    pub amount: Amount,
    /// Destination wallet, paid out by the payout collaborator
    pub to_address: String,
}

/// Credit a bonus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BonusRequest {
    /// Recipient
    pub account: AccountId,
    /// Bonus amount
    pub amount: Amount,
    /// Free-form reason (task reward, referral, ...)
    pub reason: String,
}

/// User-facing monetary operations
#[derive(Debug, Clone)]
pub struct RequestService {
    ledger: Arc<Ledger>,
    guard: IdempotencyGuard,
}

impl RequestService {
    /// Service over the ledger with a guard sharing its store and locks
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let guard = IdempotencyGuard::new(
            Arc::clone(ledger.storage()),
            Arc::clone(ledger.locks()),
            ledger.metrics().clone(),
        );
        Self { ledger, guard }
    }

    /// Convert energy into tokens (1:1, one way)
    pub async fn convert(&self, idempotency_key: &str, request: &ConvertRequest) -> Result<LedgerEntry> {
        let fingerprint = RequestFingerprint::of(&("convert", request))?;
        let ledger_key = format!("exchange:{}", idempotency_key.trim());
        self.guard
            .execute(idempotency_key, &fingerprint, || {
                self.ledger
                    .convert_energy(ledger_key, request.account, request.amount)
            })
            .await
    }

    /// Debit the price of a catalog item
    pub async fn purchase(&self, idempotency_key: &str, request: &PurchaseRequest) -> Result<LedgerEntry> {
        let fingerprint = RequestFingerprint::of(&("purchase", request))?;
        let transfer = TransferRequest::debit(
            format!("shop:{}", idempotency_key.trim()),
            Domain::Shop,
            request.account,
            request.price,
        );
        self.guard
            .execute(idempotency_key, &fingerprint, || self.ledger.transfer(transfer))
            .await
    }

    /// Hold withdrawn tokens in the bank until the payout is made
    pub async fn withdraw(&self, idempotency_key: &str, request: &WithdrawRequest) -> Result<LedgerEntry> {
        let fingerprint = RequestFingerprint::of(&("withdraw", request))?;
        let transfer = TransferRequest::debit(
            format!("withdraw:{}:hold", idempotency_key.trim()),
            Domain::Withdrawal,
            request.account,
            request.amount,
        );
        self.guard
            .execute(idempotency_key, &fingerprint, || self.ledger.transfer(transfer))
            .await
    }

    /// Credit the bonus balance
    pub async fn deposit_bonus(&self, idempotency_key: &str, request: &BonusRequest) -> Result<LedgerEntry> {
        let fingerprint = RequestFingerprint::of(&("bonus", request))?;
        let transfer = TransferRequest {
            idempotency_key: format!("bonus:{}", idempotency_key.trim()),
            domain: Domain::Bonus,
            operation_type: OperationType::Credit,
            source: Party::Bank,
            destination: Party::UserBonus(request.account),
            amount: request.amount,
            tx_hash: None,
        };
        self.guard
            .execute(idempotency_key, &fingerprint, || self.ledger.transfer(transfer))
            .await
    }
}

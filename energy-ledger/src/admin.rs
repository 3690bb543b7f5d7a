//! Administrative corrections
//!
//! Operators never write balances directly. A correction is an ordinary
//! ledger transfer under the `admin` domain: it needs an idempotency key and
//! leaves a row like every other movement. Operator keys live under the
//! `admin:` namespace so they can never take over another flow's key.

use crate::{
    amount::Amount,
    ledger::Ledger,
    types::{AccountId, Domain, LedgerEntry, OperationType, Party, TransferRequest},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which user balance a correction touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceKind {
    /// Main token balance
    Main,
    /// Bonus balance
    Bonus,
}

/// Direction of a correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustDirection {
    /// Bank to user
    Credit,
    /// User to bank
    Debit,
}

/// A requested correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    /// Idempotency key supplied by the operator tool
    pub idempotency_key: String,
    /// Target account
    pub account: AccountId,
    /// Main or bonus
    pub balance: BalanceKind,
    /// Credit or debit
    pub direction: AdjustDirection,
    /// Amount to move
    pub amount: Amount,
}

/// Correction channel over the ledger
#[derive(Debug, Clone)]
pub struct AdminChannel {
    ledger: Arc<Ledger>,
}

impl AdminChannel {
    /// Create a channel over the ledger
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Apply a correction as a ledger transfer keyed `admin:<key>`
    pub async fn adjust(&self, adjustment: Adjustment) -> Result<LedgerEntry> {
        let key = adjustment.idempotency_key.trim();
        if key.is_empty() {
            return Err(Error::MissingIdempotencyKey);
        }
        let ledger_key = format!("admin:{}", key);

        let user = match adjustment.balance {
            BalanceKind::Main => Party::User(adjustment.account),
            BalanceKind::Bonus => Party::UserBonus(adjustment.account),
        };
        let (operation_type, source, destination) = match adjustment.direction {
            AdjustDirection::Credit => (OperationType::Credit, Party::Bank, user),
            AdjustDirection::Debit => (OperationType::Debit, user, Party::Bank),
        };

        tracing::info!(
            idempotency_key = %ledger_key,
            account = %adjustment.account,
            direction = ?adjustment.direction,
            amount = %adjustment.amount,
            "Admin adjustment requested"
        );

        self.ledger
            .transfer(TransferRequest {
                idempotency_key: ledger_key,
                domain: Domain::Admin,
                operation_type,
                source,
                destination,
                amount: adjustment.amount,
                tx_hash: None,
            })
            .await
    }
}

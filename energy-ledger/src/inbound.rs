//! Inbound deposit reconciliation
//!
//! Turns deposits observed on chain into ledger credits exactly once per
//! `tx_hash`:
//!
//! ```text
//! received ──parse ok──▶ parsed ──credit ok──▶ credited
//!    │                     │  ▲
//!    │ bad memo/amount     │  │ retry when due
//!    ▼                     ▼  │
//! error_validation ◀── error_retryable (after max_retries)
//! ```
//!
//! The credit uses the ledger key `inbound:<tx_hash>`, so even a crash between
//! the ledger commit and the status update cannot credit twice: the retry
//! replays the committed row and only the status is written.

use crate::{
    locks::LockKey,
    ledger::Ledger,
    memo::parse_memo,
    storage::Storage,
    types::{AccountId, DepositEvent, InboundEvent, InboundStatus, TransferRequest},
    work::{self, FailureOutcome, WorkItem},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Maps the identity carried in a memo to a ledger account
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Account for `identity`
    ///
    /// A transient error leaves the event retryable; any other error rejects it.
    async fn resolve(&self, identity: AccountId) -> Result<AccountId>;
}

/// Resolves identities against accounts already present in the store
#[derive(Debug, Clone)]
pub struct StoreResolver {
    storage: Arc<Storage>,
}

impl StoreResolver {
    /// Create a resolver over the store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl IdentityResolver for StoreResolver {
    async fn resolve(&self, identity: AccountId) -> Result<AccountId> {
        match self.storage.get_account(identity)? {
            Some(account) => Ok(account.id),
            // the account may simply not have been created yet
            None => Err(Error::Transient(format!("account {} not yet available", identity))),
        }
    }
}

/// Drives inbound events through their state machine
#[derive(Clone)]
pub struct InboundReconciler {
    ledger: Arc<Ledger>,
    resolver: Arc<dyn IdentityResolver>,
}

impl std::fmt::Debug for InboundReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundReconciler").finish_non_exhaustive()
    }
}

impl InboundReconciler {
    /// Reconciler with the default [`StoreResolver`]
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let resolver = Arc::new(StoreResolver::new(Arc::clone(ledger.storage())));
        Self::with_resolver(ledger, resolver)
    }

    /// Reconciler with a custom identity resolver
    pub fn with_resolver(ledger: Arc<Ledger>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { ledger, resolver }
    }

    /// Record a deposit; a known `tx_hash` returns the stored event unchanged
    pub async fn observe(&self, deposit: DepositEvent, now: DateTime<Utc>) -> Result<InboundEvent> {
        let _guard = self
            .ledger
            .locks()
            .acquire([LockKey::Inbound(deposit.tx_hash.clone())])
            .await;

        let storage = self.ledger.storage();
        if let Some(existing) = storage.get_inbound(&deposit.tx_hash)? {
            tracing::debug!(tx_hash = %deposit.tx_hash, status = %existing.status, "Deposit already known");
            return Ok(existing);
        }

        let event = InboundEvent::received(deposit, now);
        storage.put_inbound(&event)?;
        self.ledger.metrics().record_inbound(event.status.as_str());
        tracing::info!(
            tx_hash = %event.tx_hash,
            amount = %event.payload.amount,
            memo = %event.payload.memo,
            "Deposit observed"
        );
        Ok(event)
    }

    /// Observe a deposit and, if it is due, advance it
    pub async fn reconcile(&self, deposit: DepositEvent, now: DateTime<Utc>) -> Result<InboundEvent> {
        let event = self.observe(deposit, now).await?;
        if event.is_due(now) {
            self.advance(&event.tx_hash, now).await
        } else {
            Ok(event)
        }
    }

    /// Run the state machine for one event until it credits, fails or is rejected
    ///
    /// Domain outcomes (validation rejection, transient credit failure) are
    /// recorded on the event and returned as `Ok`; `Err` means the event's
    /// own state could not be read or written.
    pub async fn advance(&self, tx_hash: &str, now: DateTime<Utc>) -> Result<InboundEvent> {
        let _guard = self
            .ledger
            .locks()
            .acquire([LockKey::Inbound(tx_hash.to_string())])
            .await;

        let storage = self.ledger.storage();
        let mut event = storage
            .get_inbound(tx_hash)?
            .ok_or_else(|| Error::NotFound(format!("inbound event {}", tx_hash)))?;

        if event.is_terminal() {
            return Ok(event);
        }

        let memo = match event.memo {
            Some(memo) => memo,
            None => {
                let parsed = event
                    .payload
                    .amount
                    .ensure_positive()
                    .and_then(|_| parse_memo(&event.payload.memo));
                match parsed {
                    Ok(memo) => memo,
                    Err(err) => {
                        self.reject(&mut event, &err.to_string(), now)?;
                        return Ok(event);
                    }
                }
            }
        };

        // received -> parsed, or error_retryable -> parsed on a retry
        event.memo = Some(memo);
        self.transition(&mut event, InboundStatus::Parsed, now)?;

        let credited = match self.resolver.resolve(memo.identity).await {
            Ok(account) => {
                let request = TransferRequest::credit(
                    event.credit_key(),
                    memo.domain(),
                    account,
                    memo.credit_amount(event.payload.amount),
                )
                .with_tx_hash(event.tx_hash.clone());
                self.ledger.transfer(request).await
            }
            Err(err) => Err(err),
        };

        match credited {
            Ok(entry) => {
                event.credited_ledger_entry_id = Some(entry.id);
                event.schedule.next_retry_at = None;
                self.transition(&mut event, InboundStatus::Credited, now)?;
                tracing::info!(
                    tx_hash = %event.tx_hash,
                    sequence = entry.sequence,
                    amount = %entry.amount,
                    account = %entry.destination_party,
                    "Deposit credited"
                );
            }
            Err(err) if err.is_transient() => {
                self.fail(&mut event, &err.to_string(), now)?;
            }
            Err(err) => {
                self.reject(&mut event, &err.to_string(), now)?;
            }
        }

        Ok(event)
    }

    /// Record a failed attempt that happened outside the state machine
    pub async fn record_failure(
        &self,
        tx_hash: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let _guard = self
            .ledger
            .locks()
            .acquire([LockKey::Inbound(tx_hash.to_string())])
            .await;

        let mut event = self
            .ledger
            .storage()
            .get_inbound(tx_hash)?
            .ok_or_else(|| Error::NotFound(format!("inbound event {}", tx_hash)))?;
        if event.is_terminal() {
            return Ok(FailureOutcome::Exhausted);
        }
        self.fail(&mut event, reason, now)
    }

    /// Non-terminal events whose retry time has arrived, in tx_hash order after `after`
    pub fn due_events(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InboundEvent>> {
        self.ledger.storage().due_inbound(now, after, limit)
    }

    /// Stored event
    pub fn get(&self, tx_hash: &str) -> Result<Option<InboundEvent>> {
        self.ledger.storage().get_inbound(tx_hash)
    }

    fn transition(&self, event: &mut InboundEvent, status: InboundStatus, now: DateTime<Utc>) -> Result<()> {
        if event.status == status {
            return Ok(());
        }
        tracing::debug!(tx_hash = %event.tx_hash, from = %event.status, to = %status, "Inbound transition");
        event.status = status;
        event.updated_at = now;
        self.ledger.storage().put_inbound(event)?;
        self.ledger.metrics().record_inbound(status.as_str());
        Ok(())
    }

    fn reject(&self, event: &mut InboundEvent, reason: &str, now: DateTime<Utc>) -> Result<()> {
        tracing::warn!(tx_hash = %event.tx_hash, error = %reason, "Deposit rejected");
        event.schedule.last_error = Some(reason.to_string());
        event.schedule.next_retry_at = None;
        self.transition(event, InboundStatus::ErrorValidation, now)
    }

    fn fail(&self, event: &mut InboundEvent, reason: &str, now: DateTime<Utc>) -> Result<FailureOutcome> {
        let outcome = work::record_failure(event, reason, &self.ledger.config().retry, now);
        event.updated_at = now;
        self.ledger.storage().put_inbound(event)?;
        self.ledger.metrics().record_inbound(event.status.as_str());

        match outcome {
            FailureOutcome::Rescheduled(at) => tracing::warn!(
                tx_hash = %event.tx_hash,
                retries_count = event.schedule.retries_count,
                next_retry_at = %at,
                error = %reason,
                "Deposit credit failed, will retry"
            ),
            FailureOutcome::Exhausted => tracing::error!(
                tx_hash = %event.tx_hash,
                retries_count = event.schedule.retries_count,
                error = %reason,
                "Deposit credit retries exhausted"
            ),
        }
        Ok(outcome)
    }
}

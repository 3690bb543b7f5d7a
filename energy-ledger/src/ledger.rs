//! Ledger core: the only place balances change
//!
//! Every balance-changing operation in the system is a [`Ledger::transfer`]
//! (or its conversion variant). A transfer is keyed by a caller-supplied
//! idempotency key; committing the same key twice returns the first row and
//! writes nothing.
//!
//! # Example
//!
//! ```no_run
//! use energy_ledger::{AccountId, Amount, Config, Domain, Ledger, TransferRequest};
//!
//! #[tokio::main]
//! async fn main() -> energy_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!     let user = AccountId::new(42);
//!     ledger.open_account(user, chrono::Utc::now()).await?;
//!
//!     let request = TransferRequest::credit("bonus-42-1", Domain::Bonus, user, Amount::from_units(5));
//!     let entry = ledger.transfer(request).await?;
//!     assert_eq!(entry.resulting_balances.destination, Amount::from_units(5));
//!     Ok(())
//! }
//! ```

use crate::{
    amount::Amount,
    locks::{LockKey, LockManager},
    metrics::Metrics,
    storage::{CommitOutcome, Storage},
    types::{
        Account, AccountId, BankAccount, Domain, LedgerEntry, OperationType, Party, TransferRequest,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Durable state
    storage: Arc<Storage>,

    /// Per-entity exclusive sections
    locks: Arc<LockManager>,

    /// Prometheus metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()?;
        Ok(Self::with_parts(storage, Arc::new(LockManager::new()), metrics, config))
    }

    /// Build from already opened parts
    pub fn with_parts(
        storage: Arc<Storage>,
        locks: Arc<LockManager>,
        metrics: Metrics,
        config: Config,
    ) -> Self {
        Self {
            storage,
            locks,
            metrics,
            config,
        }
    }

    /// Storage handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Lock manager shared with the engines
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Move `amount` from `source` to `destination` exactly once per key
    ///
    /// A user-side balance that would go negative rejects the transfer with
    /// [`Error::InsufficientBalance`] and nothing is written. The bank may go
    /// negative; such rows carry `processed_with_deficit`.
    pub async fn transfer(&self, request: TransferRequest) -> Result<LedgerEntry> {
        self.execute(request, None).await
    }

    /// Convert energy into tokens at the fixed 1:1 rate
    ///
    /// Decreases `available_energy` and credits the same amount from the bank
    /// to the user's main balance in the same commit as the ledger row.
    pub async fn convert_energy(
        &self,
        idempotency_key: impl Into<String>,
        account: AccountId,
        amount: Amount,
    ) -> Result<LedgerEntry> {
        let request = TransferRequest {
            idempotency_key: idempotency_key.into(),
            domain: Domain::Exchange,
            operation_type: OperationType::Conversion,
            source: Party::Bank,
            destination: Party::User(account),
            amount,
            tx_hash: None,
        };
        self.execute(request, Some(amount)).await
    }

    async fn execute(&self, request: TransferRequest, energy: Option<Amount>) -> Result<LedgerEntry> {
        match self.try_execute(&request, energy).await {
            Ok(entry) => Ok(entry),
            Err(err) => {
                self.metrics.record_rejection(err.code().as_str());
                tracing::warn!(
                    idempotency_key = %request.idempotency_key,
                    source = %request.source,
                    destination = %request.destination,
                    amount = %request.amount,
                    error = %err,
                    "Transfer rejected"
                );
                Err(err)
            }
        }
    }

    async fn try_execute(&self, request: &TransferRequest, energy: Option<Amount>) -> Result<LedgerEntry> {
        Self::validate(request)?;

        if let Some(existing) = self.storage.get_entry_by_key(&request.idempotency_key)? {
            self.metrics.record_replay();
            return Ok(existing);
        }

        let mut lock_keys: Vec<LockKey> = [request.source, request.destination]
            .iter()
            .filter_map(Party::account_id)
            .map(LockKey::Account)
            .collect();
        lock_keys.push(LockKey::Ledger(request.idempotency_key.clone()));
        let _guard = self.locks.acquire(lock_keys).await;

        // A concurrent holder of the same key may have committed while we waited
        if let Some(existing) = self.storage.get_entry_by_key(&request.idempotency_key)? {
            self.metrics.record_replay();
            return Ok(existing);
        }

        let now = Utc::now();
        let mut accounts = self.load_accounts(request)?;
        let mut bank_delta = Amount::ZERO;

        match request.source {
            Party::Bank => bank_delta = bank_delta.checked_sub(request.amount)?,
            party => {
                let balance = Self::balance_mut(&mut accounts, &party)?;
                let next = balance.checked_sub(request.amount)?;
                if next.is_negative() {
                    return Err(Error::InsufficientBalance {
                        party: party.to_string(),
                        available: balance.to_string(),
                        requested: request.amount.to_string(),
                    });
                }
                *balance = next;
            }
        }

        match request.destination {
            Party::Bank => bank_delta = bank_delta.checked_add(request.amount)?,
            party => {
                let balance = Self::balance_mut(&mut accounts, &party)?;
                *balance = balance.checked_add(request.amount)?;
            }
        }

        if let Some(energy) = energy {
            let party = request.destination;
            let account = party
                .account_id()
                .and_then(|id| accounts.iter_mut().find(|a| a.id == id))
                .ok_or_else(|| Error::UnknownParty(party.to_string()))?;
            let next = account.available_energy.checked_sub(energy)?;
            if next.is_negative() {
                return Err(Error::InsufficientBalance {
                    party: format!("{}:energy", party),
                    available: account.available_energy.to_string(),
                    requested: energy.to_string(),
                });
            }
            account.available_energy = next;
        }

        for account in &mut accounts {
            account.updated_at = now;
        }

        let started = Instant::now();
        let outcome = self.storage.commit_transfer(request, &accounts, bank_delta, now)?;

        match outcome {
            CommitOutcome::Replayed(entry) => {
                self.metrics.record_replay();
                Ok(entry)
            }
            CommitOutcome::Committed(entry) => {
                let bank_balance = match (entry.source_party, entry.destination_party) {
                    (Party::Bank, _) => Some(entry.resulting_balances.source.to_f64()),
                    (_, Party::Bank) => Some(entry.resulting_balances.destination.to_f64()),
                    _ => None,
                };
                self.metrics.record_commit(
                    entry.processed_with_deficit,
                    bank_balance,
                    started.elapsed().as_secs_f64(),
                );

                if entry.processed_with_deficit {
                    tracing::warn!(
                        idempotency_key = %entry.idempotency_key,
                        amount = %entry.amount,
                        bank_balance = %entry.resulting_balances.source,
                        "Transfer processed with bank deficit"
                    );
                } else {
                    tracing::info!(
                        idempotency_key = %entry.idempotency_key,
                        sequence = entry.sequence,
                        source = %entry.source_party,
                        destination = %entry.destination_party,
                        amount = %entry.amount,
                        "Transfer committed"
                    );
                }
                Ok(entry)
            }
        }
    }

    fn validate(request: &TransferRequest) -> Result<()> {
        if request.idempotency_key.trim().is_empty() {
            return Err(Error::MissingIdempotencyKey);
        }
        request.amount.ensure_positive()?;
        if request.source == request.destination {
            return Err(Error::Validation(format!(
                "source and destination are both {}",
                request.source
            )));
        }
        Ok(())
    }

    fn load_accounts(&self, request: &TransferRequest) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = Vec::with_capacity(2);
        for party in [request.source, request.destination] {
            let Some(id) = party.account_id() else { continue };
            if accounts.iter().any(|a| a.id == id) {
                continue;
            }
            let account = self
                .storage
                .get_account(id)?
                .ok_or_else(|| Error::UnknownParty(party.to_string()))?;
            accounts.push(account);
        }
        Ok(accounts)
    }

    fn balance_mut<'a>(accounts: &'a mut [Account], party: &Party) -> Result<&'a mut Amount> {
        accounts
            .iter_mut()
            .find_map(|account| account.balance_mut(party))
            .ok_or_else(|| Error::UnknownParty(party.to_string()))
    }

    /// Create the account on first interaction; existing accounts are returned as-is
    pub async fn open_account(&self, id: AccountId, now: DateTime<Utc>) -> Result<Account> {
        let _guard = self.locks.acquire([LockKey::Account(id)]).await;

        if let Some(existing) = self.storage.get_account(id)? {
            return Ok(existing);
        }

        let account = Account::new(id, now);
        self.storage.put_account(&account)?;
        tracing::info!(account = %id, "Account opened");
        Ok(account)
    }

    /// Record the VIP entitlement reported by the ownership check
    pub async fn set_vip(&self, id: AccountId, is_vip: bool, now: DateTime<Utc>) -> Result<Account> {
        let _guard = self.locks.acquire([LockKey::Account(id)]).await;

        let mut account = self
            .storage
            .get_account(id)?
            .ok_or_else(|| Error::UnknownParty(Party::User(id).to_string()))?;
        if account.is_vip != is_vip {
            account.is_vip = is_vip;
            account.updated_at = now;
            self.storage.put_account(&account)?;
            tracing::info!(account = %id, is_vip, "VIP status changed");
        }
        Ok(account)
    }

    /// Get account
    pub fn get_account(&self, id: AccountId) -> Result<Account> {
        self.storage
            .get_account(id)?
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))
    }

    /// Get the bank singleton
    pub fn get_bank(&self) -> Result<BankAccount> {
        self.storage.get_bank()
    }

    /// Get ledger row by idempotency key
    pub fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        self.storage.get_entry_by_key(idempotency_key)
    }
}

//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - User accounts (key: account id, big-endian)
//! - `bank` - Bank singleton (key: `bank`)
//! - `ledger` - Append-only ledger rows (key: sequence, big-endian)
//! - `idempotency` - Ledger idempotency index (key: idempotency key, value: sequence)
//! - `requests` - Idempotency guard records (key: request key)
//! - `inbound` - Inbound events (key: tx_hash)
//! - `inbound_pending` - Non-terminal inbound events (key: tx_hash)
//! - `party_index` - Ledger rows per owner (key: owner || `|` || sequence)
//!
//! Every balance mutation goes through [`Storage::commit_transfer`], which
//! writes the balances, the ledger row and all of its indexes in one
//! `WriteBatch`.

use crate::{
    amount::Amount,
    error::{Error, Result},
    idempotency::IdempotencyRecord,
    types::{
        Account, AccountId, BankAccount, InboundEvent, LedgerEntry, Party, ResultingBalances,
        TransferRequest,
    },
    work::WorkItem,
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_BANK: &str = "bank";
const CF_LEDGER: &str = "ledger";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_REQUESTS: &str = "requests";
const CF_INBOUND: &str = "inbound";
const CF_INBOUND_PENDING: &str = "inbound_pending";
const CF_PARTY_INDEX: &str = "party_index";

const BANK_KEY: &[u8] = b"bank";

/// Result of a commit attempt
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// New row written
    Committed(LedgerEntry),
    /// The key was already committed; nothing was written
    Replayed(LedgerEntry),
}

impl CommitOutcome {
    /// Ledger row either way
    pub fn into_entry(self) -> LedgerEntry {
        match self {
            CommitOutcome::Committed(entry) | CommitOutcome::Replayed(entry) => entry,
        }
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    // next sequence; held for the whole commit so bank updates and sequence
    // assignment are serialized
    commit: Mutex<u64>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("next_sequence", &*self.commit.lock())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_BANK, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_LEDGER, Self::cf_options_ledger()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_REQUESTS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_INBOUND, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_INBOUND_PENDING, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_PARTY_INDEX, Self::cf_options_index()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let storage = Self {
            db: Arc::new(db),
            commit: Mutex::new(1),
        };

        let next_sequence = storage.last_sequence()?.map_or(1, |seq| seq + 1);
        *storage.commit.lock() = next_sequence;
        storage.init_bank(config.bank.initial_balance)?;

        tracing::info!(
            path = ?path,
            next_sequence,
            "Opened RocksDB ledger store"
        );

        Ok(storage)
    }

    // Column family options

    fn cf_options_ledger() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn init_bank(&self, initial_balance: Amount) -> Result<()> {
        let cf = self.cf_handle(CF_BANK)?;
        if self.db.get_cf(cf, BANK_KEY)?.is_none() {
            let bank = BankAccount::new(initial_balance, Utc::now());
            self.db.put_cf(cf, BANK_KEY, bincode::serialize(&bank)?)?;
            tracing::info!(balance = %initial_balance, "Bank account initialized");
        }
        Ok(())
    }

    fn last_sequence(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_LEDGER)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(decode_sequence(&key)?))
            }
            None => Ok(None),
        }
    }

    // Account operations

    /// Get account by ID
    pub fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        self.db
            .get_cf(cf, id.to_key())?
            .map(|value| bincode::deserialize(&value).map_err(Error::from))
            .transpose()
    }

    /// Put account (callers hold the account's lock)
    pub fn put_account(&self, account: &Account) -> Result<()> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        self.db
            .put_cf(cf, account.id.to_key(), bincode::serialize(account)?)?;
        Ok(())
    }

    /// Due accounts in id order, starting after `after`, at most `limit`
    pub fn due_accounts(
        &self,
        now: DateTime<Utc>,
        after: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let start = after.map(|id| id.to_key());
        let mode = match &start {
            Some(key) => IteratorMode::From(key, Direction::Forward),
            None => IteratorMode::Start,
        };

        let accounts = self
            .db
            .iterator_cf(cf, mode)
            .filter(|item| match (item, &start) {
                (Ok((key, _)), Some(start)) => key[..] != start[..],
                _ => true,
            })
            .map(|item| -> Result<Account> {
                let (_, value) = item?;
                Ok(bincode::deserialize(&value)?)
            });
        crate::work::select_due(accounts, now, limit)
    }

    // Bank operations

    /// Get the bank singleton
    pub fn get_bank(&self) -> Result<BankAccount> {
        let cf = self.cf_handle(CF_BANK)?;
        let value = self
            .db
            .get_cf(cf, BANK_KEY)?
            .ok_or_else(|| Error::NotFound("bank account".to_string()))?;
        Ok(bincode::deserialize(&value)?)
    }

    // Ledger operations

    /// Get ledger row by idempotency key
    pub fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_IDEMPOTENCY)?;
        match self.db.get_cf(cf, idempotency_key.as_bytes())? {
            Some(seq) => self.get_entry(decode_sequence(&seq)?),
            None => Ok(None),
        }
    }

    /// Get ledger row by sequence
    pub fn get_entry(&self, sequence: u64) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_LEDGER)?;
        self.db
            .get_cf(cf, sequence.to_be_bytes())?
            .map(|value| bincode::deserialize(&value).map_err(Error::from))
            .transpose()
    }

    /// Rows with `sequence > after`, ascending, at most `limit`
    pub fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_LEDGER)?;
        let start = after.saturating_add(1).to_be_bytes();
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
            .take(limit)
        {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Rows touching any balance of `party`'s owner with `sequence > after`
    pub fn party_entries_after(
        &self,
        party: &Party,
        after: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_PARTY_INDEX)?;
        let prefix = Self::index_key_party(&party.owner_key(), None);
        let start = Self::index_key_party(&party.owner_key(), Some(after.saturating_add(1)));

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || entries.len() >= limit {
                break;
            }
            let sequence = decode_sequence(&key[prefix.len()..])?;
            let entry = self
                .get_entry(sequence)?
                .ok_or_else(|| Error::Storage(format!("dangling party index for sequence {}", sequence)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Commit a transfer atomically
    ///
    /// `accounts` are the user-side accounts with their new balances already
    /// applied (validated by the caller under their locks). `bank_delta` is
    /// the signed change to the bank balance. The bank is read and written
    /// here, inside the commit section, together with the sequence.
    ///
    /// If `request.idempotency_key` is already committed nothing is written
    /// and the stored row is returned.
    pub fn commit_transfer(
        &self,
        request: &TransferRequest,
        accounts: &[Account],
        bank_delta: Amount,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let mut next_sequence = self.commit.lock();

        if let Some(existing) = self.get_entry_by_key(&request.idempotency_key)? {
            return Ok(CommitOutcome::Replayed(existing));
        }

        let mut bank = self.get_bank()?;
        let touches_bank = request.source == Party::Bank || request.destination == Party::Bank;
        if touches_bank {
            bank.balance = bank.balance.checked_add(bank_delta)?;
            bank.updated_at = now;
        }

        let balance_of = |party: &Party| -> Result<Amount> {
            match party {
                Party::Bank => Ok(bank.balance),
                other => accounts
                    .iter()
                    .find_map(|account| account.balance_for(other))
                    .ok_or_else(|| Error::UnknownParty(other.to_string())),
            }
        };

        let entry = LedgerEntry {
            id: Uuid::now_v7(),
            sequence: *next_sequence,
            idempotency_key: request.idempotency_key.clone(),
            domain: request.domain,
            operation_type: request.operation_type,
            source_party: request.source,
            destination_party: request.destination,
            amount: request.amount,
            resulting_balances: ResultingBalances {
                source: balance_of(&request.source)?,
                destination: balance_of(&request.destination)?,
            },
            processed_with_deficit: request.source == Party::Bank && bank.in_deficit(),
            tx_hash: request.tx_hash.clone(),
            created_at: now,
        };

        let mut batch = WriteBatch::default();

        // 1. Balances
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        for account in accounts {
            batch.put_cf(cf_accounts, account.id.to_key(), bincode::serialize(account)?);
        }
        if touches_bank {
            let cf_bank = self.cf_handle(CF_BANK)?;
            batch.put_cf(cf_bank, BANK_KEY, bincode::serialize(&bank)?);
        }

        // 2. Ledger row
        let cf_ledger = self.cf_handle(CF_LEDGER)?;
        let seq_key = entry.sequence.to_be_bytes();
        batch.put_cf(cf_ledger, seq_key, bincode::serialize(&entry)?);

        // 3. Indices
        let cf_idempotency = self.cf_handle(CF_IDEMPOTENCY)?;
        batch.put_cf(cf_idempotency, entry.idempotency_key.as_bytes(), seq_key);

        let cf_party = self.cf_handle(CF_PARTY_INDEX)?;
        let source_owner = entry.source_party.owner_key();
        let destination_owner = entry.destination_party.owner_key();
        batch.put_cf(cf_party, Self::index_key_party(&source_owner, Some(entry.sequence)), b"");
        if destination_owner != source_owner {
            batch.put_cf(
                cf_party,
                Self::index_key_party(&destination_owner, Some(entry.sequence)),
                b"",
            );
        }

        // Atomic commit
        self.db.write(batch)?;
        *next_sequence += 1;

        tracing::debug!(
            sequence = entry.sequence,
            idempotency_key = %entry.idempotency_key,
            source = %entry.source_party,
            destination = %entry.destination_party,
            amount = %entry.amount,
            "Ledger entry committed"
        );

        Ok(CommitOutcome::Committed(entry))
    }

    // Idempotency guard records

    /// Get guard record by request key
    pub fn get_request(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let cf = self.cf_handle(CF_REQUESTS)?;
        self.db
            .get_cf(cf, key.as_bytes())?
            .map(|value| bincode::deserialize(&value).map_err(Error::from))
            .transpose()
    }

    /// Put guard record
    pub fn put_request(&self, record: &IdempotencyRecord) -> Result<()> {
        let cf = self.cf_handle(CF_REQUESTS)?;
        self.db
            .put_cf(cf, record.key.as_bytes(), bincode::serialize(record)?)?;
        Ok(())
    }

    // Inbound operations

    /// Get inbound event by tx_hash
    pub fn get_inbound(&self, tx_hash: &str) -> Result<Option<InboundEvent>> {
        let cf = self.cf_handle(CF_INBOUND)?;
        self.db
            .get_cf(cf, tx_hash.as_bytes())?
            .map(|value| bincode::deserialize(&value).map_err(Error::from))
            .transpose()
    }

    /// Put inbound event and maintain the pending index (atomic)
    pub fn put_inbound(&self, event: &InboundEvent) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_inbound = self.cf_handle(CF_INBOUND)?;
        batch.put_cf(cf_inbound, event.tx_hash.as_bytes(), bincode::serialize(event)?);

        let cf_pending = self.cf_handle(CF_INBOUND_PENDING)?;
        if event.is_terminal() {
            batch.delete_cf(cf_pending, event.tx_hash.as_bytes());
        } else {
            batch.put_cf(cf_pending, event.tx_hash.as_bytes(), b"");
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Due inbound events in tx_hash order, starting after `after`, at most `limit`
    pub fn due_inbound(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InboundEvent>> {
        let cf = self.cf_handle(CF_INBOUND_PENDING)?;
        let mode = match after {
            Some(tx_hash) => IteratorMode::From(tx_hash.as_bytes(), Direction::Forward),
            None => IteratorMode::Start,
        };

        let events = self
            .db
            .iterator_cf(cf, mode)
            .filter(|item| match (item, after) {
                (Ok((key, _)), Some(after)) => key[..] != *after.as_bytes(),
                _ => true,
            })
            .filter_map(|item| match item {
                Ok((key, _)) => self.get_inbound(&String::from_utf8_lossy(&key)).transpose(),
                Err(err) => Some(Err(err.into())),
            });
        crate::work::select_due(events, now, limit)
    }

    // Index key helpers

    fn index_key_party(owner: &str, sequence: Option<u64>) -> Vec<u8> {
        let mut key = owner.as_bytes().to_vec();
        key.push(b'|'); // Separator
        if let Some(seq) = sequence {
            key.extend_from_slice(&seq.to_be_bytes());
        }
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let next_sequence = *self.commit.lock();
        let accounts = self.approximate_count(self.cf_handle(CF_ACCOUNTS)?)?;
        let pending_inbound = self.approximate_count(self.cf_handle(CF_INBOUND_PENDING)?)?;

        Ok(StorageStats {
            ledger_entries: next_sequence - 1,
            accounts,
            pending_inbound,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Committed ledger rows (exact)
    pub ledger_entries: u64,
    /// Accounts (estimate)
    pub accounts: u64,
    /// Non-terminal inbound events (estimate)
    pub pending_inbound: u64,
}

fn decode_sequence(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("corrupt sequence key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

//! Advisory exclusive sections keyed by entity
//!
//! Two primitives:
//!
//! - [`LockManager::acquire`] waits for exclusive sections over a set of keys.
//!   Keys are sorted and deduplicated before acquisition so two callers that
//!   need overlapping sets can never deadlock.
//! - [`LockManager::try_claim`] and [`LockManager::claim_batch`] never wait:
//!   they claim whichever keys are free and skip the rest. Sweeps claim items
//!   this way so an overrunning sweep and the next tick never process the
//!   same item twice.
//!
//! Locks are in-process. The store is a single-process RocksDB instance, so
//! this is the only writer that can exist.

use crate::types::AccountId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Entity an exclusive section is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// One account (all of its balances)
    Account(AccountId),
    /// One ledger idempotency key
    Ledger(String),
    /// One client request key in the idempotency guard
    Request(String),
    /// One inbound event
    Inbound(String),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Account(id) => write!(f, "account:{}", id),
            LockKey::Ledger(key) => write!(f, "ledger:{}", key),
            LockKey::Request(key) => write!(f, "request:{}", key),
            LockKey::Inbound(tx_hash) => write!(f, "inbound:{}", tx_hash),
        }
    }
}

/// Held exclusive sections; released on drop
#[derive(Debug)]
pub struct LockGuard {
    keys: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockGuard {
    /// Keys held, in acquisition order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// A claimed work key; the claim is released on drop
#[derive(Debug)]
pub struct ClaimGuard {
    key: String,
    claims: Arc<DashMap<String, ()>>,
}

impl ClaimGuard {
    /// Claimed key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

/// Keyed async mutexes plus the claim set
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
    claims: Arc<DashMap<String, ()>>,
}

impl LockManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive sections over every key
    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> LockGuard {
        let mut names: Vec<String> = keys.into_iter().map(|k| k.to_string()).collect();
        names.sort();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            let mutex = self
                .locks
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }

        LockGuard {
            keys: names,
            _guards: guards,
        }
    }

    /// Drop mutexes nobody holds or waits on
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    /// Number of tracked mutexes
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }

    /// Claim one key unless someone else already holds it
    pub fn try_claim(&self, key: &str) -> Option<ClaimGuard> {
        match self.claims.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(ClaimGuard {
                    key: key.to_string(),
                    claims: Arc::clone(&self.claims),
                })
            }
        }
    }

    /// Claim every free key, skipping those already claimed
    pub fn claim_batch<I, S>(&self, keys: I) -> Vec<ClaimGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter()
            .filter_map(|key| self.try_claim(key.as_ref()))
            .collect()
    }

    /// Key is currently claimed
    pub fn is_claimed(&self, key: &str) -> bool {
        self.claims.contains_key(key)
    }
}

//! Read side: cursor pagination and ETags
//!
//! Ledger rows are paged by commit sequence. A cursor is an opaque URL-safe
//! base64 token of the last sequence a page returned; there are no offsets,
//! so concurrent commits never shift a page.
//!
//! Every read carries an ETag (SHA-256 hex of the body's canonical JSON). A
//! conditional read whose `If-None-Match` matches gets [`Conditional::NotModified`].

use crate::{
    storage::Storage,
    types::{Account, AccountId, BankAccount, InboundEvent, LedgerEntry, Party},
    Error, Result,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Page size when the caller does not ask for one
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page served
pub const MAX_PAGE_SIZE: usize = 200;

const CURSOR_PREFIX: &str = "seq:";

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items in commit order
    pub items: Vec<T>,
    /// Token for the next page
    pub next_cursor: Option<String>,
    /// More items exist after this page
    pub has_more: bool,
}

/// Ledger page query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Cursor from a previous page
    pub cursor: Option<String>,
    /// Requested page size (clamped to `1..=MAX_PAGE_SIZE`)
    pub limit: Option<usize>,
    /// Only rows touching this party's owner
    pub party: Option<Party>,
}

/// Result of a conditional read
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional<T> {
    /// `If-None-Match` matched
    NotModified {
        /// Current ETag
        etag: String,
    },
    /// Fresh body
    Modified {
        /// Current ETag
        etag: String,
        /// Body
        body: T,
    },
}

impl<T> Conditional<T> {
    /// ETag either way
    pub fn etag(&self) -> &str {
        match self {
            Conditional::NotModified { etag } | Conditional::Modified { etag, .. } => etag,
        }
    }
}

/// Encode a sequence as an opaque cursor
pub fn encode_cursor(sequence: u64) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}{}", CURSOR_PREFIX, sequence))
}

/// Decode a cursor back into the last sequence seen
pub fn decode_cursor(cursor: &str) -> Result<u64> {
    let invalid = || Error::Validation(format!("invalid cursor '{}'", cursor));
    let raw = URL_SAFE_NO_PAD.decode(cursor.trim()).map_err(|_| invalid())?;
    let text = String::from_utf8(raw).map_err(|_| invalid())?;
    text.strip_prefix(CURSOR_PREFIX)
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(invalid)
}

/// SHA-256 hex of a value's canonical JSON
pub fn etag<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn matches_etag(if_none_match: Option<&str>, etag: &str) -> bool {
    let Some(header) = if_none_match else {
        return false;
    };
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*"
            || candidate
                .trim_start_matches("W/")
                .trim_matches('"')
                == etag
    })
}

/// Wrap a body with its ETag, honouring `If-None-Match`
pub fn conditional<T: Serialize>(body: T, if_none_match: Option<&str>) -> Result<Conditional<T>> {
    let etag = etag(&body)?;
    if matches_etag(if_none_match, &etag) {
        Ok(Conditional::NotModified { etag })
    } else {
        Ok(Conditional::Modified { etag, body })
    }
}

/// Read-only views over the store
#[derive(Debug, Clone)]
pub struct ReadModel {
    storage: Arc<Storage>,
}

impl ReadModel {
    /// Create a read model over the store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// One page of ledger rows
    pub fn ledger_page(&self, request: &PageRequest) -> Result<Page<LedgerEntry>> {
        let after = request.cursor.as_deref().map(decode_cursor).transpose()?.unwrap_or(0);
        let limit = request
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let mut items = match &request.party {
            Some(party) => self.storage.party_entries_after(party, after, limit + 1)?,
            None => self.storage.entries_after(after, limit + 1)?,
        };

        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|entry| encode_cursor(entry.sequence))
        } else {
            None
        };

        Ok(Page {
            items,
            next_cursor,
            has_more,
        })
    }

    /// Conditional ledger page
    pub fn ledger_page_if_none_match(
        &self,
        request: &PageRequest,
        if_none_match: Option<&str>,
    ) -> Result<Conditional<Page<LedgerEntry>>> {
        conditional(self.ledger_page(request)?, if_none_match)
    }

    /// Conditional account read
    pub fn account(&self, id: AccountId, if_none_match: Option<&str>) -> Result<Conditional<Account>> {
        let account = self
            .storage
            .get_account(id)?
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;
        conditional(account, if_none_match)
    }

    /// Conditional bank read
    pub fn bank(&self, if_none_match: Option<&str>) -> Result<Conditional<BankAccount>> {
        conditional(self.storage.get_bank()?, if_none_match)
    }

    /// Conditional inbound event read
    pub fn inbound_event(&self, tx_hash: &str, if_none_match: Option<&str>) -> Result<Conditional<InboundEvent>> {
        let event = self
            .storage
            .get_inbound(tx_hash)?
            .ok_or_else(|| Error::NotFound(format!("inbound event {}", tx_hash)))?;
        conditional(event, if_none_match)
    }
}

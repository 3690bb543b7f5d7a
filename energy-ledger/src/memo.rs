//! Deposit memo decoding
//!
//! Three memo shapes are recognized on inbound transfers:
//!
//! | memo                              | meaning                                    |
//! |-----------------------------------|--------------------------------------------|
//! | `EFHC<identity>`                  | credit the transferred amount              |
//! | `SKU:EFHC\|Q:<qty>\|TG:<identity>` | packaged purchase of `qty` tokens          |
//! | `SKU:NFT_VIP\|Q:1\|TG:<identity>`  | VIP entitlement purchase                   |
//!
//! Anything else is a validation failure and is never retried.

use crate::amount::Amount;
use crate::types::{AccountId, Domain};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

const DIRECT_PREFIX: &str = "EFHC";
const PACKAGE_SKU: &str = "SKU:EFHC";
const VIP_SKU: &str = "SKU:NFT_VIP";

/// Decoded memo intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoKind {
    /// Credit the observed amount
    Direct,
    /// Credit a fixed token quantity
    Package {
        /// Tokens purchased
        quantity: Amount,
    },
    /// VIP entitlement purchase
    Vip,
}

/// A decoded memo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMemo {
    /// Intent
    pub kind: MemoKind,
    /// Identity the deposit belongs to
    pub identity: AccountId,
}

impl ParsedMemo {
    /// Ledger domain for the resulting credit
    pub fn domain(&self) -> Domain {
        match self.kind {
            MemoKind::Direct => Domain::Deposit,
            MemoKind::Package { .. } => Domain::Shop,
            MemoKind::Vip => Domain::VipPurchase,
        }
    }

    /// Amount to credit given the amount observed on chain
    pub fn credit_amount(&self, observed: Amount) -> Amount {
        match self.kind {
            MemoKind::Package { quantity } => quantity,
            MemoKind::Direct | MemoKind::Vip => observed,
        }
    }
}

/// Decode a memo
pub fn parse_memo(memo: &str) -> Result<ParsedMemo> {
    let memo = memo.trim();

    if memo.starts_with("SKU:") {
        return parse_sku(memo);
    }

    if let Some(identity) = memo.strip_prefix(DIRECT_PREFIX) {
        return Ok(ParsedMemo {
            kind: MemoKind::Direct,
            identity: parse_identity(memo, identity)?,
        });
    }

    Err(unknown(memo))
}

fn parse_sku(memo: &str) -> Result<ParsedMemo> {
    let mut fields = memo.split('|');
    let sku = fields.next().unwrap_or_default();
    let quantity = fields
        .next()
        .and_then(|f| f.strip_prefix("Q:"))
        .ok_or_else(|| unknown(memo))?;
    let identity = fields
        .next()
        .and_then(|f| f.strip_prefix("TG:"))
        .ok_or_else(|| unknown(memo))?;
    if fields.next().is_some() {
        return Err(unknown(memo));
    }

    let identity = parse_identity(memo, identity)?;
    let quantity = parse_digits(memo, quantity)?;

    match sku {
        PACKAGE_SKU if quantity > 0 => {
            let quantity = i64::try_from(quantity).map_err(|_| unknown(memo))?;
            Ok(ParsedMemo {
                kind: MemoKind::Package {
                    quantity: Amount::from_units(quantity),
                },
                identity,
            })
        }
        VIP_SKU if quantity == 1 => Ok(ParsedMemo { kind: MemoKind::Vip, identity }),
        _ => Err(unknown(memo)),
    }
}

fn parse_identity(memo: &str, digits: &str) -> Result<AccountId> {
    parse_digits(memo, digits).map(AccountId::new)
}

fn parse_digits(memo: &str, digits: &str) -> Result<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(unknown(memo));
    }
    digits.parse::<u64>().map_err(|_| unknown(memo))
}

fn unknown(memo: &str) -> Error {
    Error::Validation(format!("unrecognized memo format: '{}'", memo))
}

//! Fixed-point amounts for tokens and energy
//!
//! Every monetary or energy value in the ledger is an [`Amount`]: an exact
//! decimal with 8 fractional digits. Normalization always truncates toward
//! zero, so a computed value never gains precision it did not have.
//!
//! ```
//! use energy_ledger::Amount;
//!
//! let amount: Amount = "1.123456789".parse().unwrap();
//! assert_eq!(amount.to_string(), "1.12345678");
//! ```

use crate::{Error, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits carried by every amount
pub const SCALE: u32 = 8;

/// Exact decimal with 8 fractional digits, truncating normalization
///
/// Deserialized values go through [`Amount::new`] like every other
/// constructor, so extra digits from a request body are truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    /// Zero
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Normalize a decimal to 8 fractional digits, truncating toward zero
    pub fn new(value: Decimal) -> Self {
        let mut truncated = value.round_dp_with_strategy(SCALE, RoundingStrategy::ToZero);
        truncated.rescale(SCALE);
        Self(truncated)
    }

    /// Build from a whole number of units
    pub fn from_units(units: i64) -> Self {
        Self::new(Decimal::from(units))
    }

    /// Build from a mantissa and scale (`from_scaled(150, 2)` is `1.50`)
    pub fn from_scaled(mantissa: i64, scale: u32) -> Self {
        Self::new(Decimal::new(mantissa, scale))
    }

    /// Underlying decimal
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Lossy float view, for metrics only
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or_default()
    }

    /// Strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Strictly less than zero
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// Zero check
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Checked addition
    pub fn checked_add(self, rhs: Amount) -> Result<Amount> {
        self.0
            .checked_add(rhs.0)
            .map(Amount::new)
            .ok_or_else(|| Error::InvalidAmount(format!("overflow adding {} and {}", self, rhs)))
    }

    /// Checked subtraction
    pub fn checked_sub(self, rhs: Amount) -> Result<Amount> {
        self.0
            .checked_sub(rhs.0)
            .map(Amount::new)
            .ok_or_else(|| Error::InvalidAmount(format!("overflow subtracting {} from {}", rhs, self)))
    }

    /// Checked multiplication by a raw decimal factor (rates, counts)
    ///
    /// The product is truncated back to 8 digits.
    pub fn checked_mul(self, factor: Decimal) -> Result<Amount> {
        self.0
            .checked_mul(factor)
            .map(Amount::new)
            .ok_or_else(|| Error::InvalidAmount(format!("overflow multiplying {} by {}", self, factor)))
    }

    /// Negated copy
    pub fn negate(self) -> Amount {
        Amount(-self.0)
    }

    /// Require a strictly positive amount (transfer and conversion inputs)
    pub fn ensure_positive(self) -> Result<Amount> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(Error::InvalidAmount(format!("amount must be positive, got {}", self)))
        }
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount::new(value)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        <Decimal as Deserialize>::deserialize(deserializer).map(Amount::new)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Decimal::from_str(trimmed)
            .map(Amount::new)
            .map_err(|e| Error::InvalidAmount(format!("malformed amount '{}': {}", trimmed, e)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.0)
    }
}

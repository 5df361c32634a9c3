//! # Money Module
//!
//! Provides the `Money` type for handling monetary values safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  TWO NATIVE ENCODINGS, ONE CANONICAL VALUE                              │
//! │                                                                         │
//! │  Storefront:  "price": "19.99"        decimal string                    │
//! │  Warehouse:   "salePrice": 1999       integer minor units (kopecks)     │
//! │                                                                         │
//! │  Canonical:   Money(1999)                                               │
//! │                                                                         │
//! │  A float in between would turn 19.99 into 1998.9999… and flip the       │
//! │  content hash on every round trip. Integers never drift.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use stockbridge_core::money::Money;
//!
//! let price = Money::parse_decimal("19.99").unwrap();
//! assert_eq!(price.cents(), 1999);
//! assert_eq!(price.to_decimal_string(), "19.99");
//!
//! // Not losslessly representable in minor units
//! assert!(Money::parse_decimal("19.999").is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// Number of fractional digits carried by the minor unit.
const MINOR_DIGITS: usize = 2;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit (cents, kopecks).
///
/// Currency lives in a separate canonical field; this type only carries the
/// amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from minor units.
    ///
    /// ## Example
    /// ```rust
    /// use stockbridge_core::money::Money;
    ///
    /// let price = Money::from_cents(1099);
    /// assert_eq!(price.cents(), 1099);
    /// ```
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Returns the value in minor units.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Parses a decimal string such as `"19.99"`, `"-5.5"` or `"7"`.
    ///
    /// ## Rules
    /// - Optional leading `-`
    /// - At least one integer digit
    /// - At most two fractional digits (anything finer would be rounded,
    ///   which the mapper treats as lossy)
    pub fn parse_decimal(input: &str) -> Result<Money, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidFormat {
            field: "money".to_string(),
            reason: format!("{input:?}: {reason}"),
        };

        let trimmed = input.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let (major, minor) = match digits.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (digits, ""),
        };

        if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected digits before the decimal point"));
        }
        if !minor.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected digits after the decimal point"));
        }
        if minor.len() > MINOR_DIGITS {
            return Err(invalid("more than two fractional digits"));
        }

        let major: i64 = major
            .parse()
            .map_err(|_| invalid("amount out of range"))?;
        let minor: i64 = if minor.is_empty() {
            0
        } else {
            // "5" means 50 minor units, "05" means 5
            format!("{minor:0<width$}", width = MINOR_DIGITS)
                .parse()
                .map_err(|_| invalid("amount out of range"))?
        };

        let cents = major
            .checked_mul(100)
            .and_then(|m| m.checked_add(minor))
            .ok_or_else(|| invalid("amount out of range"))?;

        Ok(Money(if negative { -cents } else { cents }))
    }

    /// Formats as a decimal string with exactly two fractional digits.
    ///
    /// ## Example
    /// ```rust
    /// use stockbridge_core::money::Money;
    ///
    /// assert_eq!(Money::from_cents(5).to_decimal_string(), "0.05");
    /// assert_eq!(Money::from_cents(-550).to_decimal_string(), "-5.50");
    /// ```
    pub fn to_decimal_string(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(Money::parse_decimal("19.99").unwrap().cents(), 1999);
        assert_eq!(Money::parse_decimal("21.5").unwrap().cents(), 2150);
        assert_eq!(Money::parse_decimal("7").unwrap().cents(), 700);
        assert_eq!(Money::parse_decimal("0.05").unwrap().cents(), 5);
        assert_eq!(Money::parse_decimal("-5.50").unwrap().cents(), -550);
        assert_eq!(Money::parse_decimal(" 3.10 ").unwrap().cents(), 310);
    }

    #[test]
    fn test_parse_decimal_rejects_lossy_or_malformed() {
        assert!(Money::parse_decimal("19.999").is_err());
        assert!(Money::parse_decimal("").is_err());
        assert!(Money::parse_decimal(".50").is_err());
        assert!(Money::parse_decimal("1e3").is_err());
        assert!(Money::parse_decimal("12,50").is_err());
        assert!(Money::parse_decimal("99999999999999999999").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(1099).to_string(), "10.99");
        assert_eq!(Money::from_cents(-550).to_string(), "-5.50");
        assert_eq!(Money::zero().to_string(), "0.00");
    }

    #[test]
    fn test_decimal_round_trip() {
        for cents in [0, 1, 99, 100, 1999, -1, -550, 123_456_789] {
            let money = Money::from_cents(cents);
            assert_eq!(Money::parse_decimal(&money.to_decimal_string()).unwrap(), money);
        }
    }
}

//! Fixed-point currency amounts.
//!
//! Every quantity on the ledger is expressed in minor units (1/100 of the
//! currency). Decimal major-unit values are converted once, at the edge,
//! with [`Amount::from_major`].

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of minor units per major unit
pub const MINOR_UNITS_PER_MAJOR: u64 = 100;

/// Errors raised by amount arithmetic and parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Currency mismatch: {0} vs {1}")]
    CurrencyMismatch(Currency, Currency),

    #[error("Amount overflow")]
    Overflow,

    #[error("Amount underflow")]
    Underflow,

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Three letter upper-case currency code
///
/// Serialized as its code string, e.g. `"MAD"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Currency([u8; 3]);

impl Currency {
    /// Moroccan dirham, the default settlement currency
    pub const MAD: Currency = Currency(*b"MAD");

    pub fn new(code: &str) -> Result<Self, AmountError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(AmountError::InvalidCurrency(code.to_string()));
        }
        Ok(Currency([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII upper-case letters are ever stored
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl Default for Currency {
    fn default() -> Self {
        Currency::MAD
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Currency::new(&code).map_err(serde::de::Error::custom)
    }
}

impl FromStr for Currency {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s)
    }
}

/// A quantity of minor units in one currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    pub quantity: u64,
    pub currency: Currency,
}

impl Amount {
    pub fn new(quantity: u64, currency: Currency) -> Self {
        Self { quantity, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(0, currency)
    }

    pub fn is_zero(&self) -> bool {
        self.quantity == 0
    }

    /// Convert a decimal major-unit value (e.g. `1234.50`) into minor units
    ///
    /// Negative values, zero and values with more than two decimal places
    /// are rejected.
    pub fn from_major(value: Decimal, currency: Currency) -> Result<Self, AmountError> {
        let normalized = value.normalize();
        if normalized.is_sign_negative() || normalized.is_zero() {
            return Err(AmountError::InvalidAmount(format!(
                "amount must be positive, got {}",
                value
            )));
        }
        if normalized.scale() > 2 {
            return Err(AmountError::InvalidAmount(format!(
                "at most two decimal places are allowed, got {}",
                value
            )));
        }
        let minor = normalized
            .checked_mul(Decimal::from(MINOR_UNITS_PER_MAJOR))
            .and_then(|d| d.to_u64())
            .ok_or(AmountError::Overflow)?;
        Ok(Self::new(minor, currency))
    }

    /// Parse a decimal major-unit string
    pub fn parse_major(value: &str, currency: Currency) -> Result<Self, AmountError> {
        let decimal = Decimal::from_str(value.trim())
            .map_err(|e| AmountError::InvalidAmount(format!("{}: {}", value, e)))?;
        Self::from_major(decimal, currency)
    }

    /// The amount as a decimal major-unit value
    pub fn to_major(&self) -> Decimal {
        Decimal::from(self.quantity) / Decimal::from(MINOR_UNITS_PER_MAJOR)
    }

    fn ensure_same_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(self.currency, other.currency));
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.ensure_same_currency(other)?;
        let quantity = self
            .quantity
            .checked_add(other.quantity)
            .ok_or(AmountError::Overflow)?;
        Ok(Amount::new(quantity, self.currency))
    }

    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.ensure_same_currency(other)?;
        let quantity = self
            .quantity
            .checked_sub(other.quantity)
            .ok_or(AmountError::Underflow)?;
        Ok(Amount::new(quantity, self.currency))
    }

    /// Sum amounts that must all be in `currency`
    pub fn sum<'a, I>(amounts: I, currency: Currency) -> Result<Amount, AmountError>
    where
        I: IntoIterator<Item = &'a Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::zero(currency), |acc, a| acc.checked_add(a))
    }

    /// Split into `parts` amounts that differ by at most one minor unit
    ///
    /// The first `quantity % parts` entries carry the extra unit.
    pub fn split_evenly(&self, parts: u64) -> Vec<Amount> {
        if parts == 0 {
            return Vec::new();
        }
        let base = self.quantity / parts;
        let remainder = self.quantity % parts;
        (0..parts)
            .map(|i| Amount::new(base + u64::from(i < remainder), self.currency))
            .collect()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.quantity / MINOR_UNITS_PER_MAJOR,
            self.quantity % MINOR_UNITS_PER_MAJOR,
            self.currency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_validation() {
        assert!(Currency::new("MAD").is_ok());
        assert!(Currency::new("EUR").is_ok());
        assert!(Currency::new("mad").is_err());
        assert!(Currency::new("DIRHAM").is_err());
        assert_eq!(Currency::new("MAD").unwrap(), Currency::MAD);
        assert_eq!(Currency::MAD.to_string(), "MAD");
    }

    #[test]
    fn test_from_major_converts_to_minor_units() {
        let amount = Amount::parse_major("1234.50", Currency::MAD).unwrap();
        assert_eq!(amount.quantity, 123_450);

        // Trailing zeros beyond two places are fine
        let amount = Amount::parse_major("12.500", Currency::MAD).unwrap();
        assert_eq!(amount.quantity, 1_250);

        let amount = Amount::parse_major("7", Currency::MAD).unwrap();
        assert_eq!(amount.quantity, 700);
    }

    #[test]
    fn test_from_major_rejects_bad_values() {
        assert!(matches!(
            Amount::parse_major("0", Currency::MAD),
            Err(AmountError::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::parse_major("-5.00", Currency::MAD),
            Err(AmountError::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::parse_major("1.005", Currency::MAD),
            Err(AmountError::InvalidAmount(_))
        ));
        assert!(Amount::parse_major("abc", Currency::MAD).is_err());
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = Amount::new(700, Currency::MAD);
        let b = Amount::new(500, Currency::MAD);

        assert_eq!(a.checked_add(&b).unwrap().quantity, 1200);
        assert_eq!(a.checked_sub(&b).unwrap().quantity, 200);
        assert_eq!(b.checked_sub(&a), Err(AmountError::Underflow));

        let eur = Amount::new(1, Currency::new("EUR").unwrap());
        assert!(matches!(
            a.checked_add(&eur),
            Err(AmountError::CurrencyMismatch(_, _))
        ));

        let max = Amount::new(u64::MAX, Currency::MAD);
        assert_eq!(max.checked_add(&a), Err(AmountError::Overflow));
    }

    #[test]
    fn test_sum_and_split() {
        let amounts = vec![
            Amount::new(700, Currency::MAD),
            Amount::new(500, Currency::MAD),
        ];
        assert_eq!(Amount::sum(&amounts, Currency::MAD).unwrap().quantity, 1200);

        let parts = Amount::new(2500, Currency::MAD).split_evenly(3);
        let quantities: Vec<u64> = parts.iter().map(|a| a.quantity).collect();
        assert_eq!(quantities, vec![834, 833, 833]);
        assert_eq!(Amount::sum(&parts, Currency::MAD).unwrap().quantity, 2500);
    }

    #[test]
    fn test_display() {
        assert_eq!(Amount::new(123_405, Currency::MAD).to_string(), "1234.05 MAD");
        assert_eq!(Amount::new(7, Currency::MAD).to_string(), "0.07 MAD");
    }
}

//! Non-negative currency amounts with cent precision.
//!
//! Amounts are kept as an integer number of cents so that sums are exact. The textual form always has two decimals
//! and is what goes over the wire; input with more significant fractional digits is rejected rather than rounded.

use std::fmt;
use std::fmt::Display;
use std::iter::Sum;
use std::str::FromStr;

use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount is required")]
    Empty,
    #[error("amount cannot be negative: '{0}'")]
    Negative(String),
    #[error("not a valid amount: '{0}'")]
    Malformed(String),
    #[error("amount has more than two decimals: '{0}'")]
    TooPrecise(String),
    #[error("amount is too large: '{0}'")]
    Overflow(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn cents(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(AmountError::Empty);
        }

        let unsigned = if let Some(rest) = text.strip_prefix('-') {
            // "-0" and "-0.00" are still zero.
            if rest.chars().all(|c| c == '0' || c == '.') && rest.chars().any(|c| c == '0') {
                rest
            }
            else {
                return Err(AmountError::Negative(s.to_string()));
            }
        }
        else {
            text.strip_prefix('+').unwrap_or(text)
        };

        let (whole, fraction) = match unsigned.split_once('.') {
            Some((w, f)) => (w, f),
            None => (unsigned, ""),
        };

        if (whole.is_empty() && fraction.is_empty())
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AmountError::Malformed(s.to_string()));
        }

        let significant = fraction.trim_end_matches('0');
        if significant.len() > 2 {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let overflow = || AmountError::Overflow(s.to_string());
        let whole: u64 = if whole.is_empty() {
            0
        }
        else {
            whole.parse().map_err(|_| overflow())?
        };
        let cents: u64 = match significant.len() {
            0 => 0,
            1 => significant.parse::<u64>().map_err(|_| overflow())? * 10,
            _ => significant.parse().map_err(|_| overflow())?,
        };

        whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(cents))
            .map(Amount)
            .ok_or_else(overflow)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Amount::saturating_add)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct AmountVisitor;

impl de::Visitor<'_> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a non-negative decimal amount with at most two decimals")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        v.checked_mul(100)
            .map(Amount)
            .ok_or_else(|| E::custom(AmountError::Overflow(v.to_string())))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        if v < 0 {
            return Err(E::custom(AmountError::Negative(v.to_string())));
        }
        self.visit_u64(v.unsigned_abs())
    }

    // Backends returning numeric columns as JSON numbers: go through the shortest textual form of the float so that
    // 12.3 stays 12.30 instead of becoming 12.29999...
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        self.visit_str(&v.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }
}

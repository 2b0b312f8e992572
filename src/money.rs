// 1.1 money.rs: fixed-point amounts. 5 implied decimals, integer math only.
// rust_decimal is only used at the edges (parsing user input, display).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Number of implied decimal digits.
pub const AMOUNT_DECIMALS: u32 = 5;

/// 1.0 unit = 100_000 raw.
pub const AMOUNT_SCALE: i64 = 100_000;

/// Signed fixed-point amount. Balances hold non-negative values, ledger postings
/// carry signed deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Whole units, e.g. `from_units(10)` is 10.00000.
    pub fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(AMOUNT_SCALE))
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn negate(&self) -> Self {
        Self(-self.0)
    }

    pub fn checked_add(&self, other: Amount) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Amount) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Subtracts but never goes below zero.
    pub fn saturating_sub_floor(&self, other: Amount) -> Self {
        Self(self.0.saturating_sub(other.0).max(0))
    }

    /// `self × numerator / denominator`, truncating toward zero.
    /// i128 intermediate.
    pub fn mul_div(&self, numerator: i64, denominator: i64) -> Option<Self> {
        if denominator == 0 {
            return None;
        }
        let value = (self.0 as i128) * (numerator as i128) / (denominator as i128);
        i64::try_from(value).ok().map(Self)
    }

    /// `self × rate / 100`, truncating. Used for level rates and percent fees.
    pub fn percent(&self, rate: u32) -> Self {
        self.mul_div(rate as i64, 100).unwrap_or(Self(i64::MAX))
    }

    /// `self × rate / 1000`, truncating.
    pub fn permille(&self, rate: u32) -> Self {
        self.mul_div(rate as i64, 1000).unwrap_or(Self(i64::MAX))
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, AMOUNT_DECIMALS)
    }

    /// Converts a decimal amount. Digits beyond the 5th decimal are truncated.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        let scaled = value.checked_mul(Decimal::from(AMOUNT_SCALE))?.trunc();
        scaled.to_i64().map(Self)
    }

    /// Parses user input such as `"12.5"`.
    pub fn parse(input: &str) -> Option<Self> {
        let value = Decimal::from_str(input.trim()).ok()?;
        Self::from_decimal(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, a| acc.saturating_add(a))
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, a| acc.saturating_add(*a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn units_and_raw() {
        assert_eq!(Amount::from_units(10).raw(), 1_000_000);
        assert_eq!(Amount::from_raw(150_000).to_decimal(), dec!(1.5));
    }

    #[test]
    fn parse_truncates_extra_precision() {
        assert_eq!(Amount::parse("12.5"), Some(Amount::from_raw(1_250_000)));
        assert_eq!(Amount::parse("0.000019"), Some(Amount::from_raw(1)));
        assert_eq!(Amount::parse("abc"), None);
    }

    #[test]
    fn percent_truncates() {
        // 999 × 10 / 100 = 99.9 → 99
        assert_eq!(Amount::from_raw(999).percent(10), Amount::from_raw(99));
        assert_eq!(Amount::from_raw(1_000_000).percent(5), Amount::from_raw(50_000));
    }

    #[test]
    fn permille_fee() {
        assert_eq!(Amount::from_raw(1_000_000).permille(15), Amount::from_raw(15_000));
    }

    #[test]
    fn mul_div_no_overflow() {
        let big = Amount::from_raw(i64::MAX / 2);
        assert_eq!(big.mul_div(100, 100), Some(big));
        assert_eq!(big.mul_div(1, 0), None);
    }

    #[test]
    fn saturating_floor() {
        let a = Amount::from_raw(5);
        assert_eq!(a.saturating_sub_floor(Amount::from_raw(9)), Amount::ZERO);
    }
}

use crate::error::LoyaltyError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A non-negative monetary value: a user's balance or an order's accrual.
///
/// This is a wrapper around `rust_decimal::Decimal` so loyalty points are never
/// subject to floating point rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(Decimal);

/// A strictly positive amount moved by a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, LoyaltyError> {
        if value >= Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(LoyaltyError::ValidationError(format!(
                "Balance cannot be negative: {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Adds `rhs`, failing instead of overflowing the decimal range.
    pub fn checked_add(self, rhs: Self) -> Result<Self, LoyaltyError> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or_else(|| LoyaltyError::ValidationError(format!("Balance overflow: {self} + {rhs}")))
    }

    /// Sums `balances`, failing on overflow.
    pub fn checked_sum(balances: impl IntoIterator<Item = Self>) -> Result<Self, LoyaltyError> {
        balances
            .into_iter()
            .try_fold(Self::ZERO, Self::checked_add)
    }

    /// Removes `amount`, refusing to go below zero.
    pub fn debit(self, amount: Amount) -> Result<Self, LoyaltyError> {
        if self.0 >= amount.0 {
            Ok(Self(self.0 - amount.0))
        } else {
            Err(LoyaltyError::InsufficientFunds {
                requested: amount.0,
                available: self.0,
            })
        }
    }
}

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, LoyaltyError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(LoyaltyError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LoyaltyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<Decimal> for Balance {
    type Error = LoyaltyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl From<Balance> for Decimal {
    fn from(balance: Balance) -> Self {
        balance.0
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_arithmetic() {
        let b1 = Balance::new(dec!(10.0)).unwrap();
        let b2 = Balance::new(dec!(5.5)).unwrap();
        assert_eq!(b1.checked_add(b2).unwrap().value(), dec!(15.5));

        let total = Balance::checked_sum([b1, b2, Balance::ZERO]).unwrap();
        assert_eq!(total.value(), dec!(15.5));
    }

    #[test]
    fn test_balance_overflow_is_an_error() {
        let max = Balance::new(Decimal::MAX).unwrap();
        let one = Balance::new(dec!(1)).unwrap();
        assert!(matches!(
            max.checked_add(one),
            Err(LoyaltyError::ValidationError(_))
        ));
        assert!(matches!(
            Balance::checked_sum([max, one]),
            Err(LoyaltyError::ValidationError(_))
        ));
        assert_eq!(max.checked_add(Balance::ZERO).unwrap(), max);
    }

    #[test]
    fn test_balance_rejects_negative() {
        assert!(Balance::new(dec!(0)).is_ok());
        assert!(matches!(
            Balance::new(dec!(-0.01)),
            Err(LoyaltyError::ValidationError(_))
        ));
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(LoyaltyError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(LoyaltyError::ValidationError(_))
        ));
    }

    #[test]
    fn test_debit_success() {
        let balance = Balance::new(dec!(729.98)).unwrap();
        let rest = balance.debit(Amount::new(dec!(729.98)).unwrap()).unwrap();
        assert_eq!(rest, Balance::ZERO);
    }

    #[test]
    fn test_debit_insufficient() {
        let balance = Balance::new(dec!(10.0)).unwrap();
        let result = balance.debit(Amount::new(dec!(20.0)).unwrap());
        assert!(matches!(
            result,
            Err(LoyaltyError::InsufficientFunds { requested, available })
                if requested == dec!(20.0) && available == dec!(10.0)
        ));
    }

    #[test]
    fn test_serializes_as_decimal() {
        let balance = Balance::new(dec!(500)).unwrap();
        assert_eq!(serde_json::to_string(&balance).unwrap(), "\"500\"");
        let parsed: Balance = serde_json::from_str("500.5").unwrap();
        assert_eq!(parsed.value(), dec!(500.5));
    }
}

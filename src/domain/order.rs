use super::luhn;
use super::money::Balance;
use super::user::UserId;
use crate::error::LoyaltyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A Luhn-valid order number. Construction is the only validation point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn parse(raw: &str) -> Result<Self, LoyaltyError> {
        if luhn::is_valid(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(LoyaltyError::InvalidNumber(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OrderNumber {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = LoyaltyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderNumber> for String {
    fn from(number: OrderNumber) -> Self {
        number.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }

    /// Transitions only ever move forward; terminal states are final.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (New, Processing) | (New, Invalid) | (New, Processed) | (Processing, Invalid)
                | (Processing, Processed)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        };
        f.write_str(name)
    }
}

/// An uploaded loyalty order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub number: OrderNumber,
    pub status: OrderStatus,
    /// Points granted by the accrual authority, set only once `Processed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Balance>,
    pub user_id: UserId,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    pub fn new(number: OrderNumber, user_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            status: OrderStatus::New,
            accrual: None,
            user_id,
            uploaded_at: Utc::now(),
        }
    }

    /// Moves the order to `status`, returning the balance credit it implies.
    ///
    /// Only `Processed` carries an accrual; other statuses credit nothing.
    /// The order is left untouched when the transition is rejected.
    pub fn settle(&mut self, status: OrderStatus, accrual: Balance) -> Result<Balance, LoyaltyError> {
        if !self.status.can_transition_to(status) {
            return Err(LoyaltyError::InvalidTransition {
                number: self.number.to_string(),
                from: self.status,
                to: status,
            });
        }

        self.status = status;
        if status == OrderStatus::Processed {
            self.accrual = Some(accrual);
            Ok(accrual)
        } else {
            Ok(Balance::ZERO)
        }
    }
}

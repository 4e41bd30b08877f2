use super::money::Amount;
use super::order::OrderNumber;
use super::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A debit of loyalty points against a (not necessarily uploaded) order number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub order_number: OrderNumber,
    pub amount: Amount,
    pub user_id: UserId,
    pub processed_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn new(order_number: OrderNumber, amount: Amount, user_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_number,
            amount,
            user_id,
            processed_at: Utc::now(),
        }
    }
}

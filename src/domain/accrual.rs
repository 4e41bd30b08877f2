use super::order::{OrderNumber, OrderStatus};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

/// Order status as reported by the accrual authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    /// The ledger status this report settles the order into, if any.
    pub fn terminal_status(self) -> Option<OrderStatus> {
        match self {
            Self::Invalid => Some(OrderStatus::Invalid),
            Self::Processed => Some(OrderStatus::Processed),
            Self::Registered | Self::Processing => None,
        }
    }
}

/// Body of a successful authority lookup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualReport {
    pub order: OrderNumber,
    pub status: AccrualStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

/// Every outcome of asking the authority about one order.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorityResponse {
    Resolved(AccrualReport),
    /// The authority has never heard of this order number.
    NotRegistered,
    /// The caller must slow down; `retry_after` is absent when the header was.
    RateLimited { retry_after: Option<Duration> },
    Unrecognized { detail: String },
}

use crate::domain::order::OrderStatus;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoyaltyError {
    #[error("Invalid order number: {0:?}")]
    InvalidNumber(String),
    #[error("Order {0} was already uploaded by another user")]
    Conflict(String),
    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },
    #[error("Order {number} cannot move from {from} to {to}")]
    InvalidTransition {
        number: String,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Unauthenticated")]
    Unauthenticated,
    #[error("Accrual authority unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Unrecognized accrual response: {0}")]
    UnrecognizedResponse(String),
    #[error("Queue error: {0}")]
    Queue(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[cfg(feature = "queue-amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl LoyaltyError {
    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn duplicate(entity: &'static str, key: impl ToString) -> Self {
        Self::Duplicate {
            entity,
            key: key.to_string(),
        }
    }

    /// Whether redelivering the work later could succeed.
    ///
    /// Validation and conflict errors are final; infrastructure failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::UnrecognizedResponse(_)
            | Self::Queue(_)
            | Self::Storage(_)
            | Self::IoError(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            Self::RocksDb(_) => true,
            #[cfg(feature = "queue-amqp")]
            Self::Amqp(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoyaltyError>;

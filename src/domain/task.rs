use super::order::OrderNumber;
use crate::error::{LoyaltyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// "Check this order's accrual status." Carries nothing but the order number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationTask {
    pub order_number: OrderNumber,
}

impl ReconciliationTask {
    pub fn new(order_number: OrderNumber) -> Self {
        Self { order_number }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.order_number.as_str().as_bytes().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let raw = std::str::from_utf8(payload)
            .map_err(|e| LoyaltyError::Queue(format!("Task payload is not UTF-8: {e}")))?;
        Ok(Self::new(OrderNumber::parse(raw.trim())?))
    }
}

impl fmt::Display for ReconciliationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.order_number.fmt(f)
    }
}

/// A task written alongside its order, pending a confirmed publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub order_number: OrderNumber,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(order_number: OrderNumber) -> Self {
        Self {
            order_number,
            enqueued_at: Utc::now(),
        }
    }

    pub fn task(&self) -> ReconciliationTask {
        ReconciliationTask::new(self.order_number.clone())
    }
}

/// Settles a delivery with the queue backend it came from.
#[async_trait]
pub trait Acknowledger: Send {
    /// Removes the message permanently.
    async fn ack(self: Box<Self>) -> Result<()>;
    /// Returns the message to the queue for redelivery.
    async fn requeue(self: Box<Self>) -> Result<()>;
}

/// One in-flight reconciliation task. Must be settled exactly once.
///
/// Both settlement methods consume the delivery, so a task cannot be acked
/// and requeued by the same owner.
pub struct Delivery {
    task: ReconciliationTask,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(task: ReconciliationTask, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            task,
            attempt,
            acker,
        }
    }

    pub fn task(&self) -> &ReconciliationTask {
        &self.task
    }

    /// 1 for the first delivery, incremented on every redelivery the backend reports.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn requeue(self) -> Result<()> {
        self.acker.requeue().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("task", &self.task)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_payload_is_the_order_number() {
        let task = ReconciliationTask::new(OrderNumber::parse("12345678903").unwrap());
        assert_eq!(task.encode(), b"12345678903".to_vec());
        assert_eq!(ReconciliationTask::decode(b"12345678903").unwrap(), task);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ReconciliationTask::decode(&[0xff, 0xfe]),
            Err(LoyaltyError::Queue(_))
        ));
        assert!(matches!(
            ReconciliationTask::decode(b"12345678902"),
            Err(LoyaltyError::InvalidNumber(_))
        ));
    }
}

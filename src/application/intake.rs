use crate::domain::order::{Order, OrderNumber};
use crate::domain::ports::{OrderLedgerRef, OutboxRef, TaskQueueRef};
use crate::domain::task::ReconciliationTask;
use crate::domain::user::UserId;
use crate::error::{LoyaltyError, Result};
use tracing::{debug, info, warn};

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A new order was recorded and queued for reconciliation.
    Accepted(Order),
    /// The same user already uploaded this number; nothing changed.
    AlreadySubmitted(Order),
}

impl SubmitOutcome {
    pub fn order(&self) -> &Order {
        match self {
            Self::Accepted(order) | Self::AlreadySubmitted(order) => order,
        }
    }
}

/// Accepts order uploads and hands them to reconciliation.
pub struct OrderIntake {
    orders: OrderLedgerRef,
    outbox: OutboxRef,
    queue: TaskQueueRef,
}

impl OrderIntake {
    pub fn new(orders: OrderLedgerRef, outbox: OutboxRef, queue: TaskQueueRef) -> Self {
        Self {
            orders,
            outbox,
            queue,
        }
    }

    /// Records an order for `user_id` and publishes its reconciliation task.
    ///
    /// The order survives a failed publish; its outbox entry is then left for
    /// the relay.
    #[tracing::instrument(name = "intake.submit", skip(self), fields(user = %user_id))]
    pub async fn submit(&self, raw_number: &str, user_id: UserId) -> Result<SubmitOutcome> {
        let number = OrderNumber::parse(raw_number)?;

        let order = match self.orders.insert(number.clone(), user_id).await {
            Ok(order) => order,
            Err(LoyaltyError::Duplicate { .. }) => {
                let existing = self.orders.find_by_number(&number).await?;
                if existing.user_id == user_id {
                    debug!("Order already submitted by this user");
                    return Ok(SubmitOutcome::AlreadySubmitted(existing));
                }
                return Err(LoyaltyError::Conflict(number.to_string()));
            }
            Err(e) => return Err(e),
        };

        match self.queue.publish(&ReconciliationTask::new(number.clone())).await {
            Ok(()) => {
                if let Err(e) = self.outbox.remove(&number).await {
                    warn!(error = %e, "Failed to clear outbox entry after publish");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to publish reconciliation task, leaving it to the outbox relay");
            }
        }

        info!(order = %number, "Order accepted");
        Ok(SubmitOutcome::Accepted(order))
    }
}

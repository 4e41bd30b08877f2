use super::accrual::AuthorityResponse;
use super::money::{Amount, Balance};
use super::order::{Order, OrderNumber, OrderStatus};
use super::task::{Delivery, OutboxEntry, ReconciliationTask};
use super::user::{BalanceSummary, User, UserId};
use super::withdrawal::Withdrawal;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Durable store of orders. Owns order-number uniqueness.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Inserts a `New` order and its outbox entry in one transaction.
    ///
    /// Fails with `Duplicate` when the number exists for any user.
    async fn insert(&self, number: OrderNumber, user_id: UserId) -> Result<Order>;
    async fn find_by_number(&self, number: &OrderNumber) -> Result<Order>;
    /// Oldest first.
    async fn find_all_by_user(&self, user_id: UserId) -> Result<Vec<Order>>;
    /// Moves the order to `status` and credits its owner in one transaction.
    ///
    /// Nothing is written when any part fails.
    async fn apply_accrual(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Balance,
    ) -> Result<Order>;
}

/// Durable store of users, balances and withdrawals.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn register_user(&self, login: &str, credential_hash: &str) -> Result<User>;
    async fn find_user(&self, user_id: UserId) -> Result<User>;
    async fn find_user_by_login(&self, login: &str) -> Result<User>;
    /// Checks the balance, debits it and records the withdrawal atomically.
    async fn withdraw(
        &self,
        order_number: OrderNumber,
        amount: Amount,
        user_id: UserId,
    ) -> Result<Withdrawal>;
    /// Oldest first.
    async fn withdrawals_by_user(&self, user_id: UserId) -> Result<Vec<Withdrawal>>;
    /// Current balance and withdrawn total read from one consistent state.
    async fn balance_summary(&self, user_id: UserId) -> Result<BalanceSummary>;
}

/// Tasks written by `OrderLedger::insert` that still await a confirmed publish.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Oldest first, at most `limit` entries.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>>;
    async fn remove(&self, order_number: &OrderNumber) -> Result<()>;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// At-least-once channel of reconciliation tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns once the backend has confirmed the task is stored.
    async fn publish(&self, task: &ReconciliationTask) -> Result<()>;
    /// Opens a consumer. Unsettled deliveries are redelivered.
    async fn subscribe(&self) -> Result<DeliveryStream>;
}

/// External service computing accrual for an order.
#[async_trait]
pub trait AccrualAuthority: Send + Sync {
    /// Transport failures surface as `Err`; every HTTP answer is an `Ok` variant.
    async fn query(&self, number: &OrderNumber) -> Result<AuthorityResponse>;
}

/// Credential/session collaborator. Implemented outside this crate.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<UserId>;
}

pub type OrderLedgerRef = Arc<dyn OrderLedger>;
pub type BalanceLedgerRef = Arc<dyn BalanceLedger>;
pub type OutboxRef = Arc<dyn Outbox>;
pub type TaskQueueRef = Arc<dyn TaskQueue>;
pub type AccrualAuthorityRef = Arc<dyn AccrualAuthority>;
pub type AuthenticatorRef = Arc<dyn Authenticator>;

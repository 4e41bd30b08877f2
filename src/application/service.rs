use super::intake::{OrderIntake, SubmitOutcome};
use crate::domain::money::Amount;
use crate::domain::order::{Order, OrderNumber};
use crate::domain::ports::{
    AuthenticatorRef, BalanceLedgerRef, OrderLedgerRef, OutboxRef, TaskQueueRef,
};
use crate::domain::user::{BalanceSummary, User, UserId};
use crate::domain::withdrawal::Withdrawal;
use crate::error::Result;
use rust_decimal::Decimal;
use tracing::info;

/// Everything an inbound adapter (HTTP handlers, CLI) may call.
///
/// Request parsing and response encoding stay with the caller.
pub struct LoyaltyService {
    intake: OrderIntake,
    orders: OrderLedgerRef,
    balances: BalanceLedgerRef,
    authenticator: AuthenticatorRef,
}

impl LoyaltyService {
    pub fn new(
        orders: OrderLedgerRef,
        balances: BalanceLedgerRef,
        outbox: OutboxRef,
        queue: TaskQueueRef,
        authenticator: AuthenticatorRef,
    ) -> Self {
        Self {
            intake: OrderIntake::new(orders.clone(), outbox, queue),
            orders,
            balances,
            authenticator,
        }
    }

    pub async fn authenticate(&self, credential: &str) -> Result<UserId> {
        self.authenticator.authenticate(credential).await
    }

    pub async fn register_user(&self, login: &str, credential_hash: &str) -> Result<User> {
        let user = self.balances.register_user(login, credential_hash).await?;
        info!(user = %user.id, %login, "User registered");
        Ok(user)
    }

    pub async fn submit_order(&self, raw_number: &str, user_id: UserId) -> Result<SubmitOutcome> {
        self.intake.submit(raw_number, user_id).await
    }

    pub async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>> {
        self.orders.find_all_by_user(user_id).await
    }

    pub async fn balance_summary(&self, user_id: UserId) -> Result<BalanceSummary> {
        self.balances.balance_summary(user_id).await
    }

    #[tracing::instrument(name = "service.withdraw", skip(self), fields(user = %user_id))]
    pub async fn withdraw(
        &self,
        raw_number: &str,
        amount: Decimal,
        user_id: UserId,
    ) -> Result<Withdrawal> {
        let number = OrderNumber::parse(raw_number)?;
        let amount = Amount::new(amount)?;
        let withdrawal = self.balances.withdraw(number, amount, user_id).await?;
        info!(%amount, "Withdrawal recorded");
        Ok(withdrawal)
    }

    pub async fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>> {
        self.balances.withdrawals_by_user(user_id).await
    }
}

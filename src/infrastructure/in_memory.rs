use crate::domain::money::{Amount, Balance};
use crate::domain::order::{Order, OrderNumber, OrderStatus};
use crate::domain::ports::{BalanceLedger, OrderLedger, Outbox};
use crate::domain::task::OutboxEntry;
use crate::domain::user::{BalanceSummary, User, UserId};
use crate::domain::withdrawal::Withdrawal;
use crate::error::{LoyaltyError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct LedgerState {
    orders: HashMap<OrderNumber, Order>,
    /// Per-user order numbers in insertion order.
    orders_by_user: HashMap<UserId, Vec<OrderNumber>>,
    users: HashMap<UserId, User>,
    logins: HashMap<String, UserId>,
    withdrawals: Vec<Withdrawal>,
    withdrawal_numbers: HashSet<OrderNumber>,
    outbox: Vec<OutboxEntry>,
}

impl LedgerState {
    fn user(&self, user_id: UserId) -> Result<&User> {
        self.users
            .get(&user_id)
            .ok_or_else(|| LoyaltyError::not_found("user", user_id))
    }
}

/// A thread-safe in-memory ledger holding orders, balances and the outbox.
///
/// Every write takes the single write lock and validates before mutating, so
/// each operation is all-or-nothing and concurrent balance updates serialize.
/// Ideal for testing or for running the pipeline without persistence.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedger {
    /// Creates a new, empty in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderLedger for InMemoryLedger {
    async fn insert(&self, number: OrderNumber, user_id: UserId) -> Result<Order> {
        let mut state = self.state.write().await;
        state.user(user_id)?;
        if state.orders.contains_key(&number) {
            return Err(LoyaltyError::duplicate("order", &number));
        }

        let order = Order::new(number.clone(), user_id);
        state.orders.insert(number.clone(), order.clone());
        state
            .orders_by_user
            .entry(user_id)
            .or_default()
            .push(number.clone());
        state.outbox.push(OutboxEntry::new(number));
        Ok(order)
    }

    async fn find_by_number(&self, number: &OrderNumber) -> Result<Order> {
        let state = self.state.read().await;
        state
            .orders
            .get(number)
            .cloned()
            .ok_or_else(|| LoyaltyError::not_found("order", number))
    }

    async fn find_all_by_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders_by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|number| state.orders.get(number).cloned())
            .collect())
    }

    async fn apply_accrual(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Balance,
    ) -> Result<Order> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let mut order = state
            .orders
            .get(number)
            .cloned()
            .ok_or_else(|| LoyaltyError::not_found("order", number))?;
        let balance = state.user(order.user_id)?.balance;
        let credit = order.settle(status, accrual)?;
        let balance = balance.checked_add(credit)?;

        // Nothing has been written yet; from here on both rows change together.
        if let Some(user) = state.users.get_mut(&order.user_id) {
            user.balance = balance;
        }
        state.orders.insert(number.clone(), order.clone());
        Ok(order)
    }
}

#[async_trait]
impl BalanceLedger for InMemoryLedger {
    async fn register_user(&self, login: &str, credential_hash: &str) -> Result<User> {
        let mut state = self.state.write().await;
        if state.logins.contains_key(login) {
            return Err(LoyaltyError::duplicate("user", login));
        }

        let user = User::new(login, credential_hash);
        state.logins.insert(user.login.clone(), user.id);
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, user_id: UserId) -> Result<User> {
        let state = self.state.read().await;
        state.user(user_id).cloned()
    }

    async fn find_user_by_login(&self, login: &str) -> Result<User> {
        let state = self.state.read().await;
        let user_id = state
            .logins
            .get(login)
            .ok_or_else(|| LoyaltyError::not_found("user", login))?;
        state.user(*user_id).cloned()
    }

    async fn withdraw(
        &self,
        order_number: OrderNumber,
        amount: Amount,
        user_id: UserId,
    ) -> Result<Withdrawal> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let remaining = state.user(user_id)?.balance.debit(amount)?;
        if state.withdrawal_numbers.contains(&order_number) {
            return Err(LoyaltyError::duplicate("withdrawal", &order_number));
        }

        let withdrawal = Withdrawal::new(order_number.clone(), amount, user_id);
        if let Some(user) = state.users.get_mut(&user_id) {
            user.balance = remaining;
        }
        state.withdrawal_numbers.insert(order_number);
        state.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    async fn withdrawals_by_user(&self, user_id: UserId) -> Result<Vec<Withdrawal>> {
        let state = self.state.read().await;
        Ok(state
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn balance_summary(&self, user_id: UserId) -> Result<BalanceSummary> {
        let state = self.state.read().await;
        let current = state.user(user_id)?.balance;
        let withdrawn = Balance::checked_sum(
            state
                .withdrawals
                .iter()
                .filter(|w| w.user_id == user_id)
                .map(|w| Balance::from(w.amount)),
        )?;
        Ok(BalanceSummary { current, withdrawn })
    }
}

#[async_trait]
impl Outbox for InMemoryLedger {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        Ok(state.outbox.iter().take(limit).cloned().collect())
    }

    async fn remove(&self, order_number: &OrderNumber) -> Result<()> {
        let mut state = self.state.write().await;
        state.outbox.retain(|entry| &entry.order_number != order_number);
        Ok(())
    }
}

use crate::domain::accrual::{AccrualStatus, AuthorityResponse};
use crate::domain::money::Balance;
use crate::domain::order::{Order, OrderNumber, OrderStatus};
use crate::domain::ports::{AccrualAuthorityRef, OrderLedgerRef};
use crate::domain::task::Delivery;
use crate::error::{LoyaltyError, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing knobs for polling the accrual authority.
#[derive(Debug, Clone, Copy)]
pub struct ObserverSettings {
    /// Wait applied to a rate-limit answer that carries no usable `Retry-After`.
    pub default_retry_after: Duration,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            default_retry_after: Duration::from_secs(1),
            min_poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(30),
        }
    }
}

/// How one observer execution ended without error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The order reached a terminal status and its owner was credited.
    Accrued(Order),
    /// A redelivered task whose order was already terminal.
    AlreadySettled,
    /// The authority does not know the order; the task was dropped.
    Unregistered,
    /// Cancelled or out of time; the task went back to the queue.
    Abandoned,
}

/// Interruption bounds of one observer execution.
#[derive(Debug, Clone)]
pub struct Execution {
    token: CancellationToken,
    deadline: Instant,
}

impl Execution {
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the execution is cancelled or its deadline passes.
    async fn interrupted(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }

    /// Sleeps for `delay`; false when interrupted first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.interrupted() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Resolves reconciliation tasks against the accrual authority.
///
/// Every path settles the delivery exactly once: acknowledged when the task is
/// finished for good, requeued when it should be retried later.
pub struct AccrualObserver {
    authority: AccrualAuthorityRef,
    orders: OrderLedgerRef,
    settings: ObserverSettings,
}

impl AccrualObserver {
    pub fn new(
        authority: AccrualAuthorityRef,
        orders: OrderLedgerRef,
        settings: ObserverSettings,
    ) -> Self {
        Self {
            authority,
            orders,
            settings,
        }
    }

    #[tracing::instrument(
        name = "observer.execute",
        skip_all,
        fields(order = %delivery.task(), attempt = delivery.attempt())
    )]
    pub async fn execute(&self, delivery: Delivery, execution: &Execution) -> Result<Outcome> {
        let number = delivery.task().order_number.clone();
        let mut poll_backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.min_poll_interval)
            .with_max_delay(self.settings.max_poll_interval)
            .with_max_times(usize::MAX)
            .build();
        let mut marked_processing = false;

        loop {
            let response = tokio::select! {
                biased;
                _ = execution.interrupted() => return abandon(delivery).await,
                response = self.authority.query(&number) => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Accrual authority unreachable");
                    requeue(delivery).await;
                    return Err(e);
                }
            };

            match response {
                AuthorityResponse::Resolved(report) => {
                    if let Some(status) = report.status.terminal_status() {
                        return self.settle(delivery, &number, status, report.accrual).await;
                    }
                    if report.status == AccrualStatus::Processing && !marked_processing {
                        marked_processing = true;
                        self.mark_processing(&number).await;
                    }
                    let delay = poll_backoff
                        .next()
                        .unwrap_or(self.settings.max_poll_interval);
                    debug!(status = ?report.status, delay_ms = delay.as_millis() as u64, "Accrual pending");
                    if !execution.pause(delay).await {
                        return abandon(delivery).await;
                    }
                }
                AuthorityResponse::NotRegistered => {
                    info!("Order unknown to the accrual authority, dropping task");
                    delivery.ack().await?;
                    return Ok(Outcome::Unregistered);
                }
                AuthorityResponse::RateLimited { retry_after } => {
                    let delay = retry_after.unwrap_or(self.settings.default_retry_after);
                    warn!(retry_after_secs = delay.as_secs_f64(), "Rate limited by accrual authority");
                    if !execution.pause(delay).await {
                        return abandon(delivery).await;
                    }
                }
                AuthorityResponse::Unrecognized { detail } => {
                    error!(%detail, "Unrecognized accrual authority response");
                    requeue(delivery).await;
                    return Err(LoyaltyError::UnrecognizedResponse(detail));
                }
            }
        }
    }

    async fn settle(
        &self,
        delivery: Delivery,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<rust_decimal::Decimal>,
    ) -> Result<Outcome> {
        let accrual = match Balance::new(accrual.unwrap_or_default()) {
            Ok(accrual) => accrual,
            Err(e) => {
                error!(error = %e, "Accrual authority reported an unusable amount");
                requeue(delivery).await;
                return Err(e);
            }
        };

        match self.orders.apply_accrual(number, status, accrual).await {
            Ok(order) => {
                delivery.ack().await?;
                info!(%status, %accrual, user = %order.user_id, "Order settled");
                Ok(Outcome::Accrued(order))
            }
            Err(LoyaltyError::InvalidTransition { from, .. }) if from.is_terminal() => {
                info!(%from, "Order already settled, dropping redelivered task");
                delivery.ack().await?;
                Ok(Outcome::AlreadySettled)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Failed to apply accrual, returning task to the queue");
                requeue(delivery).await;
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Accrual cannot be applied, dropping task");
                delivery.ack().await?;
                Err(e)
            }
        }
    }

    async fn mark_processing(&self, number: &OrderNumber) {
        match self
            .orders
            .apply_accrual(number, OrderStatus::Processing, Balance::ZERO)
            .await
        {
            Ok(_) => debug!("Order moved to PROCESSING"),
            Err(LoyaltyError::InvalidTransition { from, .. }) => {
                debug!(%from, "Order not moved to PROCESSING");
            }
            Err(e) => warn!(error = %e, "Failed to mark order as PROCESSING"),
        }
    }
}

async fn abandon(delivery: Delivery) -> Result<Outcome> {
    info!("Execution interrupted, returning task to the queue");
    delivery.requeue().await?;
    Ok(Outcome::Abandoned)
}

async fn requeue(delivery: Delivery) {
    if let Err(e) = delivery.requeue().await {
        error!(error = %e, "Failed to requeue reconciliation task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::accrual::AccrualReport;
    use crate::domain::ports::{AccrualAuthority, BalanceLedger, OrderLedger, TaskQueue};
    use crate::domain::task::ReconciliationTask;
    use crate::domain::user::UserId;
    use crate::infrastructure::in_memory::InMemoryLedger;
    use crate::infrastructure::memory_queue::InMemoryTaskQueue;
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Authority that replays scripted answers, repeating the last one.
    #[derive(Default)]
    struct ScriptedAuthority {
        script: Mutex<VecDeque<Result<AuthorityResponse>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedAuthority {
        fn new(script: Vec<Result<AuthorityResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().clone()
        }
    }

    fn replay(answer: &Result<AuthorityResponse>) -> Result<AuthorityResponse> {
        match answer {
            Ok(response) => Ok(response.clone()),
            Err(e) => Err(LoyaltyError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                e.to_string(),
            ))),
        }
    }

    #[async_trait]
    impl AccrualAuthority for ScriptedAuthority {
        async fn query(&self, _number: &OrderNumber) -> Result<AuthorityResponse> {
            self.calls.lock().push(Instant::now());
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or_else(|| Ok(AuthorityResponse::NotRegistered))
            } else {
                script
                    .front()
                    .map(replay)
                    .unwrap_or(Ok(AuthorityResponse::NotRegistered))
            }
        }
    }

    fn resolved(raw: &str, status: AccrualStatus, accrual: Option<Decimal>) -> Result<AuthorityResponse> {
        Ok(AuthorityResponse::Resolved(AccrualReport {
            order: OrderNumber::parse(raw).unwrap(),
            status,
            accrual,
        }))
    }

    fn settings() -> ObserverSettings {
        ObserverSettings {
            default_retry_after: Duration::from_secs(1),
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(2),
        }
    }

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        queue: InMemoryTaskQueue,
        user: UserId,
    }

    async fn fixture(raw: &str) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let user = ledger.register_user("alice", "hash").await.unwrap();
        ledger
            .insert(OrderNumber::parse(raw).unwrap(), user.id)
            .await
            .unwrap();
        let queue = InMemoryTaskQueue::new();
        queue
            .publish(&ReconciliationTask::new(OrderNumber::parse(raw).unwrap()))
            .await
            .unwrap();
        Fixture {
            ledger,
            queue,
            user: user.id,
        }
    }

    impl Fixture {
        fn observer(&self, authority: Arc<ScriptedAuthority>) -> AccrualObserver {
            AccrualObserver::new(authority, self.ledger.clone(), settings())
        }

        async fn delivery(&self) -> Delivery {
            let mut stream = self.queue.subscribe().await.unwrap();
            stream.next().await.unwrap().unwrap()
        }

        async fn order(&self, raw: &str) -> Order {
            self.ledger
                .find_by_number(&OrderNumber::parse(raw).unwrap())
                .await
                .unwrap()
        }
    }

    fn execution() -> Execution {
        Execution::new(CancellationToken::new(), Duration::from_secs(900))
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_report_credits_and_acks() {
        let fx = fixture("12345678903").await;
        let authority = ScriptedAuthority::new(vec![resolved(
            "12345678903",
            AccrualStatus::Processed,
            Some(dec!(500)),
        )]);

        let outcome = fx
            .observer(authority)
            .execute(fx.delivery().await, &execution())
            .await
            .unwrap();

        let Outcome::Accrued(order) = outcome else {
            panic!("expected accrual, got {outcome:?}");
        };
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Some(Balance::new(dec!(500)).unwrap()));
        let user = fx.ledger.find_user(fx.user).await.unwrap();
        assert_eq!(user.balance, Balance::new(dec!(500)).unwrap());
        assert_eq!(fx.queue.stats().acked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_report_settles_without_credit() {
        let fx = fixture("79927398713").await;
        let authority =
            ScriptedAuthority::new(vec![resolved("79927398713", AccrualStatus::Invalid, None)]);

        fx.observer(authority)
            .execute(fx.delivery().await, &execution())
            .await
            .unwrap();

        assert_eq!(fx.order("79927398713").await.status, OrderStatus::Invalid);
        assert_eq!(fx.ledger.find_user(fx.user).await.unwrap().balance, Balance::ZERO);
        assert_eq!(fx.queue.stats().acked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_before_repoll_without_ack() {
        let fx = fixture("12345678903").await;
        let authority = ScriptedAuthority::new(vec![
            Ok(AuthorityResponse::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            }),
            resolved("12345678903", AccrualStatus::Processed, Some(dec!(10))),
        ]);

        let observer = fx.observer(authority.clone());
        let delivery = fx.delivery().await;
        let queue = fx.queue.clone();
        let handle = tokio::spawn(async move { observer.execute(delivery, &execution()).await });

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(authority.calls().len(), 1);
        assert_eq!(queue.stats().acked, 0);
        assert_eq!(queue.stats().in_flight, 1);

        handle.await.unwrap().unwrap();
        let calls = authority.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_secs(2));
        assert_eq!(queue.stats().acked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_retry_after_uses_default() {
        let fx = fixture("12345678903").await;
        let authority = ScriptedAuthority::new(vec![
            Ok(AuthorityResponse::RateLimited { retry_after: None }),
            Ok(AuthorityResponse::NotRegistered),
        ]);

        fx.observer(authority.clone())
            .execute(fx.delivery().await, &execution())
            .await
            .unwrap();

        let calls = authority.calls();
        assert!(calls[1] - calls[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_registered_acks_and_leaves_order() {
        let fx = fixture("79927398713").await;
        let authority = ScriptedAuthority::new(vec![Ok(AuthorityResponse::NotRegistered)]);

        let outcome = fx
            .observer(authority)
            .execute(fx.delivery().await, &execution())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unregistered);
        assert_eq!(fx.order("79927398713").await.status, OrderStatus::New);
        let stats = fx.queue.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_requeues_after_single_call() {
        let fx = fixture("79927398713").await;
        let authority = ScriptedAuthority::new(vec![Err(LoyaltyError::Queue(
            "connection refused".to_string(),
        ))]);

        let result = fx
            .observer(authority.clone())
            .execute(fx.delivery().await, &execution())
            .await;

        assert!(result.is_err());
        assert_eq!(authority.calls().len(), 1);
        let stats = fx.queue.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.ready, 1);
        assert_eq!(fx.order("79927398713").await.status, OrderStatus::New);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecognized_response_requeues() {
        let fx = fixture("79927398713").await;
        let authority = ScriptedAuthority::new(vec![Ok(AuthorityResponse::Unrecognized {
            detail: "unexpected status 500".to_string(),
        })]);

        let result = fx
            .observer(authority)
            .execute(fx.delivery().await, &execution())
            .await;

        assert!(matches!(result, Err(LoyaltyError::UnrecognizedResponse(_))));
        assert_eq!(fx.queue.stats().requeued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_sleep_requeues() {
        let fx = fixture("12345678903").await;
        let authority = ScriptedAuthority::new(vec![Ok(AuthorityResponse::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        })]);

        let token = CancellationToken::new();
        let execution = Execution::new(token.clone(), Duration::from_secs(900));
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let outcome = fx
            .observer(authority.clone())
            .execute(fx.delivery().await, &execution)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, Outcome::Abandoned);
        assert_eq!(authority.calls().len(), 1);
        assert_eq!(fx.queue.stats().requeued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_pending_order() {
        let fx = fixture("12345678903").await;
        let authority = ScriptedAuthority::new(vec![resolved(
            "12345678903",
            AccrualStatus::Processing,
            None,
        )]);

        let execution = Execution::new(CancellationToken::new(), Duration::from_secs(10));
        let outcome = fx
            .observer(authority)
            .execute(fx.delivery().await, &execution)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Abandoned);
        assert_eq!(fx.order("12345678903").await.status, OrderStatus::Processing);
        assert_eq!(fx.queue.stats().requeued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_backs_off_then_settles() {
        let fx = fixture("12345678903").await;
        let authority = ScriptedAuthority::new(vec![
            resolved("12345678903", AccrualStatus::Registered, None),
            resolved("12345678903", AccrualStatus::Processing, None),
            resolved("12345678903", AccrualStatus::Processing, None),
            resolved("12345678903", AccrualStatus::Processed, Some(dec!(729.98))),
        ]);

        let outcome = fx
            .observer(authority.clone())
            .execute(fx.delivery().await, &execution())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Accrued(_)));
        let calls = authority.calls();
        assert_eq!(calls.len(), 4);
        // Delays grow: 100ms, 200ms, 400ms.
        assert!(calls[1] - calls[0] >= Duration::from_millis(100));
        assert!(calls[2] - calls[1] >= Duration::from_millis(200));
        assert!(calls[3] - calls[2] >= Duration::from_millis(400));
        assert_eq!(
            fx.ledger.find_user(fx.user).await.unwrap().balance,
            Balance::new(dec!(729.98)).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_settled_task_is_acked_once() {
        let fx = fixture("12345678903").await;
        let raw = "12345678903";
        fx.ledger
            .apply_accrual(
                &OrderNumber::parse(raw).unwrap(),
                OrderStatus::Processed,
                Balance::new(dec!(500)).unwrap(),
            )
            .await
            .unwrap();
        let authority =
            ScriptedAuthority::new(vec![resolved(raw, AccrualStatus::Processed, Some(dec!(500)))]);

        let outcome = fx
            .observer(authority)
            .execute(fx.delivery().await, &execution())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::AlreadySettled);
        assert_eq!(fx.queue.stats().acked, 1);
        assert_eq!(
            fx.ledger.find_user(fx.user).await.unwrap().balance,
            Balance::new(dec!(500)).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_accrual_is_requeued() {
        let fx = fixture("12345678903").await;
        let authority = ScriptedAuthority::new(vec![resolved(
            "12345678903",
            AccrualStatus::Processed,
            Some(dec!(-5)),
        )]);

        let result = fx
            .observer(authority)
            .execute(fx.delivery().await, &execution())
            .await;

        assert!(matches!(result, Err(LoyaltyError::ValidationError(_))));
        assert_eq!(fx.order("12345678903").await.status, OrderStatus::New);
        assert_eq!(fx.queue.stats().requeued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_order_is_acked_once() {
        let fx = fixture("12345678903").await;
        fx.queue
            .publish(&ReconciliationTask::new(OrderNumber::parse("79927398713").unwrap()))
            .await
            .unwrap();
        let authority = ScriptedAuthority::new(vec![resolved(
            "79927398713",
            AccrualStatus::Processed,
            Some(dec!(10)),
        )]);
        let observer = fx.observer(authority.clone());

        let mut stream = fx.queue.subscribe().await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.ack().await.unwrap();
        let orphan = stream.next().await.unwrap().unwrap();
        let result = observer.execute(orphan, &execution()).await;

        assert!(matches!(result, Err(LoyaltyError::NotFound { entity: "order", .. })));
        assert_eq!(authority.calls().len(), 1);
        let stats = fx.queue.stats();
        assert_eq!(stats.acked, 2);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflowing_credit_is_dropped_without_panic() {
        let fx = fixture("12345678903").await;
        fx.ledger
            .insert(OrderNumber::parse("79927398713").unwrap(), fx.user)
            .await
            .unwrap();
        fx.ledger
            .apply_accrual(
                &OrderNumber::parse("79927398713").unwrap(),
                OrderStatus::Processed,
                Balance::new(Decimal::MAX).unwrap(),
            )
            .await
            .unwrap();
        let authority = ScriptedAuthority::new(vec![resolved(
            "12345678903",
            AccrualStatus::Processed,
            Some(dec!(1)),
        )]);

        let result = fx
            .observer(authority)
            .execute(fx.delivery().await, &execution())
            .await;

        assert!(matches!(result, Err(LoyaltyError::ValidationError(_))));
        assert_eq!(fx.order("12345678903").await.status, OrderStatus::New);
        assert_eq!(
            fx.ledger.find_user(fx.user).await.unwrap().balance,
            Balance::new(Decimal::MAX).unwrap()
        );
        assert_eq!(fx.queue.stats().acked, 1);
    }

    /// Order ledger whose writes always hit a storage failure.
    struct UnavailableLedger;

    #[async_trait]
    impl OrderLedger for UnavailableLedger {
        async fn insert(&self, _number: OrderNumber, _user_id: UserId) -> Result<Order> {
            Err(LoyaltyError::Storage("disk unavailable".to_string()))
        }

        async fn find_by_number(&self, number: &OrderNumber) -> Result<Order> {
            Err(LoyaltyError::not_found("order", number))
        }

        async fn find_all_by_user(&self, _user_id: UserId) -> Result<Vec<Order>> {
            Ok(Vec::new())
        }

        async fn apply_accrual(
            &self,
            _number: &OrderNumber,
            _status: OrderStatus,
            _accrual: Balance,
        ) -> Result<Order> {
            Err(LoyaltyError::Storage("disk unavailable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_requeues() {
        let queue = InMemoryTaskQueue::new();
        queue
            .publish(&ReconciliationTask::new(OrderNumber::parse("12345678903").unwrap()))
            .await
            .unwrap();
        let authority = ScriptedAuthority::new(vec![resolved(
            "12345678903",
            AccrualStatus::Invalid,
            None,
        )]);
        let observer = AccrualObserver::new(authority, Arc::new(UnavailableLedger), settings());

        let delivery = queue.subscribe().await.unwrap().next().await.unwrap().unwrap();
        let result = observer.execute(delivery, &execution()).await;

        assert!(matches!(result, Err(LoyaltyError::Storage(_))));
        let stats = queue.stats();
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.ready, 1);
    }
}

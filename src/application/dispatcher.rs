use super::observer::{AccrualObserver, Execution};
use crate::domain::ports::TaskQueueRef;
use crate::domain::task::Delivery;
use crate::error::Result;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub pool_size: usize,
    pub task_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            pool_size: 16,
            task_timeout: Duration::from_secs(900),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Delivery>>>;

/// Pause after a failed subscription read before polling it again.
const SUBSCRIPTION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Feeds queue deliveries to a fixed pool of observer workers.
///
/// At most `pool_size` executions run at once; the subscription is throttled
/// by a channel of the same capacity.
pub struct Dispatcher {
    queue: TaskQueueRef,
    observer: Arc<AccrualObserver>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        queue: TaskQueueRef,
        observer: Arc<AccrualObserver>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            observer,
            settings,
        }
    }

    /// Runs until `shutdown` fires or the subscription ends, then drains.
    ///
    /// Buffered deliveries are requeued right away. In-flight executions get
    /// `shutdown_grace` to finish before they are cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut deliveries = self.queue.subscribe().await?;
        let pool_size = self.settings.pool_size.max(1);
        let (tx, rx) = mpsc::channel::<Delivery>(pool_size);
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let executions = CancellationToken::new();

        let mut workers = JoinSet::new();
        for worker in 0..pool_size {
            workers.spawn(work(
                worker,
                Arc::clone(&rx),
                Arc::clone(&self.observer),
                shutdown.clone(),
                executions.clone(),
                self.settings.task_timeout,
            ));
        }
        info!(pool_size, "Dispatcher started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(error = %e, "Subscription error");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(SUBSCRIPTION_RETRY_DELAY) => continue,
                        }
                    }
                    None => {
                        info!("Subscription closed");
                        break;
                    }
                },
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    release(delivery).await;
                    break;
                }
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit.send(delivery),
                    Err(_) => {
                        release(delivery).await;
                        break;
                    }
                },
            }
        }

        info!("Dispatcher stopping");
        drop(deliveries);
        drop(tx);

        {
            let mut rx = rx.lock().await;
            rx.close();
            while let Ok(delivery) = rx.try_recv() {
                release(delivery).await;
            }
        }

        // An ended subscription lets running executions finish on their own.
        if !shutdown.is_cancelled() {
            while workers.join_next().await.is_some() {}
            return Ok(());
        }

        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = self.settings.shutdown_grace.as_secs(),
                "Grace period elapsed, cancelling in-flight executions"
            );
            executions.cancel();
            while workers.join_next().await.is_some() {}
        }
        info!("Dispatcher stopped");
        Ok(())
    }
}

async fn work(
    worker: usize,
    rx: SharedReceiver,
    observer: Arc<AccrualObserver>,
    shutdown: CancellationToken,
    executions: CancellationToken,
    task_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            delivery = async { rx.lock().await.recv().await } => delivery,
        };
        let Some(delivery) = next else {
            break;
        };

        // A panicking execution drops its delivery back to the queue and
        // leaves the worker running.
        let order = delivery.task().to_string();
        let execution = Execution::new(executions.child_token(), task_timeout);
        let result = AssertUnwindSafe(observer.execute(delivery, &execution))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(outcome)) => debug!(worker, ?outcome, "Reconciliation finished"),
            Ok(Err(e)) => warn!(worker, error = %e, "Reconciliation failed"),
            Err(panic) => {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(worker, %order, %panic_msg, "Reconciliation panicked");
            }
        }
    }
    debug!(worker, "Worker stopped");
}

async fn release(delivery: Delivery) {
    let order = delivery.task().to_string();
    if let Err(e) = delivery.requeue().await {
        error!(%order, error = %e, "Failed to release buffered task");
    }
}

use crate::domain::ports::{DeliveryStream, TaskQueue};
use crate::domain::task::{Acknowledger, Delivery, ReconciliationTask};
use crate::error::{LoyaltyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    /// Ready messages with the number of times each was already delivered.
    ready: VecDeque<(ReconciliationTask, u32)>,
    in_flight: usize,
    acked: usize,
    requeued: usize,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    available: Notify,
}

impl Shared {
    fn push(&self, task: ReconciliationTask, delivered: u32) {
        self.state.lock().ready.push_back((task, delivered));
        self.available.notify_one();
    }
}

/// In-process reconciliation queue with at-least-once semantics.
///
/// FIFO per queue. A delivery that is requeued, or dropped without being
/// settled, goes back to the tail of the queue with its attempt counter bumped.
/// Cloning shares the same queue.
#[derive(Default, Clone)]
pub struct InMemoryTaskQueue {
    shared: Arc<Shared>,
}

/// Counters for observing queue behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub acked: usize,
    pub requeued: usize,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            ready: state.ready.len(),
            in_flight: state.in_flight,
            acked: state.acked,
            requeued: state.requeued,
        }
    }

    /// Ends every open subscription once the ready messages are drained.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_waiters();
    }

    async fn next_delivery(shared: &Arc<Shared>) -> Option<Delivery> {
        loop {
            let notified = shared.available.notified();
            {
                let mut state = shared.state.lock();
                if let Some((task, delivered)) = state.ready.pop_front() {
                    state.in_flight += 1;
                    let attempt = delivered + 1;
                    let acker = MemoryAcker {
                        shared: Arc::clone(shared),
                        task: Some(task.clone()),
                        attempt,
                    };
                    return Some(Delivery::new(task, attempt, Box::new(acker)));
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn publish(&self, task: &ReconciliationTask) -> Result<()> {
        if self.shared.state.lock().closed {
            return Err(LoyaltyError::Queue("Queue is closed".to_string()));
        }
        self.shared.push(task.clone(), 0);
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream> {
        let shared = Arc::clone(&self.shared);
        let stream = futures::stream::unfold(shared, |shared| async move {
            let delivery = Self::next_delivery(&shared).await?;
            Some((Ok(delivery), shared))
        });
        Ok(Box::pin(stream))
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    /// Taken on settlement; still present when dropped unsettled.
    task: Option<ReconciliationTask>,
    attempt: u32,
}

impl MemoryAcker {
    fn settle(&mut self, requeue: bool) {
        let Some(task) = self.task.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            state.in_flight -= 1;
            if requeue {
                state.requeued += 1;
            } else {
                state.acked += 1;
            }
        }
        if requeue {
            debug!(order = %task, attempt = self.attempt, "Requeued reconciliation task");
            self.shared.push(task, self.attempt);
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.settle(false);
        Ok(())
    }

    async fn requeue(mut self: Box<Self>) -> Result<()> {
        self.settle(true);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.settle(true);
    }
}

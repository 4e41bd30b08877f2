use crate::domain::ports::{OutboxRef, TaskQueueRef};
use crate::error::Result;
use chrono::{TimeDelta, Utc};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Publishes outbox entries that intake could not hand to the queue.
///
/// An entry is removed only after its publish is confirmed, so a crash in
/// between leads to a duplicate task, never a lost one. Entries younger than
/// `min_age` (one interval by default) are left to the intake that wrote them.
pub struct OutboxRelay {
    outbox: OutboxRef,
    queue: TaskQueueRef,
    interval: Duration,
    batch_size: usize,
    min_age: Duration,
}

impl OutboxRelay {
    pub fn new(outbox: OutboxRef, queue: TaskQueueRef, interval: Duration, batch_size: usize) -> Self {
        Self {
            outbox,
            queue,
            interval,
            batch_size,
            min_age: interval,
        }
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Relays one batch. Returns how many entries were published.
    ///
    /// Stops at the first publish failure; the rest wait for the next tick.
    pub async fn relay_once(&self) -> Result<usize> {
        let entries = self.outbox.pending(self.batch_size).await?;
        let Some(cutoff) = TimeDelta::from_std(self.min_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut published = 0;
        for entry in entries {
            // Pending entries come oldest first.
            if entry.enqueued_at > cutoff {
                debug!(order = %entry.order_number, "Outbox entry too fresh to relay");
                break;
            }
            if let Err(e) = self.queue.publish(&entry.task()).await {
                warn!(order = %entry.order_number, error = %e, "Outbox publish failed");
                break;
            }
            self.outbox.remove(&entry.order_number).await?;
            published += 1;
        }
        Ok(published)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Outbox relay started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.relay_once().await {
                    Ok(0) => {}
                    Ok(published) => info!(published, "Relayed stranded reconciliation tasks"),
                    Err(e) => warn!(error = %e, "Outbox relay pass failed"),
                },
            }
        }
        debug!("Outbox relay stopped");
    }
}

//! RabbitMQ-backed reconciliation queue.
//!
//! Tasks go to a durable queue through the default exchange as persistent
//! messages with publisher confirms. Consumers use manual acknowledgement and a
//! prefetch window so unacknowledged work is redelivered after a crash.

use crate::domain::ports::{DeliveryStream, TaskQueue};
use crate::domain::task::{Acknowledger, Delivery, ReconciliationTask};
use crate::error::{LoyaltyError, Result};
use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
};
use tracing::{debug, error, info};

const CONSUMER_TAG: &str = "loyalty-accrual-observer";

/// Connection settings for [`AmqpTaskQueue`].
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub queue: String,
    pub prefetch: u16,
}

/// Reconciliation queue on an AMQP broker.
pub struct AmqpTaskQueue {
    pool: Pool,
    config: AmqpConfig,
}

impl AmqpTaskQueue {
    /// Connects, verifies the broker is reachable, and declares the queue.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(4)
            .build()
            .map_err(|e| LoyaltyError::Queue(format!("Failed to create pool: {e}")))?;

        let queue = Self { pool, config };
        let channel = queue.channel().await?;
        queue.declare(&channel).await?;

        info!(queue = %queue.config.queue, "Connected to AMQP");
        Ok(queue)
    }

    async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            LoyaltyError::Queue(format!("Failed to get connection from pool: {e}"))
        })?;
        Ok(conn.create_channel().await?)
    }

    async fn declare(&self, channel: &Channel) -> Result<()> {
        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for AmqpTaskQueue {
    #[tracing::instrument(name = "queue.publish", skip_all, fields(order = %task))]
    async fn publish(&self, task: &ReconciliationTask) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_delivery_mode(2); // persistent

        let confirmation = channel
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                &task.encode(),
                properties,
            )
            .await?
            .await?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(LoyaltyError::Queue(format!(
                "Broker rejected reconciliation task {task}"
            )));
        }
        debug!(queue = %self.config.queue, "Published reconciliation task");
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream> {
        let channel = self.channel().await?;
        self.declare(&channel).await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.filter_map(move |item| {
            // The consumer lives only as long as its channel.
            let _channel = channel.clone();
            async move {
                match item {
                    Ok(delivery) => into_delivery(delivery).await,
                    Err(e) => Some(Err(LoyaltyError::from(e))),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Wraps a broker delivery; malformed payloads are dropped from the queue.
async fn into_delivery(delivery: lapin::message::Delivery) -> Option<Result<Delivery>> {
    let attempt = if delivery.redelivered { 2 } else { 1 };
    match ReconciliationTask::decode(&delivery.data) {
        Ok(task) => {
            let acker = AmqpAcker {
                acker: delivery.acker,
            };
            Some(Ok(Delivery::new(task, attempt, Box::new(acker))))
        }
        Err(e) => {
            error!(error = %e, "Failed to decode reconciliation task");
            let options = BasicNackOptions {
                requeue: false,
                ..Default::default()
            };
            if let Err(e) = delivery.acker.nack(options).await {
                error!(error = %e, "Failed to reject malformed message");
            }
            None
        }
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn requeue(self: Box<Self>) -> Result<()> {
        let options = BasicNackOptions {
            requeue: true,
            ..Default::default()
        };
        self.acker.nack(options).await?;
        Ok(())
    }
}

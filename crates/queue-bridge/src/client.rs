//! The queue contract shared by every backend, and the factory that builds one.

use crate::config::{QueueConfig, QueueType};
use crate::context::OperationContext;
use crate::error::QueueError;
use crate::message::{Attributes, Message, QueueInfo};
use crate::providers::{KafkaQueue, RabbitMqQueue, SqsQueue};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Main interface for queue operations across all backends.
///
/// Delivery is at-least-once on every backend. What `ack` and `nack` mean on
/// the wire differs:
///
/// | Backend  | `ack`                      | `nack`                                 |
/// |----------|----------------------------|----------------------------------------|
/// | SQS      | delete by receipt handle   | visibility timeout set to zero         |
/// | Kafka    | commit offset, drop entry  | drop entry without commit (see below)  |
/// | RabbitMQ | `basic.ack` on the tag     | `basic.nack` with requeue              |
///
/// Kafka has no per-message negative acknowledgment. A nacked record is only
/// redelivered if its offset is never committed and the consumer group
/// restarts from an earlier position; a later ack on the same partition
/// commits past it.
///
/// Implementations are `Send + Sync` and hold no state beyond their
/// connections (plus Kafka's pending table), but whether concurrent calls on
/// one instance are safe is only as strong as the underlying client library.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Send one message; returns once the backend has accepted it
    async fn send(
        &self,
        ctx: &OperationContext,
        destination: &str,
        body: &[u8],
        attributes: &Attributes,
    ) -> Result<(), QueueError>;

    /// Receive up to `max_messages` messages, waiting at most `wait_time`.
    ///
    /// Fewer messages than requested, including none, is success. If `ctx`
    /// ends first the messages gathered so far are returned inside
    /// [`QueueError::Cancelled`].
    async fn receive(
        &self,
        ctx: &OperationContext,
        source: &str,
        max_messages: u32,
        wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError>;

    /// Mark a received message as processed
    async fn ack(&self, ctx: &OperationContext, message: &Message) -> Result<(), QueueError>;

    /// Make a received message available for redelivery
    async fn nack(&self, ctx: &OperationContext, message: &Message) -> Result<(), QueueError>;

    /// Best-effort metadata for the queue or topic `name`
    async fn get_info(&self, ctx: &OperationContext, name: &str) -> Result<QueueInfo, QueueError>;

    /// Release every connection, attempting all of them even if some fail.
    ///
    /// Later calls on the instance fail with [`QueueError::Closed`]; closing
    /// twice is a no-op.
    async fn close(&self) -> Result<(), QueueError>;

    /// Backend type
    fn queue_type(&self) -> QueueType;
}

/// Factory for creating queue clients with appropriate backends
pub struct MessageQueueFactory;

impl MessageQueueFactory {
    /// Validate `config` and connect the matching backend.
    ///
    /// Connection happens here, so an unreachable broker fails this call
    /// rather than the first send or receive.
    pub async fn create(
        ctx: &OperationContext,
        config: QueueConfig,
    ) -> Result<Box<dyn MessageQueue>, QueueError> {
        config.validate()?;

        info!(queue_type = %config.queue_type, "Creating message queue client");

        let queue: Box<dyn MessageQueue> = match config.queue_type {
            QueueType::Sqs => Box::new(SqsQueue::connect(ctx, &config).await?),
            QueueType::Kafka => Box::new(KafkaQueue::connect(ctx, &config).await?),
            QueueType::RabbitMq => Box::new(RabbitMqQueue::connect(ctx, &config).await?),
            // validate() already rejected it
            QueueType::Unsupported(queue_type) => {
                return Err(crate::error::ConfigurationError::UnsupportedType { queue_type }.into())
            }
        };

        Ok(queue)
    }
}

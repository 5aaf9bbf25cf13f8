//! # Queue Bridge
//!
//! One message-queue contract over three very different brokers: AWS SQS,
//! Apache Kafka and RabbitMQ.
//!
//! Callers pick a backend with [`QueueConfig`] and get a
//! `Box<dyn MessageQueue>` from [`MessageQueueFactory::create`]. Every backend
//! offers the same six operations: send, receive, ack, nack, get_info and
//! close. Delivery is at-least-once everywhere; how ack and nack map onto each
//! broker is described on [`MessageQueue`].
//!
//! ```no_run
//! use queue_bridge::{Attributes, MessageQueueFactory, OperationContext, QueueConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), queue_bridge::QueueError> {
//! let ctx = OperationContext::background().with_timeout(Duration::from_secs(30));
//! let queue = MessageQueueFactory::create(&ctx, QueueConfig::sqs("us-east-1")).await?;
//!
//! queue.send(&ctx, "orders", br#"{"a":1}"#, &Attributes::new()).await?;
//! for message in queue.receive(&ctx, "orders", 10, Duration::from_secs(5)).await? {
//!     queue.ack(&ctx, &message).await?;
//! }
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for all queue operations
//! - [`message`] - Messages, attributes and queue metadata
//! - [`config`] - Backend selection and validation
//! - [`context`] - Per-call deadline and cancellation
//! - [`client`] - The `MessageQueue` trait and factory
//! - [`providers`] - SQS, Kafka and RabbitMQ backends

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod providers;

// Re-export commonly used types at crate root for convenience
pub use client::{MessageQueue, MessageQueueFactory};
pub use config::{QueueConfig, QueueType};
pub use context::{CancelHandle, OperationContext};
pub use error::{
    AcknowledgmentError, ArgumentError, CloseErrors, ConfigurationError, ContextError,
    QueueError, TransportError,
};
pub use message::{attributes_from_json, Attributes, Message, QueueInfo, Timestamp};
pub use providers::{KafkaQueue, RabbitMqQueue, SqsQueue};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

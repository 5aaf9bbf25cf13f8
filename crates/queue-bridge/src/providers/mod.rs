//! Backend implementations of [`MessageQueue`](crate::MessageQueue).
//!
//! Each backend is independent; the only thing they share is the opaque
//! receipt string on [`Message`](crate::Message).

pub mod kafka;
pub mod rabbitmq;
pub mod sqs;

pub use kafka::KafkaQueue;
pub use rabbitmq::RabbitMqQueue;
pub use sqs::SqsQueue;

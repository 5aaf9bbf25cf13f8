//! RabbitMQ backend over AMQP 0-9-1 using `lapin`.
//!
//! One connection and one channel are opened at construction. Publisher
//! confirms are enabled on the channel, so `send` returns only after the
//! broker has taken responsibility for the message.
//!
//! Each `receive` first checks the source with a passive declare on a
//! throwaway channel, since consuming from a missing queue would close the
//! shared channel. It then starts its own consumer with a prefetch of
//! `max_messages` and pulls deliveries until it has enough, the wait time
//! passes or the context ends. The consumer is then cancelled and deliveries
//! that were already in flight are requeued.
//!
//! The receipt of a message is its delivery tag in decimal. Delivery tags are
//! scoped to the channel, so receipts are only valid on the client that
//! produced them.

use crate::client::MessageQueue;
use crate::config::{QueueConfig, QueueType};
use crate::context::OperationContext;
use crate::error::{
    AcknowledgmentError, ArgumentError, CloseErrors, ConfigurationError, QueueError,
    TransportError,
};
use crate::message::{self, Attributes, Message, QueueInfo, Timestamp};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "rabbitmq_tests.rs"]
mod tests;

/// How long to wait for in-flight deliveries after cancelling a consumer
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Shortest wait a receive uses, so a zero wait still takes deliveries the
/// broker pushes right after the consumer starts
const SHORT_POLL: Duration = Duration::from_millis(250);

/// Grace period for stopping a consumer once the caller's context has ended
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Parse a receipt back into a delivery tag.
///
/// Delivery tags start at 1, so `0` is rejected along with anything that is
/// not a decimal `u64`.
pub(crate) fn parse_delivery_tag(receipt: &str) -> Result<u64, AcknowledgmentError> {
    match receipt.parse::<u64>() {
        Ok(0) => Err(AcknowledgmentError::MalformedReceipt {
            receipt: receipt.to_string(),
            message: "delivery tags start at 1".to_string(),
        }),
        Ok(tag) => Ok(tag),
        Err(e) => Err(AcknowledgmentError::MalformedReceipt {
            receipt: receipt.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Attributes as an AMQP header table of long strings
pub(crate) fn attributes_to_headers(attributes: &Attributes) -> FieldTable {
    let mut headers = FieldTable::default();
    for (key, value) in attributes {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    headers
}

/// String-valued headers of a delivery; every other header type is dropped
pub(crate) fn headers_to_attributes(headers: Option<&FieldTable>) -> Attributes {
    let Some(headers) = headers else {
        return Attributes::new();
    };

    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok(),
                AMQPValue::ShortString(s) => Some(s.as_str()),
                _ => None,
            };
            if text.is_none() {
                debug!(header = %key.as_str(), "Dropping non-string AMQP header");
            }
            text.map(|t| (key.as_str().to_string(), t.to_string()))
        })
        .collect()
}

/// Host part of an AMQP URL, for logs that must not carry credentials
fn display_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "<unparsed>".to_string())
}

fn is_not_found(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

fn fetch_error(source: &str, error: lapin::Error) -> QueueError {
    if is_not_found(&error) {
        TransportError::QueueNotFound {
            queue_name: source.to_string(),
        }
        .into()
    } else {
        TransportError::Fetch {
            source_name: source.to_string(),
            message: error.to_string(),
        }
        .into()
    }
}

fn channel_error(message: &str, error: lapin::Error) -> QueueError {
    TransportError::ConnectionFailed {
        message: format!("{}: {}", message, error),
    }
    .into()
}

/// RabbitMQ implementation of [`MessageQueue`]
pub struct RabbitMqQueue {
    host: String,
    connection: Connection,
    channel: Channel,
    /// Delivery tags handed out and not yet acked or nacked
    outstanding: Mutex<HashSet<u64>>,
    closed: AtomicBool,
}

impl RabbitMqQueue {
    /// Open the connection and channel and enable publisher confirms.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no URL is configured and a transport
    /// error if the broker refuses the connection.
    pub async fn connect(ctx: &OperationContext, config: &QueueConfig) -> Result<Self, QueueError> {
        let url = config
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                field: "url".to_string(),
            })?;
        let host = display_host(url);

        let connection = ctx
            .run(Connection::connect(url, ConnectionProperties::default()))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| match e {
                lapin::Error::ProtocolError(ref amqp)
                    if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)) =>
                {
                    QueueError::from(TransportError::AuthenticationFailed {
                        message: e.to_string(),
                    })
                }
                other => channel_error(&format!("Failed to connect to {}", host), other),
            })?;

        let channel = ctx
            .run(connection.create_channel())
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| channel_error("Failed to create channel", e))?;

        ctx.run(channel.confirm_select(ConfirmSelectOptions::default()))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| channel_error("Failed to enable publisher confirms", e))?;

        info!(host = %host, "RabbitMQ client connected");

        Ok(Self {
            host,
            connection,
            channel,
            outstanding: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Number of deliveries handed out and not yet acked or nacked
    pub async fn outstanding_count(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    /// Remove `receipt` from the outstanding set, returning its delivery tag
    async fn settle(&self, receipt: &str) -> Result<u64, QueueError> {
        let tag = parse_delivery_tag(receipt)?;
        if !self.outstanding.lock().await.remove(&tag) {
            return Err(AcknowledgmentError::UnknownReceipt {
                receipt: receipt.to_string(),
            }
            .into());
        }
        Ok(tag)
    }

    /// Passive declare of `name` on a throwaway channel.
    ///
    /// A failed passive declare closes the channel it ran on, so it never
    /// runs on the shared one.
    async fn inspect_queue(&self, name: &str) -> Result<lapin::Queue, lapin::Error> {
        let channel = self.connection.create_channel().await?;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        if let Err(e) = channel.close(200, "OK").await {
            debug!(error = %e, "Failed to close metadata channel");
        }
        Ok(queue)
    }

    /// Cancel `consumer` and requeue anything it delivered after the loop
    /// stopped reading.
    ///
    /// Runs under `ctx` while it is live, and under a short grace period once
    /// it has ended so the consumer is still released.
    async fn stop_consumer(&self, ctx: &OperationContext, mut consumer: lapin::Consumer) {
        let cleanup = match ctx.err() {
            None => ctx.with_timeout(STOP_TIMEOUT),
            Some(_) => OperationContext::background().with_timeout(STOP_TIMEOUT),
        };

        let tag = consumer.tag();
        let cancel = self
            .channel
            .basic_cancel(tag.as_str(), BasicCancelOptions::default());
        match cleanup.run(cancel).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(consumer = %tag.as_str(), error = %e, "Failed to cancel consumer"),
            Err(reason) => {
                warn!(consumer = %tag.as_str(), reason = %reason, "Gave up cancelling consumer");
                return;
            }
        }

        let mut requeued = 0usize;
        while let Ok(Some(Ok(delivery))) = tokio::time::timeout(DRAIN_TIMEOUT, consumer.next()).await {
            let nack = BasicNackOptions {
                requeue: true,
                ..Default::default()
            };
            match cleanup.run(self.channel.basic_nack(delivery.delivery_tag, nack)).await {
                Ok(Ok(())) => requeued += 1,
                Ok(Err(e)) => warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Failed to requeue late delivery"
                ),
                Err(reason) => {
                    warn!(reason = %reason, "Gave up requeueing late deliveries");
                    break;
                }
            }
        }

        if requeued > 0 {
            debug!(count = requeued, "Requeued late deliveries");
        }
    }
}

#[async_trait]
impl MessageQueue for RabbitMqQueue {
    #[instrument(skip(self, ctx, body, attributes), fields(size = body.len()))]
    async fn send(
        &self,
        ctx: &OperationContext,
        destination: &str,
        body: &[u8],
        attributes: &Attributes,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        message::validate_send(destination, body)?;

        let message_id = uuid::Uuid::new_v4().to_string();
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(message_id.clone().into())
            .with_timestamp(Timestamp::now().as_datetime().timestamp().max(0) as u64)
            .with_headers(attributes_to_headers(attributes));

        let publish = async {
            self.channel
                .basic_publish(
                    "",
                    destination,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    body,
                    properties,
                )
                .await?
                .await
        };

        let confirmation = ctx
            .run(publish)
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| TransportError::Publish {
                destination: destination.to_string(),
                message: e.to_string(),
            })?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => {}
            // Mandatory publish returned unroutable
            Confirmation::Ack(Some(_)) => {
                return Err(TransportError::QueueNotFound {
                    queue_name: destination.to_string(),
                }
                .into())
            }
            Confirmation::Nack(_) => {
                return Err(TransportError::Publish {
                    destination: destination.to_string(),
                    message: "broker rejected the message".to_string(),
                }
                .into())
            }
        }

        debug!(queue = %destination, message_id = %message_id, "Message published");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn receive(
        &self,
        ctx: &OperationContext,
        source: &str,
        max_messages: u32,
        wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        self.ensure_open()?;
        message::validate_receive(source, max_messages)?;

        ctx.run(self.inspect_queue(source))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| fetch_error(source, e))?;

        let prefetch = u16::try_from(max_messages).unwrap_or(u16::MAX);
        ctx.run(self.channel.basic_qos(prefetch, BasicQosOptions::default()))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| channel_error("Failed to set prefetch", e))?;

        let consumer_tag = format!("queue-bridge-{}", uuid::Uuid::new_v4());
        let consume = self.channel.basic_consume(
            source,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        );
        let mut consumer = ctx
            .run(consume)
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| fetch_error(source, e))?;

        let deadline = tokio::time::sleep(wait_time.max(SHORT_POLL));
        tokio::pin!(deadline);

        let mut messages = Vec::new();
        let mut failure = None;
        let mut cancelled = None;

        while messages.len() < max_messages as usize {
            tokio::select! {
                biased;
                reason = ctx.done() => {
                    cancelled = Some(reason);
                    break;
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let tag = delivery.delivery_tag;
                        self.outstanding.lock().await.insert(tag);

                        let id = delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|s| s.as_str().to_string())
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                        let timestamp = (*delivery.properties.timestamp())
                            .and_then(|secs| i64::try_from(secs).ok())
                            .and_then(Timestamp::from_secs)
                            .unwrap_or_else(Timestamp::now);

                        messages.push(Message {
                            id,
                            attributes: headers_to_attributes(delivery.properties.headers().as_ref()),
                            body: bytes::Bytes::from(delivery.data),
                            receipt: tag.to_string(),
                            timestamp,
                        });
                    }
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                },
                // After deliveries, so ones already buffered are taken even
                // with a zero wait.
                _ = &mut deadline => break,
            }
        }

        self.stop_consumer(ctx, consumer).await;

        if let Some(reason) = cancelled {
            return Err(QueueError::Cancelled {
                reason,
                received: messages,
            });
        }
        if let Some(e) = failure {
            if messages.is_empty() {
                return Err(TransportError::Fetch {
                    source_name: source.to_string(),
                    message: e.to_string(),
                }
                .into());
            }
            warn!(queue = %source, error = %e, "Delivery stream failed, returning partial batch");
        }

        debug!(queue = %source, count = messages.len(), "Messages received");
        Ok(messages)
    }

    #[instrument(skip(self, ctx, message), fields(message_id = %message.id))]
    async fn ack(&self, ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.ensure_open()?;
        let receipt = message.require_receipt()?;
        let tag = self.settle(receipt).await?;

        ctx.run(self.channel.basic_ack(tag, BasicAckOptions::default()))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| AcknowledgmentError::Failed {
                operation: "ack".to_string(),
                message: e.to_string(),
            })?;

        debug!(delivery_tag = tag, "Delivery acknowledged");
        Ok(())
    }

    #[instrument(skip(self, ctx, message), fields(message_id = %message.id))]
    async fn nack(&self, ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.ensure_open()?;
        let receipt = message.require_receipt()?;
        let tag = self.settle(receipt).await?;

        let options = BasicNackOptions {
            requeue: true,
            ..Default::default()
        };
        ctx.run(self.channel.basic_nack(tag, options))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| AcknowledgmentError::Failed {
                operation: "nack".to_string(),
                message: e.to_string(),
            })?;

        debug!(delivery_tag = tag, "Delivery requeued");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn get_info(&self, ctx: &OperationContext, name: &str) -> Result<QueueInfo, QueueError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(ArgumentError::required("name").into());
        }

        let queue = ctx
            .run(self.inspect_queue(name))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|e| {
                if is_not_found(&e) {
                    QueueError::from(TransportError::QueueNotFound {
                        queue_name: name.to_string(),
                    })
                } else {
                    QueueError::from(TransportError::Provider {
                        provider: "rabbitmq".to_string(),
                        code: "queue.declare".to_string(),
                        message: e.to_string(),
                    })
                }
            })?;

        let mut info = QueueInfo::new(name);
        info.approximate_count = Some(u64::from(queue.message_count()));
        info.consumer_count = Some(queue.consumer_count());
        Ok(info)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = CloseErrors::new();
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            errors.push("channel", e);
        }
        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            errors.push("connection", e);
        }
        self.outstanding.lock().await.clear();

        info!(host = %self.host, "RabbitMQ client closed");
        errors.into_result()
    }

    fn queue_type(&self) -> QueueType {
        QueueType::RabbitMq
    }
}

//! Apache Kafka backend built on `rdkafka`.
//!
//! The producer is created when the client is constructed and a metadata
//! request confirms the brokers are reachable. The consumer is created on the
//! first `receive` and stays bound to that topic and consumer group for the
//! lifetime of the client.
//!
//! ## Acknowledgment model
//!
//! Kafka acknowledges by committing offsets, and commits are cumulative per
//! partition. Each received record is stored in a pending table under a
//! synthetic receipt:
//!
//! - **Ack** commits `offset + 1` for the record's partition, then forgets it.
//!   Acks may arrive out of order, so a commit that would move a partition's
//!   committed position backwards is skipped
//! - **Nack** forgets the record without committing
//!
//! Nack is local bookkeeping only. A nacked record is redelivered only if no
//! later offset on its partition is committed before the consumer group
//! restarts.

use crate::client::MessageQueue;
use crate::config::{QueueConfig, QueueType};
use crate::context::OperationContext;
use crate::error::{
    AcknowledgmentError, ArgumentError, CloseErrors, ConfigurationError, QueueError,
    TransportError,
};
use crate::message::{self, Attributes, Message, QueueInfo, Timestamp};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message as KafkaMessage;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "kafka_tests.rs"]
mod tests;

/// Consumer group used when neither the config nor the caller names one
pub const DEFAULT_CONSUMER_GROUP: &str = "queue-bridge";

/// Upper bound for metadata, commit and flush calls
const CLIENT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the producer may wait for local queue space
const PRODUCER_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Pending Table
// ============================================================================

/// Location of a received record that has not been acked or nacked yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Received-but-unsettled records keyed by synthetic receipt id.
///
/// Receipt ids are issued from a per-table counter and are never reused.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, PendingRecord>>,
}

impl PendingTable {
    /// Store `record` and return its receipt
    pub async fn insert(&self, record: PendingRecord) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.lock().await.insert(id, record);
        id.to_string()
    }

    /// Find the record for `receipt` without removing it
    pub async fn lookup(&self, receipt: &str) -> Result<(u64, PendingRecord), AcknowledgmentError> {
        let id = parse_receipt(receipt)?;
        self.entries
            .lock()
            .await
            .get(&id)
            .cloned()
            .map(|record| (id, record))
            .ok_or_else(|| AcknowledgmentError::UnknownReceipt {
                receipt: receipt.to_string(),
            })
    }

    /// Forget the record stored under `id`
    pub async fn remove(&self, id: u64) -> Option<PendingRecord> {
        self.entries.lock().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// Highest position this client has committed per partition
#[derive(Debug, Default)]
pub(crate) struct CommittedOffsets {
    positions: HashMap<(String, i32), i64>,
}

impl CommittedOffsets {
    /// Whether committing `next` moves the partition's position forward
    pub fn advances(&self, topic: &str, partition: i32, next: i64) -> bool {
        self.position(topic, partition)
            .map_or(true, |committed| next > committed)
    }

    /// Record a successful commit of `next`
    pub fn record(&mut self, topic: &str, partition: i32, next: i64) {
        let position = self
            .positions
            .entry((topic.to_string(), partition))
            .or_insert(next);
        *position = (*position).max(next);
    }

    pub fn position(&self, topic: &str, partition: i32) -> Option<i64> {
        self.positions.get(&(topic.to_string(), partition)).copied()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }
}

fn parse_receipt(receipt: &str) -> Result<u64, AcknowledgmentError> {
    receipt
        .parse::<u64>()
        .map_err(|e| AcknowledgmentError::MalformedReceipt {
            receipt: receipt.to_string(),
            message: e.to_string(),
        })
}

// ============================================================================
// Record Conversion
// ============================================================================

fn attributes_to_headers(attributes: &Attributes) -> OwnedHeaders {
    attributes
        .iter()
        .fold(OwnedHeaders::new_with_capacity(attributes.len()), |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            })
        })
}

/// Convert a fetched record into a message carrying `receipt`.
///
/// Headers with no value or a non-UTF-8 value are dropped.
pub(crate) fn record_to_message(record: &impl KafkaMessage, receipt: String) -> Message {
    let mut attributes = Attributes::new();
    if let Some(headers) = record.headers() {
        for header in headers.iter() {
            match header.value.map(std::str::from_utf8) {
                Some(Ok(value)) => {
                    attributes.insert(header.key.to_string(), value.to_string());
                }
                _ => debug!(header = %header.key, "Dropping non-string Kafka header"),
            }
        }
    }

    let timestamp = record
        .timestamp()
        .to_millis()
        .and_then(Timestamp::from_millis)
        .unwrap_or_else(Timestamp::now);

    Message {
        id: format!("{}-{}-{}", record.topic(), record.partition(), record.offset()),
        body: bytes::Bytes::copy_from_slice(record.payload().unwrap_or_default()),
        attributes,
        receipt,
        timestamp,
    }
}

// ============================================================================
// Kafka Queue
// ============================================================================

/// Consumer bound to one topic and group
struct Reader {
    topic: String,
    group: String,
    consumer: Arc<StreamConsumer>,
}

/// Apache Kafka implementation of [`MessageQueue`]
pub struct KafkaQueue {
    brokers: String,
    producer: FutureProducer,
    consumer_group: Mutex<String>,
    reader: Mutex<Option<Reader>>,
    pending: PendingTable,
    // Held across each commit so concurrent acks cannot reorder them.
    committed: Mutex<CommittedOffsets>,
    closed: AtomicBool,
}

impl KafkaQueue {
    /// Create the producer and confirm the brokers answer a metadata request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no brokers are configured, and a
    /// transport error if the cluster cannot be reached.
    pub async fn connect(ctx: &OperationContext, config: &QueueConfig) -> Result<Self, QueueError> {
        let queue = Self::build(config)?;

        let producer = queue.producer.clone();
        let timeout = call_timeout(ctx);
        let broker_count = run_blocking(ctx, move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await?
        .map_err(|e| TransportError::ConnectionFailed {
            message: format!("Kafka brokers {} unreachable: {}", queue.brokers, e),
        })?;

        info!(
            brokers = %queue.brokers,
            broker_count,
            "Kafka client connected"
        );
        Ok(queue)
    }

    /// Create the client without contacting the cluster
    fn build(config: &QueueConfig) -> Result<Self, QueueError> {
        let brokers = config
            .brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        if brokers.is_empty() {
            return Err(ConfigurationError::Missing {
                field: "brokers".to_string(),
            }
            .into());
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "30000")
            .set("acks", "all")
            .create()
            .map_err(|e| ConfigurationError::Invalid {
                field: "brokers".to_string(),
                message: format!("Failed to create Kafka producer: {}", e),
            })?;

        let consumer_group = config
            .consumer_group
            .clone()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());

        Ok(Self {
            brokers,
            producer,
            consumer_group: Mutex::new(consumer_group),
            reader: Mutex::new(None),
            pending: PendingTable::default(),
            committed: Mutex::new(CommittedOffsets::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Set the consumer group for the reader created by the first `receive`.
    ///
    /// Fails once a reader exists under a different group.
    pub async fn set_consumer_group(&self, group: impl Into<String>) -> Result<(), QueueError> {
        let group = group.into();
        if group.trim().is_empty() {
            return Err(ArgumentError::required("consumer_group").into());
        }
        if let Some(reader) = self.reader.lock().await.as_ref() {
            if reader.group != group {
                return Err(ArgumentError::InvalidFormat {
                    field: "consumer_group".to_string(),
                    message: format!("reader already joined group '{}'", reader.group),
                }
                .into());
            }
        }
        *self.consumer_group.lock().await = group;
        Ok(())
    }

    /// Consumer group the reader uses or will use
    pub async fn consumer_group(&self) -> String {
        self.consumer_group.lock().await.clone()
    }

    /// Number of received records not yet acked or nacked
    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Consumer for `topic`, creating and subscribing it on first use
    async fn reader_for(&self, topic: &str) -> Result<Arc<StreamConsumer>, QueueError> {
        let mut reader = self.reader.lock().await;
        if let Some(existing) = reader.as_ref() {
            if existing.topic != topic {
                return Err(ArgumentError::ReaderBound {
                    bound: existing.topic.clone(),
                    requested: topic.to_string(),
                }
                .into());
            }
            return Ok(existing.consumer.clone());
        }

        let group = self.consumer_group().await;
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("Failed to create Kafka consumer: {}", e),
            })?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| TransportError::Fetch {
                source_name: topic.to_string(),
                message: format!("Failed to subscribe: {}", e),
            })?;

        info!(topic = %topic, group = %group, "Kafka reader created");

        let consumer = Arc::new(consumer);
        *reader = Some(Reader {
            topic: topic.to_string(),
            group,
            consumer: consumer.clone(),
        });
        Ok(consumer)
    }

    async fn bound_consumer(&self) -> Option<Arc<StreamConsumer>> {
        self.reader.lock().await.as_ref().map(|r| r.consumer.clone())
    }
}

/// Time budget for a blocking client call under `ctx`
fn call_timeout(ctx: &OperationContext) -> Duration {
    ctx.deadline()
        .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
        .map_or(CLIENT_CALL_TIMEOUT, |remaining| remaining.min(CLIENT_CALL_TIMEOUT))
}

/// Run a blocking librdkafka call on the blocking pool, racing `ctx`
async fn run_blocking<T, F>(ctx: &OperationContext, task: F) -> Result<KafkaResult<T>, QueueError>
where
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
    T: Send + 'static,
{
    match ctx.run(tokio::task::spawn_blocking(task)).await {
        Err(reason) => Err(QueueError::cancelled(reason)),
        Ok(Err(join_error)) => Err(TransportError::ConnectionFailed {
            message: format!("Kafka client task failed: {}", join_error),
        }
        .into()),
        Ok(Ok(result)) => Ok(result),
    }
}

fn commit_error(operation: &str, error: KafkaError) -> QueueError {
    AcknowledgmentError::Failed {
        operation: operation.to_string(),
        message: error.to_string(),
    }
    .into()
}

#[async_trait]
impl MessageQueue for KafkaQueue {
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

        let record = FutureRecord::<(), [u8]>::to(destination)
            .payload(body)
            .headers(attributes_to_headers(attributes));

        let (partition, offset) = ctx
            .run(self.producer.send(record, PRODUCER_QUEUE_TIMEOUT))
            .await
            .map_err(QueueError::cancelled)?
            .map_err(|(e, _)| TransportError::Publish {
                destination: destination.to_string(),
                message: e.to_string(),
            })?;

        debug!(topic = %destination, partition, offset, "Record delivered");
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

        let consumer = self.reader_for(source).await?;
        let deadline = tokio::time::Instant::now() + wait_time;
        let mut messages = Vec::new();

        while messages.len() < max_messages as usize {
            let fetched = tokio::select! {
                biased;
                reason = ctx.done() => {
                    return Err(QueueError::Cancelled { reason, received: messages });
                }
                fetched = tokio::time::timeout_at(deadline, consumer.recv()) => {
                    fetched.map(|result| result.map(|record| record.detach()))
                }
            };

            match fetched {
                // Wait time reached
                Err(_) => break,
                Ok(Ok(record)) => {
                    let receipt = self
                        .pending
                        .insert(PendingRecord {
                            topic: record.topic().to_string(),
                            partition: record.partition(),
                            offset: record.offset(),
                        })
                        .await;
                    messages.push(record_to_message(&record, receipt));
                }
                Ok(Err(e)) if messages.is_empty() => {
                    return Err(TransportError::Fetch {
                        source_name: source.to_string(),
                        message: e.to_string(),
                    }
                    .into());
                }
                Ok(Err(e)) => {
                    warn!(topic = %source, error = %e, "Fetch failed, returning partial batch");
                    break;
                }
            }
        }

        debug!(topic = %source, count = messages.len(), "Records received");
        Ok(messages)
    }

    #[instrument(skip(self, ctx, message), fields(message_id = %message.id))]
    async fn ack(&self, ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.ensure_open()?;
        let receipt = message.require_receipt()?;
        let (id, record) = self.pending.lookup(receipt).await?;
        let consumer = self.bound_consumer().await.ok_or_else(|| {
            AcknowledgmentError::UnknownReceipt {
                receipt: receipt.to_string(),
            }
        })?;

        let next = record.offset + 1;
        let mut committed = self.committed.lock().await;
        if !committed.advances(&record.topic, record.partition, next) {
            drop(committed);
            self.pending.remove(id).await;
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Offset already covered by a later commit"
            );
            return Ok(());
        }

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(next))
            .map_err(|e| commit_error("ack", e))?;

        run_blocking(ctx, move || consumer.commit(&offsets, CommitMode::Sync))
            .await?
            .map_err(|e| commit_error("ack", e))?;
        committed.record(&record.topic, record.partition, next);
        drop(committed);

        self.pending.remove(id).await;
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Offset committed"
        );
        Ok(())
    }

    #[instrument(skip(self, _ctx, message), fields(message_id = %message.id))]
    async fn nack(&self, _ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.ensure_open()?;
        let receipt = message.require_receipt()?;
        let (id, record) = self.pending.lookup(receipt).await?;
        self.pending.remove(id).await;

        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Record released without commit"
        );
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn get_info(&self, ctx: &OperationContext, name: &str) -> Result<QueueInfo, QueueError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(ArgumentError::required("name").into());
        }

        let producer = self.producer.clone();
        let topic = name.to_string();
        let timeout = call_timeout(ctx);
        let count = run_blocking(ctx, move || -> KafkaResult<Option<u64>> {
            let client = producer.client();
            let metadata = client.fetch_metadata(Some(&topic), timeout)?;
            let Some(entry) = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty())
            else {
                return Ok(None);
            };

            let mut total = 0u64;
            for partition in entry.partitions() {
                let (low, high) = client.fetch_watermarks(&topic, partition.id(), timeout)?;
                total += (high - low).max(0) as u64;
            }
            Ok(Some(total))
        })
        .await?
        .map_err(|e| TransportError::Provider {
            provider: "kafka".to_string(),
            code: "metadata".to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TransportError::QueueNotFound {
            queue_name: name.to_string(),
        })?;

        let mut info = QueueInfo::new(name);
        info.approximate_count = Some(count);
        Ok(info)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = CloseErrors::new();

        if let Some(reader) = self.reader.lock().await.take() {
            reader.consumer.unsubscribe();
        }

        let producer = self.producer.clone();
        match tokio::task::spawn_blocking(move || producer.flush(CLIENT_CALL_TIMEOUT)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push("producer", e),
            Err(e) => errors.push("producer", e),
        }

        let abandoned = self.pending.len().await;
        if abandoned > 0 {
            warn!(count = abandoned, "Closing with unsettled Kafka records");
        }
        self.pending.clear().await;
        self.committed.lock().await.clear();

        info!(brokers = %self.brokers, "Kafka client closed");
        errors.into_result()
    }

    fn queue_type(&self) -> QueueType {
        QueueType::Kafka
    }
}

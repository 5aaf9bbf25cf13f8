//! Tests for the queue factory.

use super::*;
use crate::error::ConfigurationError;

// ============================================================================
// Factory Validation Tests
// ============================================================================

/// Each backend type without its required field fails before any I/O.
#[tokio::test]
async fn test_factory_rejects_missing_required_fields() {
    let cases = [
        (QueueType::Sqs, "region"),
        (QueueType::Kafka, "brokers"),
        (QueueType::RabbitMq, "url"),
    ];

    for (queue_type, field) in cases {
        let result =
            MessageQueueFactory::create(&OperationContext::background(), QueueConfig::new(queue_type.clone()))
                .await;

        match result {
            Err(QueueError::Configuration(ConfigurationError::Missing { field: missing })) => {
                assert_eq!(missing, field, "wrong field reported for {queue_type}");
            }
            Err(other) => panic!("Expected missing {field} for {queue_type}, got {other:?}"),
            Ok(_) => panic!("Expected missing {field} for {queue_type}, got a client"),
        }
    }
}

#[tokio::test]
async fn test_factory_rejects_unsupported_type() {
    let config = QueueConfig::new(QueueType::Unsupported("pubsub".to_string()));

    let result = MessageQueueFactory::create(&OperationContext::background(), config).await;

    match result {
        Err(error @ QueueError::Configuration(ConfigurationError::UnsupportedType { .. })) => {
            assert!(error.to_string().contains("Unsupported queue type: 'pubsub'"));
            assert!(!error.is_transient());
        }
        Err(other) => panic!("Expected unsupported type, got {other:?}"),
        Ok(_) => panic!("Expected unsupported type, got a client"),
    }
}

/// SQS construction needs no network, so the factory path runs end to end.
#[tokio::test]
async fn test_factory_creates_sqs_client() {
    let mut config = QueueConfig::sqs("eu-west-1");
    config.endpoint = Some("http://127.0.0.1:4566".to_string());
    config.access_key_id = Some("test".to_string());
    config.secret_access_key = Some("test".to_string());

    let queue = MessageQueueFactory::create(&OperationContext::background(), config)
        .await
        .expect("SQS client should construct without I/O");

    assert_eq!(queue.queue_type(), QueueType::Sqs);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_factory_honours_cancelled_context_for_brokers() {
    let (ctx, cancel) = OperationContext::cancellable();
    cancel.cancel();

    let result =
        MessageQueueFactory::create(&ctx, QueueConfig::rabbitmq("amqp://127.0.0.1:1/%2f")).await;

    assert!(matches!(result, Err(QueueError::Cancelled { .. })));
}

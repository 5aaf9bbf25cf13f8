//! Tests for the queue-bridge-cli library module.

use super::*;
use async_trait::async_trait;
use queue_bridge::{Attributes, Message, QueueInfo, QueueType, Timestamp};
use std::io::Write as _;
use std::sync::Mutex;

// ============================================================================
// Argument Parsing
// ============================================================================

mod parsing {
    use super::*;

    #[test]
    fn test_send_with_attributes() {
        let cli = Cli::try_parse_from([
            "queue-bridge",
            "send",
            "orders",
            "{\"a\":1}",
            "--attributes",
            "{\"p\":\"x\"}",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Commands::Send {
                destination: "orders".to_string(),
                body: "{\"a\":1}".to_string(),
                attributes: Some("{\"p\":\"x\"}".to_string()),
            }
        );
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.timeout, 60);
    }

    #[test]
    fn test_receive_defaults() {
        let cli = Cli::try_parse_from(["queue-bridge", "receive", "orders"]).unwrap();
        match cli.command {
            Commands::Receive {
                max_messages,
                wait_seconds,
                ack,
                nack,
                ..
            } => {
                assert_eq!(max_messages, 10);
                assert_eq!(wait_seconds, 5);
                assert!(!ack);
                assert!(!nack);
            }
            other => panic!("Expected Receive command, got {other:?}"),
        }
    }

    #[test]
    fn test_ack_and_nack_conflict() {
        let result = Cli::try_parse_from(["queue-bridge", "receive", "orders", "--ack", "--nack"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_settle_from_flags() {
        assert_eq!(Settle::from_flags(true, false), Settle::Ack);
        assert_eq!(Settle::from_flags(false, true), Settle::Nack);
        assert_eq!(Settle::from_flags(false, false), Settle::Keep);
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

mod configuration {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_environment_only() {
        let config = build_configuration(
            None,
            env(&[
                ("QUEUE_BRIDGE__TYPE", "kafka"),
                ("QUEUE_BRIDGE__BROKERS", "b1:9092,b2:9092"),
                ("QUEUE_BRIDGE__CONSUMER_GROUP", "billing"),
            ]),
        )
        .unwrap();

        assert_eq!(config.queue_type, QueueType::Kafka);
        assert_eq!(config.brokers, vec!["b1:9092", "b2:9092"]);
        assert_eq!(config.consumer_group.as_deref(), Some("billing"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "type = \"sqs\"\nregion = \"us-east-1\"\ntimeout = 30").unwrap();

        let config = build_configuration(
            Some(file.path()),
            env(&[("QUEUE_BRIDGE__REGION", "eu-west-1")]),
        )
        .unwrap();

        assert_eq!(config.queue_type, QueueType::Sqs);
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "type: rabbitmq\nurl: amqp://localhost:5672/%2f").unwrap();

        let config = build_configuration(Some(file.path()), env(&[])).unwrap();
        assert_eq!(config.queue_type, QueueType::RabbitMq);
        assert_eq!(config.url.as_deref(), Some("amqp://localhost:5672/%2f"));
    }

    #[test]
    fn test_missing_required_field_fails_validation() {
        let result = build_configuration(None, env(&[("QUEUE_BRIDGE__TYPE", "sqs")]));
        assert!(matches!(
            result,
            Err(ConfigError::Validation(ConfigurationError::Missing { ref field })) if field == "region"
        ));
    }

    #[test]
    fn test_unsupported_type_fails_validation() {
        let result = build_configuration(None, env(&[("QUEUE_BRIDGE__TYPE", "nats")]));
        assert!(matches!(
            result,
            Err(ConfigError::Validation(ConfigurationError::UnsupportedType { .. }))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let result = build_configuration(Some(&path), env(&[]));
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_exit_codes() {
        let config_error = CliError::from(ConfigError::Validation(ConfigurationError::Missing {
            field: "url".to_string(),
        }));
        assert_eq!(config_error.exit_code(), 1);
        assert_eq!(CliError::from(QueueError::Closed).exit_code(), 2);
        assert_eq!(
            CliError::InvalidArgument {
                arg: "attributes".to_string(),
                message: "bad".to_string(),
            }
            .exit_code(),
            4
        );
    }
}

// ============================================================================
// Command Execution
// ============================================================================

/// In-process queue that records what the CLI asked of it
#[derive(Default)]
struct RecordingQueue {
    inbox: Vec<Message>,
    sent: Mutex<Vec<(String, Vec<u8>, Attributes)>>,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageQueue for RecordingQueue {
    async fn send(
        &self,
        _ctx: &OperationContext,
        destination: &str,
        body: &[u8],
        attributes: &Attributes,
    ) -> Result<(), QueueError> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), body.to_vec(), attributes.clone()));
        Ok(())
    }

    async fn receive(
        &self,
        _ctx: &OperationContext,
        _source: &str,
        max_messages: u32,
        _wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        Ok(self
            .inbox
            .iter()
            .take(max_messages as usize)
            .cloned()
            .collect())
    }

    async fn ack(&self, _ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.acked.lock().unwrap().push(message.receipt.clone());
        Ok(())
    }

    async fn nack(&self, _ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.nacked.lock().unwrap().push(message.receipt.clone());
        Ok(())
    }

    async fn get_info(&self, _ctx: &OperationContext, name: &str) -> Result<QueueInfo, QueueError> {
        let mut info = QueueInfo::new(name);
        info.approximate_count = Some(self.inbox.len() as u64);
        Ok(info)
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn queue_type(&self) -> QueueType {
        QueueType::Unsupported("recording".to_string())
    }
}

fn inbox_message(receipt: &str, body: &str) -> Message {
    Message {
        id: format!("id-{receipt}"),
        body: bytes::Bytes::from(body.to_string()),
        attributes: Attributes::from([("p".to_string(), "x".to_string())]),
        receipt: receipt.to_string(),
        timestamp: Timestamp::now(),
    }
}

mod commands {
    use super::*;

    #[tokio::test]
    async fn test_send_parses_attributes() {
        let queue = RecordingQueue::default();
        let command = Commands::Send {
            destination: "orders".to_string(),
            body: "{\"a\":1}".to_string(),
            attributes: Some("{\"p\":\"x\"}".to_string()),
        };

        let mut out = Vec::new();
        run_command(&queue, &OperationContext::background(), &command, &mut out)
            .await
            .unwrap();

        let sent = queue.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "orders");
        assert_eq!(sent[0].1, b"{\"a\":1}");
        assert_eq!(sent[0].2["p"], "x");
    }

    #[tokio::test]
    async fn test_send_rejects_non_string_attributes() {
        let queue = RecordingQueue::default();
        let command = Commands::Send {
            destination: "orders".to_string(),
            body: "x".to_string(),
            attributes: Some("{\"count\":3}".to_string()),
        };

        let mut out = Vec::new();
        let result = run_command(&queue, &OperationContext::background(), &command, &mut out).await;

        assert!(matches!(result, Err(CliError::InvalidArgument { ref arg, .. }) if arg == "attributes"));
        assert!(queue.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_prints_json_lines_and_acks() {
        let queue = RecordingQueue {
            inbox: vec![inbox_message("r-1", "first"), inbox_message("r-2", "second")],
            ..Default::default()
        };
        let command = Commands::Receive {
            source: "orders".to_string(),
            max_messages: 10,
            wait_seconds: 0,
            ack: true,
            nack: false,
        };

        let mut out = Vec::new();
        run_command(&queue, &OperationContext::background(), &command, &mut out)
            .await
            .unwrap();

        let output = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["body"], "first");
        assert_eq!(lines[0]["receipt"], "r-1");
        assert_eq!(lines[1]["attributes"]["p"], "x");

        assert_eq!(*queue.acked.lock().unwrap(), vec!["r-1", "r-2"]);
        assert!(queue.nacked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_with_nack() {
        let queue = RecordingQueue {
            inbox: vec![inbox_message("r-1", "first")],
            ..Default::default()
        };
        let command = Commands::Receive {
            source: "orders".to_string(),
            max_messages: 1,
            wait_seconds: 0,
            ack: false,
            nack: true,
        };

        let mut out = Vec::new();
        run_command(&queue, &OperationContext::background(), &command, &mut out)
            .await
            .unwrap();

        assert_eq!(*queue.nacked.lock().unwrap(), vec!["r-1"]);
        assert!(queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_info_prints_json() {
        let queue = RecordingQueue {
            inbox: vec![inbox_message("r-1", "first")],
            ..Default::default()
        };

        let mut out = Vec::new();
        run_command(
            &queue,
            &OperationContext::background(),
            &Commands::Info {
                name: "orders".to_string(),
            },
            &mut out,
        )
        .await
        .unwrap();

        let info: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(info["name"], "orders");
        assert_eq!(info["approximate_count"], 1);
        assert!(info["created_at"].is_null());
    }

    #[tokio::test]
    async fn test_validate_does_not_connect() {
        let cli = Cli::try_parse_from(["queue-bridge", "validate"]).unwrap();
        // An unreachable broker would fail if the command tried to connect.
        let config = QueueConfig::rabbitmq("amqp://127.0.0.1:1/%2f");

        let mut out = Vec::new();
        execute(&cli, config, &mut out).await.unwrap();

        let output = String::from_utf8(out).unwrap();
        assert!(output.contains("Configuration is valid (type: rabbitmq)"));
    }
}

//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(QueueError::Transport(TransportError::ConnectionFailed {
        message: "network error".to_string(),
    })
    .is_transient());

    assert!(!QueueError::Transport(TransportError::QueueNotFound {
        queue_name: "test".to_string(),
    })
    .is_transient());

    assert!(!QueueError::Configuration(ConfigurationError::Missing {
        field: "region".to_string(),
    })
    .is_transient());

    assert!(!QueueError::Acknowledgment(AcknowledgmentError::MissingReceipt).is_transient());

    assert!(QueueError::Acknowledgment(AcknowledgmentError::Failed {
        operation: "ack".to_string(),
        message: "channel closed".to_string(),
    })
    .is_transient());

    assert!(!QueueError::Closed.is_transient());
}

#[test]
fn test_cancelled_error_reports_partial_messages() {
    let error = QueueError::cancelled(ContextError::DeadlineExceeded);
    assert!(error.partial_messages().is_empty());
    assert_eq!(
        error.to_string(),
        "Operation deadline exceeded after receiving 0 message(s)"
    );

    let not_cancelled = QueueError::Closed;
    assert!(not_cancelled.partial_messages().is_empty());
}

#[test]
fn test_unsupported_type_message() {
    let error = ConfigurationError::UnsupportedType {
        queue_type: "nats".to_string(),
    };
    assert_eq!(error.to_string(), "Unsupported queue type: 'nats'");
}

mod close_errors {
    use super::*;

    #[test]
    fn test_empty_collector_is_ok() {
        assert!(CloseErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_collector_keeps_every_failure() {
        let mut errors = CloseErrors::new();
        errors.push("channel", "already closed");
        errors.push("connection", "broken pipe");

        let error = errors.into_result().unwrap_err();
        match &error {
            QueueError::Close(inner) => {
                assert_eq!(inner.errors().len(), 2);
                assert_eq!(inner.errors()[0].resource, "channel");
                assert_eq!(inner.errors()[1].resource, "connection");
            }
            other => panic!("Expected close error, got {other:?}"),
        }

        assert_eq!(
            error.to_string(),
            "Close failed for 2 resource(s): channel: already closed; connection: broken pipe"
        );
    }
}

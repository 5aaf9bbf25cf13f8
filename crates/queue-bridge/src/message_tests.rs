//! Tests for message types.

use super::*;
use serde_json::json;

fn create_test_message(receipt: &str) -> Message {
    Message {
        id: "msg-1".to_string(),
        body: Bytes::from_static(b"{\"a\":1}"),
        attributes: Attributes::from([("p".to_string(), "x".to_string())]),
        receipt: receipt.to_string(),
        timestamp: Timestamp::now(),
    }
}

mod receipt {
    use super::*;

    #[test]
    fn test_empty_receipt_is_rejected() {
        let message = create_test_message("");
        assert!(matches!(
            message.require_receipt(),
            Err(AcknowledgmentError::MissingReceipt)
        ));
    }

    #[test]
    fn test_receipt_is_returned() {
        let message = create_test_message("abc");
        assert_eq!(message.require_receipt().unwrap(), "abc");
    }
}

mod attributes {
    use super::*;

    #[test]
    fn test_string_attributes_are_accepted() {
        let attributes = attributes_from_json(&json!({"p": "x", "q": "y"})).unwrap();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes["p"], "x");
    }

    #[test]
    fn test_null_means_no_attributes() {
        assert!(attributes_from_json(&serde_json::Value::Null)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_number_attribute_is_rejected() {
        let result = attributes_from_json(&json!({"p": "x", "count": 3}));
        match result {
            Err(ArgumentError::NonStringAttribute { key, found }) => {
                assert_eq!(key, "count");
                assert_eq!(found, "number");
            }
            other => panic!("Expected non-string attribute error, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_attribute_is_rejected() {
        let result = attributes_from_json(&json!({"nested": {"a": "b"}}));
        assert!(matches!(
            result,
            Err(ArgumentError::NonStringAttribute { .. })
        ));
    }

    #[test]
    fn test_non_object_is_rejected() {
        let result = attributes_from_json(&json!(["a", "b"]));
        assert!(matches!(result, Err(ArgumentError::InvalidFormat { .. })));
    }
}

mod validation {
    use super::*;

    #[test]
    fn test_send_requires_destination_and_body() {
        assert!(validate_send("q1", b"x").is_ok());
        assert!(matches!(
            validate_send("", b"x"),
            Err(ArgumentError::Required { field }) if field == "destination"
        ));
        assert!(matches!(
            validate_send("q1", b""),
            Err(ArgumentError::Required { field }) if field == "body"
        ));
    }

    #[test]
    fn test_receive_requires_source_and_positive_count() {
        assert!(validate_receive("q1", 1).is_ok());
        assert!(matches!(
            validate_receive("", 1),
            Err(ArgumentError::Required { .. })
        ));
        assert!(matches!(
            validate_receive("q1", 0),
            Err(ArgumentError::OutOfRange { .. })
        ));
    }
}

mod serialization {
    use super::*;

    #[test]
    fn test_body_serializes_as_base64() {
        let message = create_test_message("r-1");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["body"], "eyJhIjoxfQ==");
        assert_eq!(value["attributes"]["p"], "x");
        assert_eq!(value["receipt"], "r-1");
    }

    #[test]
    fn test_body_str_for_text_and_binary() {
        let mut message = create_test_message("r-1");
        assert_eq!(message.body_str(), Some("{\"a\":1}"));

        message.body = Bytes::from_static(&[0xff, 0xfe]);
        assert_eq!(message.body_str(), None);
    }
}

#[test]
fn test_timestamp_from_epoch_values() {
    let from_millis = Timestamp::from_millis(1_700_000_000_123).unwrap();
    assert_eq!(from_millis.as_datetime().timestamp_millis(), 1_700_000_000_123);

    let from_secs = Timestamp::from_secs(1_700_000_000).unwrap();
    assert_eq!(from_secs.as_datetime().timestamp(), 1_700_000_000);
}

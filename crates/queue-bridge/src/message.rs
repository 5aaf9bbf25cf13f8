//! Backend-agnostic message and queue metadata types.

use crate::error::{AcknowledgmentError, ArgumentError};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// String-only message attributes.
///
/// Every backend carries attributes as strings on the wire (SQS string
/// attributes, Kafka byte headers, AMQP long-string headers), so the contract
/// is string-only and nothing is coerced.
pub type Attributes = HashMap<String, String>;

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from milliseconds since the Unix epoch
    pub fn from_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    /// Create timestamp from seconds since the Unix epoch
    pub fn from_secs(secs: i64) -> Option<Self> {
        Utc.timestamp_opt(secs, 0).single().map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

/// A message delivered by [`MessageQueue::receive`](crate::MessageQueue::receive).
///
/// `receipt` identifies this particular delivery and is what `ack`/`nack`
/// operate on. Its format is backend specific and must be treated as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub attributes: Attributes,
    pub receipt: String,
    pub timestamp: Timestamp,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Body as UTF-8 text, if it is valid UTF-8
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Receipt of this delivery, rejecting messages that never came from a receive
    pub fn require_receipt(&self) -> Result<&str, AcknowledgmentError> {
        if self.receipt.is_empty() {
            Err(AcknowledgmentError::MissingReceipt)
        } else {
            Ok(&self.receipt)
        }
    }
}

/// Best-effort queue metadata.
///
/// Fields a backend cannot report are `None` rather than a made-up value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub approximate_count: Option<u64>,
    pub consumer_count: Option<u32>,
    pub created_at: Option<Timestamp>,
}

impl QueueInfo {
    /// Create info with only the name known
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            approximate_count: None,
            consumer_count: None,
            created_at: None,
        }
    }
}

/// Convert loosely typed attributes into the string-only contract.
///
/// `null` means "no attributes". Any non-string value is rejected rather than
/// stringified, so a caller never sees a number come back as text.
pub fn attributes_from_json(value: &serde_json::Value) -> Result<Attributes, ArgumentError> {
    let object = match value {
        serde_json::Value::Null => return Ok(Attributes::new()),
        serde_json::Value::Object(map) => map,
        other => {
            return Err(ArgumentError::InvalidFormat {
                field: "attributes".to_string(),
                message: format!("expected an object, got {}", json_type_name(other)),
            })
        }
    };

    object
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => Ok((key.clone(), s.clone())),
            other => Err(ArgumentError::NonStringAttribute {
                key: key.clone(),
                found: json_type_name(other).to_string(),
            }),
        })
        .collect()
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Shared argument checks for `send`
pub(crate) fn validate_send(destination: &str, body: &[u8]) -> Result<(), ArgumentError> {
    if destination.is_empty() {
        return Err(ArgumentError::required("destination"));
    }
    if body.is_empty() {
        return Err(ArgumentError::required("body"));
    }
    Ok(())
}

/// Shared argument checks for `receive`
pub(crate) fn validate_receive(source: &str, max_messages: u32) -> Result<(), ArgumentError> {
    if source.is_empty() {
        return Err(ArgumentError::required("source"));
    }
    if max_messages == 0 {
        return Err(ArgumentError::OutOfRange {
            field: "max_messages".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

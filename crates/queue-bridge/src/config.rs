//! Queue configuration and backend selection.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Enumeration of supported queue backends.
///
/// Unknown names are kept as [`QueueType::Unsupported`] so that a config file
/// naming a backend this crate does not know still deserializes and fails
/// in [`QueueConfig::validate`] with a precise error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QueueType {
    /// Amazon SQS (receipt handle + visibility timeout)
    Sqs,
    /// Apache Kafka (partition offsets + consumer group commits)
    Kafka,
    /// RabbitMQ over AMQP 0-9-1 (delivery tags)
    RabbitMq,
    Unsupported(String),
}

impl QueueType {
    /// Canonical configuration name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sqs => "sqs",
            Self::Kafka => "kafka",
            Self::RabbitMq => "rabbitmq",
            Self::Unsupported(name) => name,
        }
    }

    /// Hard per-call receive batch limit, if the backend has one
    pub fn max_receive_batch(&self) -> Option<u32> {
        match self {
            Self::Sqs => Some(10),
            _ => None,
        }
    }

    /// Hard per-call receive wait limit, if the backend has one
    pub fn max_wait_time(&self) -> Option<Duration> {
        match self {
            Self::Sqs => Some(Duration::from_secs(20)),
            _ => None,
        }
    }
}

impl From<String> for QueueType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "sqs" => Self::Sqs,
            "kafka" => Self::Kafka,
            "rabbitmq" => Self::RabbitMq,
            _ => Self::Unsupported(value),
        }
    }
}

impl From<QueueType> for String {
    fn from(value: QueueType) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for QueueType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one queue backend instance.
///
/// `region`, `brokers` and `url` are the per-type required fields. The
/// remaining backend fields are optional refinements. `max_retries` and
/// `timeout` are reserved for a future retry policy and are not read by any
/// backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(rename = "type")]
    pub queue_type: QueueType,

    /// SQS region, e.g. `us-east-1`
    #[serde(default)]
    pub region: Option<String>,

    /// Kafka bootstrap brokers (`host:port`)
    #[serde(default)]
    pub brokers: Vec<String>,

    /// AMQP connection URL
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub max_retries: u32,

    /// Timeout in whole seconds
    #[serde(default, with = "optional_seconds")]
    pub timeout: Option<Duration>,

    /// SQS endpoint override (LocalStack, VPC endpoints)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub session_token: Option<String>,

    /// Kafka consumer group used by the lazily created reader
    #[serde(default)]
    pub consumer_group: Option<String>,
}

mod optional_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

impl QueueConfig {
    /// Empty configuration for `queue_type`
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            region: None,
            brokers: Vec::new(),
            url: None,
            max_retries: 0,
            timeout: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            consumer_group: None,
        }
    }

    /// SQS configuration for `region`
    pub fn sqs(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..Self::new(QueueType::Sqs)
        }
    }

    /// Kafka configuration for `brokers`
    pub fn kafka<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            ..Self::new(QueueType::Kafka)
        }
    }

    /// RabbitMQ configuration for `url`
    pub fn rabbitmq(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new(QueueType::RabbitMq)
        }
    }

    /// Check that the field required by `queue_type` is present
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match &self.queue_type {
            QueueType::Sqs => {
                if is_blank(self.region.as_deref()) {
                    return Err(missing("region"));
                }
            }
            QueueType::Kafka => {
                if self.brokers.iter().all(|b| b.trim().is_empty()) {
                    return Err(missing("brokers"));
                }
            }
            QueueType::RabbitMq => {
                if is_blank(self.url.as_deref()) {
                    return Err(missing("url"));
                }
            }
            QueueType::Unsupported(name) => {
                return Err(ConfigurationError::UnsupportedType {
                    queue_type: name.clone(),
                })
            }
        }
        Ok(())
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

fn missing(field: &str) -> ConfigurationError {
    ConfigurationError::Missing {
        field: field.to_string(),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

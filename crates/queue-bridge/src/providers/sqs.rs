//! AWS SQS backend using the SQS JSON protocol over HTTPS.
//!
//! Requests are plain `reqwest` calls signed with AWS Signature Version 4,
//! which keeps the backend testable against a mock HTTP server.
//!
//! ## Acknowledgment model
//!
//! - **Receive** hides each returned message for the queue's visibility timeout
//! - **Ack** deletes the message by receipt handle
//! - **Nack** sets the visibility timeout to zero so the message is immediately
//!   receivable again
//!
//! SQS receipt handles do not say which queue they belong to. The client
//! remembers the queue each received receipt came from and acks against that
//! queue. Receipts it did not hand out use the queue URL registered with
//! [`SqsQueue::set_queue_url`]; the first `receive` registers its source when
//! nothing is registered yet.
//!
//! ## Limits
//!
//! - At most 10 messages per receive; larger requests are clamped
//! - At most 20 seconds of long polling; longer waits are clamped
//! - Bodies are SQS message text: valid UTF-8, at most 256 KiB
//! - Only `String` typed message attributes are returned

use crate::client::MessageQueue;
use crate::config::{QueueConfig, QueueType};
use crate::context::OperationContext;
use crate::error::{
    AcknowledgmentError, ArgumentError, ConfigurationError, QueueError, TransportError,
};
use crate::message::{self, Attributes, Message, QueueInfo, Timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

/// Largest batch a single ReceiveMessage call returns
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Longest long-poll a single ReceiveMessage call allows
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Largest message body SQS accepts
pub const MAX_BODY_SIZE: usize = 256 * 1024;

const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_PREFIX: &str = "AmazonSQS";

// ============================================================================
// Error Types
// ============================================================================

/// AWS SQS specific errors
#[derive(Debug, thiserror::Error)]
pub enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("SQS service error: {code} - {message}")]
    ServiceError { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SqsError {
    /// Map a send/receive/metadata failure to QueueError
    pub fn to_queue_error(self) -> QueueError {
        let transport = match self {
            Self::Authentication(message) => TransportError::AuthenticationFailed { message },
            Self::NetworkError(message) => TransportError::ConnectionFailed { message },
            Self::ServiceError { code, message } => TransportError::Provider {
                provider: "sqs".to_string(),
                code,
                message,
            },
            Self::QueueNotFound(queue_name) => TransportError::QueueNotFound { queue_name },
            Self::InvalidReceipt(message) => TransportError::Provider {
                provider: "sqs".to_string(),
                code: "ReceiptHandleIsInvalid".to_string(),
                message,
            },
            Self::SerializationError(message) => TransportError::MalformedResponse { message },
        };
        QueueError::Transport(transport)
    }

    /// Map an ack/nack failure to QueueError
    pub fn to_acknowledgment_error(self, operation: &str, receipt: &str) -> QueueError {
        let error = match self {
            Self::InvalidReceipt(message) => AcknowledgmentError::MalformedReceipt {
                receipt: receipt.to_string(),
                message,
            },
            other => AcknowledgmentError::Failed {
                operation: operation.to_string(),
                message: other.to_string(),
            },
        };
        QueueError::Acknowledgment(error)
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Resolved AWS credentials
#[derive(Clone)]
struct AwsCredentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    /// Credentials from the config, falling back to the standard AWS
    /// environment variables.
    fn resolve(config: &QueueConfig) -> Result<Self, ConfigurationError> {
        let from_env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let access_key = config
            .access_key_id
            .clone()
            .or_else(|| from_env("AWS_ACCESS_KEY_ID"))
            .ok_or_else(|| ConfigurationError::Missing {
                field: "access_key_id".to_string(),
            })?;
        let secret_key = config
            .secret_access_key
            .clone()
            .or_else(|| from_env("AWS_SECRET_ACCESS_KEY"))
            .ok_or_else(|| ConfigurationError::Missing {
                field: "secret_access_key".to_string(),
            })?;
        let session_token = config
            .session_token
            .clone()
            .or_else(|| from_env("AWS_SESSION_TOKEN"));

        Ok(Self {
            access_key,
            secret_key,
            session_token,
        })
    }
}

/// AWS Signature Version 4 signer for request authentication
///
/// Implements the AWS Signature V4 signing process:
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
///
/// ## References
///
/// - [AWS Signature V4](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)
#[derive(Clone)]
struct AwsV4Signer {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(credentials: AwsCredentials, region: String) -> Self {
        Self {
            credentials,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Sign a request with an empty query string.
    ///
    /// Returns the headers to add: `Authorization`, `x-amz-date`, `host` and,
    /// for temporary credentials, `x-amz-security-token`.
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical headers (must be sorted)
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, "", canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.credentials.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization_header),
            ("x-amz-date".to_string(), amz_date),
            ("host".to_string(), host.to_string()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers
    }

    /// Calculate AWS Signature V4 signature
    ///
    /// Uses 4-level HMAC-SHA256 chain to derive signing key:
    /// 1. kSecret = "AWS4" + secret_key
    /// 2. kDate = HMAC(kSecret, date)
    /// 3. kRegion = HMAC(kDate, region)
    /// 4. kService = HMAC(kRegion, service)
    /// 5. kSigning = HMAC(kService, "aws4_request")
    /// 6. signature = HMAC(kSigning, string_to_sign)
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.credentials.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlResponse {
    queue_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageResponse {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    messages: Vec<SqsMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SqsMessage {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    receipt_handle: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    message_attributes: HashMap<String, SqsAttributeValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SqsAttributeValue {
    data_type: String,
    #[serde(default)]
    string_value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueAttributesResponse {
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct EmptyResponse {}

impl SqsMessage {
    /// Convert to the canonical message; `None` when SQS omitted the receipt
    fn into_message(self) -> Option<Message> {
        let receipt = self.receipt_handle.filter(|r| !r.is_empty())?;

        let attributes: Attributes = self
            .message_attributes
            .into_iter()
            .filter_map(|(key, value)| {
                if value.data_type.starts_with("String") {
                    value.string_value.map(|v| (key, v))
                } else {
                    debug!(attribute = %key, data_type = %value.data_type, "Dropping non-string message attribute");
                    None
                }
            })
            .collect();

        let timestamp = self
            .attributes
            .get("SentTimestamp")
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(Timestamp::from_millis)
            .unwrap_or_else(Timestamp::now);

        Some(Message {
            id: self.message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            body: bytes::Bytes::from(self.body),
            attributes,
            receipt,
            timestamp,
        })
    }
}

// ============================================================================
// AWS SQS Queue
// ============================================================================

/// AWS SQS implementation of [`MessageQueue`]
///
/// ## Thread Safety
///
/// The queue is thread-safe and can be shared across async tasks using `Arc`.
/// The queue URL cache, the receipt origins and the registered
/// acknowledgment queue are protected by `RwLock`.
pub struct SqsQueue {
    http_client: HttpClient,
    signer: AwsV4Signer,
    endpoint: String,
    host: String,
    queue_url_cache: RwLock<HashMap<String, String>>,
    ack_queue_url: RwLock<Option<String>>,
    /// Receipt handle to the URL of the queue it was received from
    receipt_queues: RwLock<HashMap<String, String>>,
    closed: AtomicBool,
}

impl SqsQueue {
    /// Create a new SQS client.
    ///
    /// SQS is connectionless HTTP, so construction resolves credentials and
    /// the endpoint but sends no request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the region or credentials are missing
    /// or the endpoint is not a valid URL.
    pub async fn connect(
        _ctx: &OperationContext,
        config: &QueueConfig,
    ) -> Result<Self, QueueError> {
        let region = config
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                field: "region".to_string(),
            })?;

        let credentials = AwsCredentials::resolve(config)?;

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", region));
        let parsed = url::Url::parse(&endpoint).map_err(|e| ConfigurationError::Invalid {
            field: "endpoint".to_string(),
            message: e.to_string(),
        })?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConfigurationError::Invalid {
                    field: "endpoint".to_string(),
                    message: "endpoint has no host".to_string(),
                }
                .into())
            }
        };

        // Long polls last up to 20 seconds; leave headroom on top.
        let http_client = HttpClient::builder()
            .timeout(MAX_WAIT_TIME + Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        info!(region = %region, endpoint = %endpoint, "SQS client ready");

        Ok(Self {
            http_client,
            signer: AwsV4Signer::new(credentials, region),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            host,
            queue_url_cache: RwLock::new(HashMap::new()),
            ack_queue_url: RwLock::new(None),
            receipt_queues: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Register the queue URL that `ack` and `nack` act on
    pub async fn set_queue_url(&self, queue_url: impl Into<String>) {
        *self.ack_queue_url.write().await = Some(queue_url.into());
    }

    /// Queue URL currently registered for acknowledgments
    pub async fn queue_url(&self) -> Option<String> {
        self.ack_queue_url.read().await.clone()
    }

    /// Queue an acknowledgment for `receipt` goes to
    async fn ack_target(&self, receipt: &str) -> Result<String, QueueError> {
        if let Some(queue_url) = self.receipt_queues.read().await.get(receipt) {
            return Ok(queue_url.clone());
        }
        self.queue_url()
            .await
            .ok_or_else(|| AcknowledgmentError::QueueUrlNotSet.into())
    }

    /// Number of received receipts not yet acked or nacked
    pub async fn outstanding_receipts(&self) -> usize {
        self.receipt_queues.read().await.len()
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Resolve a queue name or URL to a queue URL, with caching
    async fn resolve_queue_url(
        &self,
        ctx: &OperationContext,
        queue: &str,
    ) -> Result<String, QueueError> {
        if queue.starts_with("https://") || queue.starts_with("http://") {
            return Ok(queue.to_string());
        }

        {
            let cache = self.queue_url_cache.read().await;
            if let Some(url) = cache.get(queue) {
                return Ok(url.clone());
            }
        }

        let response: GetQueueUrlResponse = self
            .call(ctx, "GetQueueUrl", &json!({ "QueueName": queue }))
            .await?
            .map_err(SqsError::to_queue_error)?;

        debug!(queue = %queue, queue_url = %response.queue_url, "Resolved queue URL");

        let mut cache = self.queue_url_cache.write().await;
        cache.insert(queue.to_string(), response.queue_url.clone());

        Ok(response.queue_url)
    }

    /// Make a signed JSON protocol call.
    ///
    /// The outer result carries context cancellation, the inner one the SQS
    /// outcome, so callers can map service failures by operation.
    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &OperationContext,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<Result<T, SqsError>, QueueError> {
        ctx.run(self.send_request(action, payload))
            .await
            .map_err(QueueError::cancelled)
    }

    async fn send_request<T: DeserializeOwned>(
        &self,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<T, SqsError> {
        let body = payload.to_string();
        let auth_headers =
            self.signer
                .sign_request("POST", &self.host, "/", &body, &Utc::now());

        let mut request = self
            .http_client
            .post(format!("{}/", self.endpoint))
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("X-Amz-Target", format!("{}.{}", TARGET_PREFIX, action));

        for (key, value) in auth_headers {
            request = request.header(key, value);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                SqsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let query_error = response
            .headers()
            .get("x-amzn-query-error")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let response_body = response
            .text()
            .await
            .map_err(|e| SqsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(
                &response_body,
                query_error.as_deref(),
                status.as_u16(),
            ));
        }

        let response_body = if response_body.trim().is_empty() {
            "{}"
        } else {
            response_body.as_str()
        };

        serde_json::from_str(response_body).map_err(|e| {
            SqsError::SerializationError(format!("Invalid {} response: {}", action, e))
        })
    }
}

/// Parse a JSON protocol error body into SqsError
fn parse_error_response(body: &str, query_error: Option<&str>, status_code: u16) -> SqsError {
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();

    let type_code = parsed
        .get("__type")
        .and_then(|v| v.as_str())
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    // The legacy code header is still sent and is more specific for some errors.
    let legacy_code = query_error
        .and_then(|h| h.split(';').next())
        .map(str::to_string);

    let code = legacy_code
        .clone()
        .or(type_code.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let message = parsed
        .get("message")
        .or_else(|| parsed.get("Message"))
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown error")
        .to_string();

    let matches = |candidates: &[&str]| {
        [legacy_code.as_deref(), type_code.as_deref()]
            .into_iter()
            .flatten()
            .any(|c| candidates.contains(&c))
    };

    if matches(&["AWS.SimpleQueueService.NonExistentQueue", "QueueDoesNotExist"]) {
        SqsError::QueueNotFound(message)
    } else if matches(&[
        "InvalidClientTokenId",
        "UnrecognizedClientException",
        "SignatureDoesNotMatch",
        "IncompleteSignature",
        "AccessDenied",
        "AccessDeniedException",
    ]) {
        SqsError::Authentication(format!("{}: {}", code, message))
    } else if matches(&["ReceiptHandleIsInvalid", "InvalidReceiptHandle"]) {
        SqsError::InvalidReceipt(message)
    } else if status_code == 401 || status_code == 403 {
        SqsError::Authentication(format!("{}: {}", code, message))
    } else {
        SqsError::ServiceError { code, message }
    }
}

impl fmt::Debug for SqsQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsQueue")
            .field("endpoint", &self.endpoint)
            .field("region", &self.signer.region)
            .field("credentials", &"<redacted>")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
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

        let text = std::str::from_utf8(body).map_err(|e| ArgumentError::InvalidFormat {
            field: "body".to_string(),
            message: format!("SQS bodies must be UTF-8 text: {}", e),
        })?;
        if body.len() > MAX_BODY_SIZE {
            return Err(ArgumentError::OutOfRange {
                field: "body".to_string(),
                message: format!("{} bytes exceeds the {} byte limit", body.len(), MAX_BODY_SIZE),
            }
            .into());
        }
        if attributes.keys().any(|k| k.is_empty()) {
            return Err(ArgumentError::InvalidFormat {
                field: "attributes".to_string(),
                message: "attribute names cannot be empty".to_string(),
            }
            .into());
        }

        let queue_url = self.resolve_queue_url(ctx, destination).await?;

        let message_attributes: serde_json::Map<String, serde_json::Value> = attributes
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    json!({ "DataType": "String", "StringValue": value }),
                )
            })
            .collect();

        let mut payload = json!({
            "QueueUrl": queue_url,
            "MessageBody": text,
        });
        if !message_attributes.is_empty() {
            payload["MessageAttributes"] = serde_json::Value::Object(message_attributes);
        }

        let response: SendMessageResponse = self
            .call(ctx, "SendMessage", &payload)
            .await?
            .map_err(SqsError::to_queue_error)?;

        debug!(
            queue_url = %queue_url,
            message_id = ?response.message_id,
            "Message sent"
        );
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

        let queue_url = self.resolve_queue_url(ctx, source).await?;

        let (max_messages, wait_time) = clamp_receive(max_messages, wait_time);

        let payload = json!({
            "QueueUrl": queue_url,
            "MaxNumberOfMessages": max_messages,
            "WaitTimeSeconds": wait_time.as_secs(),
            "MessageAttributeNames": ["All"],
            "MessageSystemAttributeNames": ["SentTimestamp"],
        });

        let response: ReceiveMessageResponse = self
            .call(ctx, "ReceiveMessage", &payload)
            .await?
            .map_err(SqsError::to_queue_error)?;

        {
            let mut registered = self.ack_queue_url.write().await;
            if registered.is_none() {
                *registered = Some(queue_url.clone());
            }
        }

        let messages: Vec<Message> = response
            .messages
            .into_iter()
            .filter_map(|m| {
                let id = m.message_id.clone();
                let converted = m.into_message();
                if converted.is_none() {
                    warn!(message_id = ?id, "Skipping SQS message without receipt handle");
                }
                converted
            })
            .collect();

        let mut origins = self.receipt_queues.write().await;
        for message in &messages {
            origins.insert(message.receipt.clone(), queue_url.clone());
        }
        drop(origins);

        debug!(queue_url = %queue_url, count = messages.len(), "Messages received");
        Ok(messages)
    }

    #[instrument(skip(self, ctx, message), fields(message_id = %message.id))]
    async fn ack(&self, ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.ensure_open()?;
        let receipt = message.require_receipt()?;
        let queue_url = self.ack_target(receipt).await?;

        let payload = json!({
            "QueueUrl": queue_url,
            "ReceiptHandle": receipt,
        });

        let _: EmptyResponse = self
            .call(ctx, "DeleteMessage", &payload)
            .await?
            .map_err(|e| e.to_acknowledgment_error("ack", receipt))?;
        self.receipt_queues.write().await.remove(receipt);

        debug!(queue_url = %queue_url, "Message deleted");
        Ok(())
    }

    #[instrument(skip(self, ctx, message), fields(message_id = %message.id))]
    async fn nack(&self, ctx: &OperationContext, message: &Message) -> Result<(), QueueError> {
        self.ensure_open()?;
        let receipt = message.require_receipt()?;
        let queue_url = self.ack_target(receipt).await?;

        // A zero visibility timeout makes the message immediately available.
        let payload = json!({
            "QueueUrl": queue_url,
            "ReceiptHandle": receipt,
            "VisibilityTimeout": 0,
        });

        let _: EmptyResponse = self
            .call(ctx, "ChangeMessageVisibility", &payload)
            .await?
            .map_err(|e| e.to_acknowledgment_error("nack", receipt))?;
        // Redelivery comes with a fresh receipt handle.
        self.receipt_queues.write().await.remove(receipt);

        debug!(queue_url = %queue_url, "Message visibility reset");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn get_info(&self, ctx: &OperationContext, name: &str) -> Result<QueueInfo, QueueError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(ArgumentError::required("name").into());
        }

        let queue_url = self.resolve_queue_url(ctx, name).await?;

        let payload = json!({
            "QueueUrl": queue_url,
            "AttributeNames": ["ApproximateNumberOfMessages", "CreatedTimestamp"],
        });

        let response: GetQueueAttributesResponse = self
            .call(ctx, "GetQueueAttributes", &payload)
            .await?
            .map_err(SqsError::to_queue_error)?;

        let mut info = QueueInfo::new(name);
        info.approximate_count = response
            .attributes
            .get("ApproximateNumberOfMessages")
            .and_then(|v| v.parse().ok());
        info.created_at = response
            .attributes
            .get("CreatedTimestamp")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(Timestamp::from_secs);

        Ok(info)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Pooled HTTP connections are released when the client drops.
        self.queue_url_cache.write().await.clear();
        self.receipt_queues.write().await.clear();
        info!(endpoint = %self.endpoint, "SQS client closed");
        Ok(())
    }

    fn queue_type(&self) -> QueueType {
        QueueType::Sqs
    }
}

/// Clamp receive parameters to the service limits
pub(crate) fn clamp_receive(max_messages: u32, wait_time: Duration) -> (u32, Duration) {
    (
        max_messages.min(MAX_RECEIVE_BATCH),
        wait_time.min(MAX_WAIT_TIME),
    )
}

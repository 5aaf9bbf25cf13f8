//! Error types for queue operations.
//!
//! The taxonomy separates failures by when they happen and what the caller
//! can do about them:
//!
//! - [`ConfigurationError`]: the configuration is unusable; raised before any I/O
//! - [`ArgumentError`]: a single call was made with bad arguments
//! - [`TransportError`]: the backend could not be reached or refused the call
//! - [`AcknowledgmentError`]: an ack/nack could not be applied, kept apart from
//!   send/receive failures so callers can decide whether the message counts as
//!   processed

use crate::message::Message;
use std::fmt;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid argument: {0}")]
    Argument(#[from] ArgumentError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Acknowledgment error: {0}")]
    Acknowledgment(#[from] AcknowledgmentError),

    /// The operation context ended before the call finished.
    ///
    /// `received` holds any messages a receive loop had already accumulated.
    /// They are live deliveries and can still be acked or nacked.
    #[error("Operation {reason} after receiving {} message(s)", .received.len())]
    Cancelled {
        reason: ContextError,
        received: Vec<Message>,
    },

    #[error("Queue client is closed")]
    Closed,

    #[error("{0}")]
    Close(CloseErrors),
}

impl QueueError {
    /// Check if error is transient and a retry by the caller could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::Argument(_) => false,
            Self::Transport(e) => e.is_transient(),
            Self::Acknowledgment(e) => e.is_transient(),
            Self::Cancelled { .. } => true,
            Self::Closed => false,
            Self::Close(_) => false,
        }
    }

    /// Messages already received when a receive call was cut short
    pub fn partial_messages(&self) -> &[Message] {
        match self {
            Self::Cancelled { received, .. } => received,
            _ => &[],
        }
    }

    pub(crate) fn cancelled(reason: ContextError) -> Self {
        Self::Cancelled {
            reason,
            received: Vec::new(),
        }
    }
}

/// Why an operation context stopped an in-flight call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required configuration: {field}")]
    Missing { field: String },

    #[error("Unsupported queue type: '{queue_type}'")]
    UnsupportedType { queue_type: String },

    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Per-call argument errors
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("Required argument missing: {field}")]
    Required { field: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },

    #[error("Attribute '{key}' must be a string, got {found}")]
    NonStringAttribute { key: String, found: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Reader is bound to topic '{bound}', cannot receive from '{requested}'")]
    ReaderBound { bound: String, requested: String },
}

impl ArgumentError {
    pub(crate) fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }
}

/// Failures talking to the backend
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Publish to '{destination}' failed: {message}")]
    Publish {
        destination: String,
        message: String,
    },

    #[error("Fetch from '{source_name}' failed: {message}")]
    Fetch {
        source_name: String,
        message: String,
    },

    #[error("Provider error ({provider}): {code} - {message}")]
    Provider {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },
}

impl TransportError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::Publish { .. } => true,
            Self::Fetch { .. } => true,
            Self::Provider { .. } => true,
            Self::MalformedResponse { .. } => false,
        }
    }
}

/// Failures applying an ack or nack
#[derive(Debug, Error)]
pub enum AcknowledgmentError {
    #[error("Message has no receipt")]
    MissingReceipt,

    #[error("Receipt '{receipt}' is malformed: {message}")]
    MalformedReceipt { receipt: String, message: String },

    #[error("Receipt '{receipt}' is unknown or was already settled")]
    UnknownReceipt { receipt: String },

    #[error("No queue URL registered for acknowledgment")]
    QueueUrlNotSet,

    #[error("Failed to {operation} message: {message}")]
    Failed { operation: String, message: String },
}

impl AcknowledgmentError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A single sub-resource that failed to release during close
#[derive(Debug)]
pub struct ResourceCloseError {
    pub resource: &'static str,
    pub message: String,
}

impl fmt::Display for ResourceCloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

/// Every failure collected while closing a backend
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<ResourceCloseError>,
}

impl CloseErrors {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `resource`
    pub fn push(&mut self, resource: &'static str, error: impl fmt::Display) {
        self.errors.push(ResourceCloseError {
            resource,
            message: error.to_string(),
        });
    }

    /// Recorded failures in the order they happened
    pub fn errors(&self) -> &[ResourceCloseError] {
        &self.errors
    }

    /// `Ok` when nothing failed, otherwise the combined error
    pub fn into_result(self) -> Result<(), QueueError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Close(self))
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Close failed for {} resource(s)", self.errors.len())?;
        for (index, error) in self.errors.iter().enumerate() {
            let separator = if index == 0 { ": " } else { "; " };
            write!(f, "{}{}", separator, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

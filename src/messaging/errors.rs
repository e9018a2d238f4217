//! # Messaging Error Types
//!
//! Structured error handling for the broker client layer using thiserror
//! instead of `Box<dyn Error>` patterns. `MessagingError` covers transport
//! and queue-level failures; `RpcError` is the only error surface callers of
//! the request/reply API ever see.

use thiserror::Error;

/// Transport and queue-level error types
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Not connected to broker: operation {operation} requires an established channel")]
    NotConnected { operation: String },

    #[error("Publish to queue {queue} failed: {message}")]
    Publish { queue: String, message: String },

    #[error("Queue operation failed: {queue}: {operation}: {message}")]
    QueueOperation {
        queue: String,
        operation: String,
        message: String,
    },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Handler for queue {queue} failed: {message}")]
    Handler { queue: String, message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a not-connected error for a rejected operation
    pub fn not_connected(operation: impl Into<String>) -> Self {
        Self::NotConnected {
            operation: operation.into(),
        }
    }

    /// Create a publish error
    pub fn publish(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue: queue.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::serialization(err.to_string())
    }
}

/// Conversion from lapin::Error to MessagingError
impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        MessagingError::connection(err.to_string())
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Errors surfaced by the request/reply layer.
///
/// Internal reconnection churn never shows up here directly; callers observe
/// it only as latency, `Timeout`, or a fail-fast `NotConnected` wrapped in
/// the `Messaging` variant.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Timed out after {timeout_ms}ms waiting for a reply on {response_queue}")]
    Timeout {
        response_queue: String,
        timeout_ms: u64,
    },

    #[error("Failed to publish request to {queue}: {message}")]
    PublishFailed { queue: String, message: String },

    #[error("Reply payload could not be decoded: {message}")]
    DecodeFailed { message: String },

    #[error("No usable reply after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl RpcError {
    /// Create a timeout error
    pub fn timeout(response_queue: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            response_queue: response_queue.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a publish failure error
    pub fn publish_failed(queue: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::PublishFailed {
            queue: queue.into(),
            message: message.to_string(),
        }
    }

    /// Create a decode failure error
    pub fn decode_failed(message: impl std::fmt::Display) -> Self {
        Self::DecodeFailed {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messaging_error_creation() {
        let conn_err = MessagingError::connection("Connection refused");
        assert!(matches!(conn_err, MessagingError::Connection { .. }));

        let queue_err = MessagingError::queue_operation("test_queue", "declare", "Failed");
        assert!(matches!(queue_err, MessagingError::QueueOperation { .. }));

        let nc_err = MessagingError::not_connected("publish");
        assert!(matches!(nc_err, MessagingError::NotConnected { .. }));
    }

    #[test]
    fn test_error_conversions() {
        let json_str = "{invalid json";
        let json_err = serde_json::from_str::<serde_json::Value>(json_str).unwrap_err();
        let messaging_err: MessagingError = json_err.into();
        assert!(matches!(messaging_err, MessagingError::Serialization { .. }));

        let rpc_err: RpcError = MessagingError::not_connected("rpc_request").into();
        assert!(matches!(
            rpc_err,
            RpcError::Messaging(MessagingError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_error_display() {
        let nc = MessagingError::not_connected("publish");
        let display = format!("{nc}");
        assert!(display.contains("Not connected"));
        assert!(display.contains("publish"));

        let timeout = RpcError::timeout("orders_response_abc", std::time::Duration::from_secs(30));
        let display = format!("{timeout}");
        assert!(display.contains("30000ms"));
        assert!(display.contains("orders_response_abc"));
    }
}

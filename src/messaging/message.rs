//! # Message Structures for Broker Queues
//!
//! Defines the outbound envelope and inbound delivery formats used by the
//! message bus. Correlation id and reply-to travel as message properties so
//! that the request/reply layer can match replies to pending callers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::messaging::errors::MessagingResult;

/// Broker-assigned handle identifying a live subscription
pub type ConsumerTag = String;

/// An outbound message bound for a single queue.
///
/// Immutable once constructed; ownership moves to whichever component is
/// actively transmitting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Queue the message is routed to
    pub target_queue: String,
    /// Raw message body
    pub payload: Vec<u8>,
    /// Correlation id property, echoed back on replies
    pub correlation_id: Option<String>,
    /// Queue the receiver should publish its reply to
    pub reply_to: Option<String>,
    /// When the envelope was built
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Envelope {
    /// Create a plain envelope with no reply semantics
    pub fn new(target_queue: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            target_queue: target_queue.into(),
            payload,
            correlation_id: None,
            reply_to: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Attach a correlation id property
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a reply-to destination property
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Acknowledgement handle for one delivered message.
///
/// Failures from these are logged and swallowed by the bus; by the time an
/// acknowledgement runs, the handler has already executed.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the delivery, removing it from the queue
    async fn ack(&self, all_up_to: bool) -> MessagingResult<()>;

    /// Negatively acknowledge the delivery, optionally requeueing it
    async fn nack(&self, all_up_to: bool, requeue: bool) -> MessagingResult<()>;
}

/// One message delivered to a consumer, plus its acknowledgement handle
#[derive(Clone)]
pub struct Delivery {
    /// Queue the message arrived on
    pub queue: String,
    /// Raw message body
    pub payload: Vec<u8>,
    /// Correlation id message property, if present
    pub correlation_id: Option<String>,
    /// Reply-to message property, if present
    pub reply_to: Option<String>,
    /// Acknowledgement handle for this delivery
    pub acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("payload_len", &self.payload.len())
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("acker", &"<Arc<dyn Acknowledger>>".to_string())
            .finish()
    }
}

impl Delivery {
    /// Decode the payload as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

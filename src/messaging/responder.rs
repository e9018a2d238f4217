//! # RPC Responder
//!
//! The serving side of the request/reply pattern: consume a request queue,
//! hand the decoded JSON request to an injected handler, and publish the
//! handler's reply to the request's response queue, echoing its correlation
//! id. A handler failure nacks the request with requeue, so it is
//! redelivered until the handler succeeds.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::messaging::bus::MessageBus;
use crate::messaging::consumer_registry::QueueHandler;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{ConsumerTag, Delivery, Envelope};

/// Answers correlated requests arriving on a queue
#[derive(Clone)]
pub struct RpcResponder {
    bus: Arc<MessageBus>,
}

impl RpcResponder {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    /// Consume `queue`, answering each JSON request with `handler`'s reply.
    ///
    /// The reply destination is taken from the request's reply-to property,
    /// falling back to a `responseQueue` field in the payload; the
    /// correlation id likewise falls back to a `correlationId` field. A
    /// request with no reply destination fails the handler wrapper and is
    /// requeued.
    pub async fn serve<F, Fut>(
        &self,
        queue: &str,
        handler: F,
    ) -> MessagingResult<Option<ConsumerTag>>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MessagingResult<serde_json::Value>> + Send + 'static,
    {
        let bus = self.bus.clone();
        let handler = Arc::new(handler);
        let queue_name = queue.to_string();

        let wrapped: QueueHandler = Arc::new(
            move |delivery: Delivery| -> BoxFuture<'static, MessagingResult<()>> {
                let bus = bus.clone();
                let handler = handler.clone();
                let queue = queue_name.clone();
                Box::pin(async move {
                    let request: serde_json::Value = delivery.json().map_err(|e| {
                        MessagingError::handler(&queue, format!("malformed request payload: {e}"))
                    })?;

                    let reply_to = delivery
                        .reply_to
                        .clone()
                        .or_else(|| string_field(&request, "responseQueue"));
                    let correlation_id = delivery
                        .correlation_id
                        .clone()
                        .or_else(|| string_field(&request, "correlationId"));

                    let Some(reply_to) = reply_to else {
                        warn!(queue = %queue, "request carries no reply destination");
                        return Err(MessagingError::handler(
                            &queue,
                            "request carries no reply destination",
                        ));
                    };

                    let reply = handler(request).await?;
                    let payload = serde_json::to_vec(&reply)?;

                    let mut envelope = Envelope::new(&reply_to, payload);
                    if let Some(correlation_id) = &correlation_id {
                        envelope = envelope.with_correlation_id(correlation_id.as_str());
                    }
                    bus.publish_envelope(envelope).await?;

                    debug!(
                        queue = %queue,
                        reply_to = %reply_to,
                        correlation_id = correlation_id.as_deref().unwrap_or("-"),
                        "request answered"
                    );
                    Ok(())
                })
            },
        );

        self.bus.consume(queue, wrapped).await
    }
}

fn string_field(value: &serde_json::Value, field: &str) -> Option<String> {
    value.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

impl std::fmt::Debug for RpcResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcResponder").finish()
    }
}

//! # Correlated Request/Reply
//!
//! Turns the fire-and-forget publish/consume primitive into a
//! synchronous-looking call: publish a uniquely-identified request, listen
//! on a per-call response queue, and resolve with the first matching reply
//! or a timeout, whichever comes first.
//!
//! Two producers race to resolve each call: the reply consumer and the
//! deadline timer. The winner writes a single-assignment result slot exactly
//! once; the loser's write is discarded. Every exit path (success, timeout,
//! publish failure) cancels the reply consumer and removes its registration,
//! so no subscription, timer, or pending slot outlives the call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messaging::bus::MessageBus;
use crate::messaging::consumer_registry::QueueHandler;
use crate::messaging::errors::{MessagingError, MessagingResult, RpcError};
use crate::messaging::message::{ConsumerTag, Delivery, Envelope};
use crate::resilience::RetryPolicy;

/// Request/reply client over a message bus
#[derive(Clone)]
pub struct RpcClient {
    bus: Arc<MessageBus>,
}

impl RpcClient {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    /// Prepare a call against `target_queue` with a fresh correlation id.
    ///
    /// The response destination is a queue scoped to this call's correlation
    /// id, so no consumer ever has to filter out another caller's replies.
    pub fn call(&self, target_queue: &str) -> RpcCall {
        let correlation_id = Uuid::new_v4().to_string();
        let response_queue = format!("{target_queue}_response_{correlation_id}");
        RpcCall {
            bus: self.bus.clone(),
            target_queue: target_queue.to_string(),
            correlation_id,
            response_queue,
        }
    }

    /// One-shot request with a prebuilt payload
    pub async fn request(
        &self,
        target_queue: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        self.call(target_queue).send(payload, timeout).await
    }

    /// Request with bounded retry and exponential backoff.
    ///
    /// `build_payload` is re-invoked for every attempt because each attempt
    /// carries a fresh correlation id and response queue that the payload may
    /// embed. A reply that is empty bytes or an empty JSON array counts as a
    /// retryable failure; if the final attempt still comes back empty the
    /// caller gets `MaxRetriesExceeded`. Otherwise the final attempt's error
    /// is returned verbatim and earlier attempts' errors are discarded.
    pub async fn request_with_retry<B>(
        &self,
        target_queue: &str,
        mut build_payload: B,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<Vec<u8>, RpcError>
    where
        B: FnMut(&RpcCall) -> MessagingResult<Vec<u8>>,
    {
        let mut last_error: Option<RpcError> = None;

        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                let delay = policy.backoff_delay(attempt - 1);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "waiting before request retry"
                );
                tokio::time::sleep(delay).await;
            }

            let call = self.call(target_queue);
            let payload = build_payload(&call)?;

            match call.send(payload, timeout).await {
                Ok(reply) if is_empty_reply(&reply) => {
                    warn!(
                        attempt = attempt + 1,
                        queue = %target_queue,
                        "reply was empty; treating as retryable"
                    );
                    last_error = None;
                }
                Ok(reply) => return Ok(reply),
                Err(error) => {
                    warn!(
                        attempt = attempt + 1,
                        queue = %target_queue,
                        %error,
                        "request attempt failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(RpcError::MaxRetriesExceeded {
            attempts: policy.max_attempts,
        }))
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish()
    }
}

/// One in-flight request/reply exchange
pub struct RpcCall {
    bus: Arc<MessageBus>,
    target_queue: String,
    correlation_id: String,
    response_queue: String,
}

impl RpcCall {
    /// The correlation id the peer must echo on its reply
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The queue the peer must publish its reply to
    pub fn response_queue(&self) -> &str {
        &self.response_queue
    }

    /// Publish the request and await the first matching reply.
    ///
    /// Fails fast with `NotConnected` while the link is down rather than
    /// waiting out the timeout.
    pub async fn send(self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, RpcError> {
        if !self.bus.is_connected() {
            return Err(MessagingError::not_connected("rpc_request").into());
        }

        let (resolve, resolved) = oneshot::channel::<Vec<u8>>();
        let slot = Arc::new(parking_lot::Mutex::new(Some(resolve)));

        let tag = match self
            .bus
            .consume(&self.response_queue, self.reply_handler(slot))
            .await
        {
            Ok(Some(tag)) => tag,
            Ok(None) => {
                // the link dropped between the state check and the subscribe
                self.bus.unregister(&self.response_queue);
                return Err(MessagingError::not_connected("rpc_request").into());
            }
            Err(error) => {
                self.bus.unregister(&self.response_queue);
                return Err(error.into());
            }
        };

        debug!(
            queue = %self.target_queue,
            correlation_id = %self.correlation_id,
            "publishing request"
        );
        let request = Envelope::new(&self.target_queue, payload)
            .with_correlation_id(&self.correlation_id)
            .with_reply_to(&self.response_queue);

        if let Err(error) = self.bus.publish_envelope(request).await {
            // roll back the listener immediately instead of waiting out the
            // timeout
            self.cleanup(&tag).await;
            return Err(RpcError::publish_failed(&self.target_queue, error));
        }

        match tokio::time::timeout(timeout, resolved).await {
            Ok(Ok(reply)) => {
                self.cleanup(&tag).await;
                debug!(
                    correlation_id = %self.correlation_id,
                    bytes = reply.len(),
                    "reply received"
                );
                Ok(reply)
            }
            Ok(Err(_closed)) => {
                self.cleanup(&tag).await;
                Err(MessagingError::internal("reply listener dropped without resolving").into())
            }
            Err(_elapsed) => {
                self.cleanup(&tag).await;
                debug!(
                    correlation_id = %self.correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(RpcError::timeout(&self.response_queue, timeout))
            }
        }
    }

    /// One-shot reply consumer: the first delivery matching this call's
    /// correlation id resolves the slot; duplicates and foreign correlation
    /// ids are acked and discarded so they never block the queue.
    fn reply_handler(
        &self,
        slot: Arc<parking_lot::Mutex<Option<oneshot::Sender<Vec<u8>>>>>,
    ) -> QueueHandler {
        let expected = self.correlation_id.clone();
        Arc::new(move |delivery: Delivery| -> futures::future::BoxFuture<'static, MessagingResult<()>> {
            let slot = slot.clone();
            let expected = expected.clone();
            Box::pin(async move {
                if let Some(received) = delivery.correlation_id.as_deref() {
                    if received != expected {
                        debug!(
                            received = %received,
                            expected = %expected,
                            "discarding reply with foreign correlation id"
                        );
                        return Ok(());
                    }
                }

                match slot.lock().take() {
                    Some(resolve) => {
                        // a dropped receiver means the call already timed out;
                        // the delivery is still acked below
                        let _ = resolve.send(delivery.payload.clone());
                    }
                    None => {
                        debug!(correlation_id = %expected, "discarding duplicate reply");
                    }
                }
                Ok(())
            })
        })
    }

    async fn cleanup(&self, tag: &ConsumerTag) {
        // a reconnection replay may have recreated the subscription under a
        // new tag; cancel whichever tag is live now
        let live_tag = self
            .bus
            .registry()
            .live_tag(&self.response_queue)
            .unwrap_or_else(|| tag.clone());
        if let Err(error) = self.bus.cancel(&live_tag).await {
            warn!(
                queue = %self.response_queue,
                %error,
                "failed to cancel reply consumer"
            );
        }
        self.bus.unregister(&self.response_queue);
    }
}

impl std::fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCall")
            .field("target_queue", &self.target_queue)
            .field("correlation_id", &self.correlation_id)
            .field("response_queue", &self.response_queue)
            .finish()
    }
}

fn is_empty_reply(reply: &[u8]) -> bool {
    if reply.is_empty() {
        return true;
    }
    matches!(
        serde_json::from_slice::<serde_json::Value>(reply),
        Ok(serde_json::Value::Array(items)) if items.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_derives_scoped_response_queue() {
        let bus = Arc::new(MessageBus::new(
            Arc::new(crate::messaging::broker_link::BrokerLink::new(
                crate::config::BrokerSettings::default(),
                crate::messaging::memory::InMemoryBroker::new().transport(),
            )),
            Arc::new(crate::messaging::consumer_registry::ConsumerRegistry::new()),
        ));
        let client = RpcClient::new(bus);

        let call = client.call("get_products_details");
        assert!(call
            .response_queue()
            .starts_with("get_products_details_response_"));
        assert!(call.response_queue().ends_with(call.correlation_id()));

        // correlation ids are fresh per call
        let other = client.call("get_products_details");
        assert_ne!(call.correlation_id(), other.correlation_id());
    }

    #[test]
    fn test_empty_reply_detection() {
        assert!(is_empty_reply(b""));
        assert!(is_empty_reply(b"[]"));
        assert!(is_empty_reply(b" [ ] "));
        assert!(!is_empty_reply(b"[{\"_id\":\"p1\"}]"));
        assert!(!is_empty_reply(b"{}"));
        assert!(!is_empty_reply(b"not json"));
    }
}

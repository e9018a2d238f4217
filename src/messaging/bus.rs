//! # Message Bus
//!
//! Publish/consume facade over the broker link and consumer registry:
//! assert-queue-if-missing, publish-with-properties, consume-with-ack/nack,
//! cancel-consumer. All mutating operations fail fast with `NotConnected`
//! while the link is down.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::messaging::broker_link::{BrokerLink, ConnectionState};
use crate::messaging::consumer_registry::{ConsumerRegistry, QueueHandler};
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{ConsumerTag, Delivery, Envelope};
use crate::messaging::transport::DeliverySink;

/// Publish/consume facade bound to one broker link
pub struct MessageBus {
    link: Arc<BrokerLink>,
    registry: Arc<ConsumerRegistry>,
    /// Queues already declared on the current channel session
    declared: DashMap<String, ()>,
}

impl MessageBus {
    pub fn new(link: Arc<BrokerLink>, registry: Arc<ConsumerRegistry>) -> Self {
        Self {
            link,
            registry,
            declared: DashMap::new(),
        }
    }

    /// Whether the underlying link is currently connected
    pub fn is_connected(&self) -> bool {
        self.link.state() == ConnectionState::Connected
    }

    pub fn link(&self) -> &Arc<BrokerLink> {
        &self.link
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Declare a non-durable queue; no-op if already declared this session
    pub async fn ensure_queue(&self, name: &str) -> MessagingResult<()> {
        if self.declared.contains_key(name) {
            return Ok(());
        }
        let channel = self.link.channel("ensure_queue").await?;
        channel.declare_queue(name).await?;
        self.declared.insert(name.to_string(), ());
        Ok(())
    }

    /// Forget session-scoped declarations; called after a reconnection
    pub(crate) fn reset_session(&self) {
        self.declared.clear();
    }

    /// Publish a raw payload to a queue
    pub async fn publish(&self, queue: &str, payload: Vec<u8>) -> MessagingResult<()> {
        self.publish_envelope(Envelope::new(queue, payload)).await
    }

    /// Publish an envelope, carrying its correlation id and reply-to as
    /// message properties. Delivered at-most-once per physical send; the
    /// queue is non-durable, so the message is lost if the broker restarts
    /// with no consumer attached.
    pub async fn publish_envelope(&self, envelope: Envelope) -> MessagingResult<()> {
        if !self.is_connected() {
            return Err(MessagingError::not_connected("publish"));
        }
        self.ensure_queue(&envelope.target_queue).await?;

        let channel = self.link.channel("publish").await?;
        channel
            .publish(&envelope)
            .await
            .map_err(|error| match error {
                publish @ MessagingError::Publish { .. } => publish,
                other => MessagingError::publish(&envelope.target_queue, other.to_string()),
            })?;
        debug!(queue = %envelope.target_queue, bytes = envelope.payload.len(), "message published");
        Ok(())
    }

    /// Register `handler` for `queue` and, if connected, subscribe now.
    ///
    /// Registration persists across reconnections; the supervisor replays it
    /// onto each new channel. Returns `None` when the link is down and the
    /// subscription will only go live on the next successful (re)connect.
    ///
    /// Each delivered message is acked when the handler returns `Ok` and
    /// nacked with requeue when it returns `Err`, so a failing handler sees
    /// the same message redelivered indefinitely. Handlers must be
    /// idempotent.
    pub async fn consume(
        &self,
        queue: &str,
        handler: QueueHandler,
    ) -> MessagingResult<Option<ConsumerTag>> {
        self.registry.register(queue, handler.clone());

        if !self.is_connected() {
            debug!(queue = %queue, "not connected; consumer recorded for replay");
            return Ok(None);
        }

        let tag = self.subscribe_live(queue, handler).await?;
        self.registry.set_live_tag(queue, Some(tag.clone()));
        Ok(Some(tag))
    }

    /// Subscribe a handler onto the current channel without touching the
    /// registry's intent records. Used by `consume` and by consumer replay.
    pub(crate) async fn subscribe_live(
        &self,
        queue: &str,
        handler: QueueHandler,
    ) -> MessagingResult<ConsumerTag> {
        let channel = self.link.channel("consume").await?;
        channel.declare_queue(queue).await.map_err(|error| {
            MessagingError::queue_operation(queue, "declare", error.to_string())
        })?;
        channel
            .subscribe(queue, Self::delivery_sink(queue.to_string(), handler))
            .await
            .map_err(|error| {
                MessagingError::queue_operation(queue, "subscribe", error.to_string())
            })
    }

    /// Stop delivery for a consumer tag; no-op if not connected
    pub async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()> {
        if !self.is_connected() {
            debug!(tag = %consumer_tag, "not connected; cancel is a no-op");
            return Ok(());
        }
        let channel = self.link.channel("cancel").await?;
        channel.cancel(consumer_tag).await?;
        self.registry.clear_live_tag_matching(consumer_tag);
        Ok(())
    }

    /// Remove a queue's registration so it is not replayed after reconnects
    pub fn unregister(&self, queue: &str) {
        self.registry.unregister(queue);
    }

    /// Acknowledge a delivery. Best-effort: the handler has already run, so
    /// a failure here is logged and swallowed.
    pub async fn ack(&self, delivery: &Delivery) {
        if let Err(error) = delivery.acker.ack(false).await {
            warn!(queue = %delivery.queue, %error, "failed to ack message");
        }
    }

    /// Negatively acknowledge a delivery. Best-effort, like `ack`.
    pub async fn nack(&self, delivery: &Delivery, all_up_to: bool, requeue: bool) {
        if let Err(error) = delivery.acker.nack(all_up_to, requeue).await {
            warn!(queue = %delivery.queue, %error, "failed to nack message");
        }
    }

    fn delivery_sink(queue: String, handler: QueueHandler) -> DeliverySink {
        Arc::new(move |delivery: Delivery| -> BoxFuture<'static, ()> {
            let handler = handler.clone();
            let queue = queue.clone();
            Box::pin(async move {
                match handler(delivery.clone()).await {
                    Ok(()) => {
                        if let Err(error) = delivery.acker.ack(false).await {
                            warn!(queue = %queue, %error, "failed to ack message");
                        }
                    }
                    Err(error) => {
                        warn!(queue = %queue, %error, "handler failed; requeueing for redelivery");
                        if let Err(nack_error) = delivery.acker.nack(false, true).await {
                            warn!(queue = %queue, error = %nack_error, "failed to nack message");
                        }
                    }
                }
            })
        })
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("link", &self.link)
            .field("registered_consumers", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSettings;
    use crate::messaging::memory::InMemoryBroker;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn bus_over_memory() -> (Arc<InMemoryBroker>, Arc<BrokerLink>, MessageBus) {
        let broker = InMemoryBroker::new();
        let link = Arc::new(BrokerLink::new(
            BrokerSettings::default(),
            broker.transport(),
        ));
        let registry = Arc::new(ConsumerRegistry::new());
        let bus = MessageBus::new(link.clone(), registry);
        (broker, link, bus)
    }

    fn counting_handler(counter: Arc<AtomicU64>) -> QueueHandler {
        Arc::new(
            move |_delivery: Delivery| -> BoxFuture<'static, MessagingResult<()>> {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            },
        )
    }

    #[tokio::test]
    async fn test_publish_fails_fast_when_disconnected() {
        let (_broker, _link, bus) = bus_over_memory();
        let err = bus.publish("orders", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, MessagingError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_consume_while_disconnected_records_intent() {
        let (_broker, _link, bus) = bus_over_memory();
        let counter = Arc::new(AtomicU64::new(0));

        let tag = bus
            .consume("orders", counting_handler(counter))
            .await
            .unwrap();
        assert!(tag.is_none());
        assert_eq!(bus.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_acks_on_success() {
        let (broker, link, bus) = bus_over_memory();
        link.connect().await.unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let tag = bus
            .consume("orders", counting_handler(counter.clone()))
            .await
            .unwrap();
        assert!(tag.is_some());

        bus.publish("orders", b"{}".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_requeues_message() {
        let (broker, link, bus) = bus_over_memory();
        link.connect().await.unwrap();

        let attempts = Arc::new(AtomicU64::new(0));
        let seen = attempts.clone();
        let handler: QueueHandler = Arc::new(
            move |delivery: Delivery| -> BoxFuture<'static, MessagingResult<()>> {
                let seen = seen.clone();
                Box::pin(async move {
                    let attempt = seen.fetch_add(1, Ordering::Relaxed);
                    if attempt == 0 {
                        Err(MessagingError::handler(&delivery.queue, "first pass fails"))
                    } else {
                        Ok(())
                    }
                })
            },
        );

        bus.consume("orders", handler).await.unwrap();
        bus.publish("orders", b"{}".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // redelivered after the nack, then acked on the second pass
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_ensure_queue_is_idempotent() {
        let (broker, link, bus) = bus_over_memory();
        link.connect().await.unwrap();

        bus.ensure_queue("orders").await.unwrap();
        bus.ensure_queue("orders").await.unwrap();
        assert!(broker.has_queue("orders"));
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let (broker, link, bus) = bus_over_memory();
        link.connect().await.unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let tag = bus
            .consume("orders", counting_handler(counter.clone()))
            .await
            .unwrap()
            .unwrap();
        bus.cancel(&tag).await.unwrap();

        bus.publish("orders", b"{}".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(broker.consumer_count("orders"), 0);
    }
}

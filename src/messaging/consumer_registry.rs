//! # Consumer Registry
//!
//! Mapping from queue name to handler, independent of live subscription
//! state. Registration records intent; the consumer tag for a live
//! subscription is destroyed and recreated on every reconnection while the
//! registration itself persists until explicitly removed.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{ConsumerTag, Delivery};

/// Async handler invoked once per delivered message.
///
/// Returning `Err` causes the delivery to be nacked with requeue, so the
/// same message may be redelivered arbitrarily many times; handlers must be
/// idempotent.
pub type QueueHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, MessagingResult<()>> + Send + Sync>;

/// One registered consumer: intent plus, while live, its broker tag
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub queue: String,
    pub handler: QueueHandler,
    /// Present only while a live subscription exists
    pub consumer_tag: Option<ConsumerTag>,
}

impl std::fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("queue", &self.queue)
            .field("handler", &"<QueueHandler>".to_string())
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

/// A single failed resubscription during replay
#[derive(Debug)]
pub struct ReplayFailure {
    pub queue: String,
    pub error: MessagingError,
}

/// Thread-safe queue-to-handler map with replay support
#[derive(Default)]
pub struct ConsumerRegistry {
    registrations: DashMap<String, ConsumerRegistration>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record intent to consume `queue` with `handler`.
    ///
    /// Replaces any prior handler for the queue (last writer wins). Any live
    /// consumer tag is carried over; the running subscription keeps its old
    /// handler until the next resubscription.
    pub fn register(&self, queue: &str, handler: QueueHandler) {
        let prior_tag = self
            .registrations
            .get(queue)
            .and_then(|existing| existing.consumer_tag.clone());

        self.registrations.insert(
            queue.to_string(),
            ConsumerRegistration {
                queue: queue.to_string(),
                handler,
                consumer_tag: prior_tag,
            },
        );
        debug!(queue = %queue, "consumer registered");
    }

    /// Remove intent for `queue`.
    ///
    /// Always succeeds, even while disconnected. A live subscription is not
    /// cancelled here; cancellation requires an active channel and is the
    /// bus's responsibility.
    pub fn unregister(&self, queue: &str) -> Option<ConsumerRegistration> {
        let removed = self.registrations.remove(queue).map(|(_, reg)| reg);
        if removed.is_some() {
            debug!(queue = %queue, "consumer unregistered");
        }
        removed
    }

    /// Record (or clear) the live tag for a queue's subscription
    pub fn set_live_tag(&self, queue: &str, consumer_tag: Option<ConsumerTag>) {
        if let Some(mut registration) = self.registrations.get_mut(queue) {
            registration.consumer_tag = consumer_tag;
        }
    }

    /// Forget the live tag currently recorded as `consumer_tag`, if any
    pub fn clear_live_tag_matching(&self, consumer_tag: &str) {
        for mut registration in self.registrations.iter_mut() {
            if registration.consumer_tag.as_deref() == Some(consumer_tag) {
                registration.consumer_tag = None;
            }
        }
    }

    /// Forget all live tags; called when the connection is lost
    pub fn clear_live_tags(&self) {
        for mut registration in self.registrations.iter_mut() {
            registration.consumer_tag = None;
        }
    }

    /// Look up the handler registered for a queue
    pub fn handler(&self, queue: &str) -> Option<QueueHandler> {
        self.registrations.get(queue).map(|reg| reg.handler.clone())
    }

    /// The live tag for a queue's subscription, if one exists
    pub fn live_tag(&self, queue: &str) -> Option<ConsumerTag> {
        self.registrations
            .get(queue)
            .and_then(|reg| reg.consumer_tag.clone())
    }

    /// Queue names with a registration, in no particular order
    pub fn queues(&self) -> Vec<String> {
        self.registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Re-invoke `subscribe` for every registration without a live
    /// subscription.
    ///
    /// Used after a (re)connection; live tags are cleared on loss, so every
    /// registration is dormant by the time the supervisor replays. A failure
    /// for one queue does not abort the rest; all failures are collected and
    /// returned as a batch.
    pub async fn replay_all<F, Fut>(&self, subscribe: F) -> Vec<ReplayFailure>
    where
        F: Fn(String, QueueHandler) -> Fut,
        Fut: Future<Output = MessagingResult<ConsumerTag>>,
    {
        let snapshot: Vec<(String, QueueHandler)> = self
            .registrations
            .iter()
            .filter(|entry| entry.value().consumer_tag.is_none())
            .map(|entry| (entry.key().clone(), entry.value().handler.clone()))
            .collect();

        let dormant = snapshot.len();
        let mut failures = Vec::new();
        for (queue, handler) in snapshot {
            match subscribe(queue.clone(), handler).await {
                Ok(tag) => {
                    self.set_live_tag(&queue, Some(tag));
                    debug!(queue = %queue, "consumer resubscribed");
                }
                Err(error) => {
                    self.set_live_tag(&queue, None);
                    failures.push(ReplayFailure { queue, error });
                }
            }
        }

        info!(
            replayed = dormant - failures.len(),
            failed = failures.len(),
            "consumer replay finished"
        );
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

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

    #[test]
    fn test_register_last_writer_wins() {
        let registry = ConsumerRegistry::new();
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));

        registry.register("orders", counting_handler(first.clone()));
        registry.register("orders", counting_handler(second.clone()));

        assert_eq!(registry.len(), 1);

        let handler = registry.handler("orders").unwrap();
        tokio_test::block_on(async {
            let delivery = crate::messaging::memory::test_delivery("orders", b"{}");
            handler(delivery).await.unwrap();
        });
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unregister_always_succeeds() {
        let registry = ConsumerRegistry::new();
        // never registered: removal is a quiet no-op
        assert!(registry.unregister("missing").is_none());

        let counter = Arc::new(AtomicU64::new(0));
        registry.register("orders", counting_handler(counter));
        assert!(registry.unregister("orders").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_live_tags_cleared_on_loss() {
        let registry = ConsumerRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));
        registry.register("orders", counting_handler(counter));
        registry.set_live_tag("orders", Some("tag-1".to_string()));

        registry.clear_live_tags();
        let queues = registry.queues();
        assert_eq!(queues, vec!["orders".to_string()]);
        assert!(registry
            .registrations
            .get("orders")
            .unwrap()
            .consumer_tag
            .is_none());
    }

    #[tokio::test]
    async fn test_replay_collects_partial_failures() {
        let registry = ConsumerRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));
        registry.register("ok_queue", counting_handler(counter.clone()));
        registry.register("bad_queue", counting_handler(counter));

        let failures = registry
            .replay_all(|queue, _handler| async move {
                if queue == "bad_queue" {
                    Err(MessagingError::queue_operation(
                        &queue,
                        "subscribe",
                        "simulated failure",
                    ))
                } else {
                    Ok(format!("tag-{queue}"))
                }
            })
            .await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].queue, "bad_queue");
        // the failing queue did not stop the other from resubscribing
        assert_eq!(
            registry
                .registrations
                .get("ok_queue")
                .unwrap()
                .consumer_tag
                .as_deref(),
            Some("tag-ok_queue")
        );
    }
}

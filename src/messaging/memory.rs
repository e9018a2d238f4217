//! # In-Process Broker Transport
//!
//! A broker that lives inside the process: buffered non-durable queues,
//! competing consumers, and nack-requeue redelivery. Backs the test suite
//! and local development where no AMQP server is available, and exposes
//! failure injection (connect failures, publish failures, connection
//! severing) so reconnection and cleanup behavior can be exercised
//! deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::BrokerSettings;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{Acknowledger, ConsumerTag, Delivery, Envelope};
use crate::messaging::transport::{BrokerChannel, BrokerTransport, DeliverySink, LossCallback};

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
}

struct QueueState {
    messages: parking_lot::Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl QueueState {
    fn new() -> Self {
        Self {
            messages: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, message: StoredMessage) {
        self.messages.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.messages.lock().push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        self.messages.lock().pop_front()
    }
}

/// Broker-side state shared by every connection made through [`transport`].
///
/// Queues outlive individual connections, the way they do on a real broker.
///
/// [`transport`]: InMemoryBroker::transport
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
    connections: parking_lot::Mutex<Vec<Weak<ChannelCore>>>,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    tag_seq: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            connections: parking_lot::Mutex::new(Vec::new()),
            fail_connects: AtomicU32::new(0),
            fail_publishes: AtomicU32::new(0),
            tag_seq: AtomicU64::new(0),
        })
    }

    /// A transport handle connecting into this broker
    pub fn transport(self: &Arc<Self>) -> Arc<dyn BrokerTransport> {
        Arc::new(MemoryTransport {
            broker: self.clone(),
        })
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::Release);
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.fail_publishes.store(count, Ordering::Release);
    }

    /// Kill every live connection, firing each one's loss observer.
    ///
    /// Simulates the broker dropping its clients; queued messages survive.
    pub fn sever_connections(&self) {
        let cores: Vec<Arc<ChannelCore>> = {
            let mut connections = self.connections.lock();
            let live: Vec<_> = connections.iter().filter_map(Weak::upgrade).collect();
            connections.clear();
            live
        };
        for core in cores {
            core.kill();
        }
    }

    /// Number of messages currently buffered on `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|state| state.messages.lock().len())
            .unwrap_or(0)
    }

    /// Number of live consumers subscribed to `queue` across all connections
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|core| core.alive.load(Ordering::Acquire))
            .map(|core| {
                core.consumers
                    .iter()
                    .filter(|entry| entry.value().queue == queue)
                    .count()
            })
            .sum()
    }

    /// Whether `queue` has been declared (explicitly or via first publish)
    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()))
            .clone()
    }

    fn next_tag(&self) -> ConsumerTag {
        format!("mem-{}", self.tag_seq.fetch_add(1, Ordering::Relaxed))
    }
}

struct MemoryTransport {
    broker: Arc<InMemoryBroker>,
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(&self, settings: &BrokerSettings) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let remaining = self.broker.fail_connects.load(Ordering::Acquire);
        if remaining > 0 {
            self.broker.fail_connects.store(remaining - 1, Ordering::Release);
            return Err(MessagingError::connection(format!(
                "simulated connect failure to {}:{}",
                settings.host, settings.port
            )));
        }

        let core = Arc::new(ChannelCore {
            broker: Arc::downgrade(&self.broker),
            alive: AtomicBool::new(true),
            consumers: DashMap::new(),
            on_closed: parking_lot::Mutex::new(None),
        });
        self.broker.connections.lock().push(Arc::downgrade(&core));
        Ok(Arc::new(MemoryChannel { core }))
    }
}

struct ConsumerEntry {
    queue: String,
    handle: JoinHandle<()>,
}

struct ChannelCore {
    broker: Weak<InMemoryBroker>,
    alive: AtomicBool,
    consumers: DashMap<ConsumerTag, ConsumerEntry>,
    on_closed: parking_lot::Mutex<Option<LossCallback>>,
}

impl ChannelCore {
    fn abort_consumers(&self) {
        let tags: Vec<ConsumerTag> = self
            .consumers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for tag in tags {
            if let Some((_, entry)) = self.consumers.remove(&tag) {
                entry.handle.abort();
            }
        }
    }

    /// Broker-initiated death: stop delivery and fire the loss observer
    fn kill(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.abort_consumers();
        let callback = self.on_closed.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

struct MemoryChannel {
    core: Arc<ChannelCore>,
}

impl MemoryChannel {
    fn broker(&self) -> MessagingResult<Arc<InMemoryBroker>> {
        self.core
            .broker
            .upgrade()
            .ok_or_else(|| MessagingError::connection("broker dropped"))
    }

    fn check_alive(&self, operation: &str) -> MessagingResult<()> {
        if self.core.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MessagingError::connection(format!(
                "channel is dead: {operation}"
            )))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> MessagingResult<()> {
        self.check_alive("declare_queue")?;
        self.broker()?.queue(queue);
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> MessagingResult<()> {
        self.check_alive("publish")?;
        let broker = self.broker()?;

        let remaining = broker.fail_publishes.load(Ordering::Acquire);
        if remaining > 0 {
            broker.fail_publishes.store(remaining - 1, Ordering::Release);
            return Err(MessagingError::publish(
                &envelope.target_queue,
                "simulated publish failure",
            ));
        }

        broker.queue(&envelope.target_queue).push_back(StoredMessage {
            payload: envelope.payload.clone(),
            correlation_id: envelope.correlation_id.clone(),
            reply_to: envelope.reply_to.clone(),
        });
        Ok(())
    }

    async fn subscribe(&self, queue: &str, sink: DeliverySink) -> MessagingResult<ConsumerTag> {
        self.check_alive("subscribe")?;
        let broker = self.broker()?;
        let state = broker.queue(queue);
        let tag = broker.next_tag();

        let queue_name = queue.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match state.pop() {
                    Some(message) => {
                        let delivery = Delivery {
                            queue: queue_name.clone(),
                            payload: message.payload.clone(),
                            correlation_id: message.correlation_id.clone(),
                            reply_to: message.reply_to.clone(),
                            acker: Arc::new(MemoryAcker {
                                queue: state.clone(),
                                message,
                            }),
                        };
                        sink(delivery).await;
                    }
                    None => state.notify.notified().await,
                }
            }
        });

        self.core.consumers.insert(
            tag.clone(),
            ConsumerEntry {
                queue: queue.to_string(),
                handle,
            },
        );
        debug!(queue = %queue, tag = %tag, "in-memory consumer started");
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()> {
        if let Some((_, entry)) = self.core.consumers.remove(consumer_tag) {
            entry.handle.abort();
            debug!(tag = %consumer_tag, "in-memory consumer cancelled");
        }
        Ok(())
    }

    async fn close(&self) {
        self.core.alive.store(false, Ordering::Release);
        self.core.abort_consumers();
        *self.core.on_closed.lock() = None;
    }

    fn set_on_closed(&self, callback: LossCallback) {
        *self.core.on_closed.lock() = Some(callback);
    }
}

struct MemoryAcker {
    queue: Arc<QueueState>,
    message: StoredMessage,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, _all_up_to: bool) -> MessagingResult<()> {
        // the message was removed from the queue at delivery time
        Ok(())
    }

    async fn nack(&self, _all_up_to: bool, requeue: bool) -> MessagingResult<()> {
        if requeue {
            self.queue.push_front(self.message.clone());
        }
        Ok(())
    }
}

struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self, _all_up_to: bool) -> MessagingResult<()> {
        Ok(())
    }

    async fn nack(&self, _all_up_to: bool, _requeue: bool) -> MessagingResult<()> {
        Ok(())
    }
}

/// Build a detached delivery for handler-level tests
pub fn test_delivery(queue: &str, payload: &[u8]) -> Delivery {
    Delivery {
        queue: queue.to_string(),
        payload: payload.to_vec(),
        correlation_id: None,
        reply_to: None,
        acker: Arc::new(NoopAcker),
    }
}

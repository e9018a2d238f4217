//! # Broker Transport Seam
//!
//! Trait boundary between the connection-management layer and the concrete
//! broker driver. The production implementation speaks AMQP via lapin
//! ([`crate::messaging::amqp`]); an in-process implementation backs the test
//! suite ([`crate::messaging::memory`]).

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::BrokerSettings;
use crate::messaging::errors::MessagingResult;
use crate::messaging::message::{ConsumerTag, Delivery, Envelope};

/// Fully-wrapped delivery callback handed to a transport subscription.
///
/// The bus builds these: the future runs the user handler and performs the
/// matching ack or nack before resolving. Transports invoke and await the
/// sink once per delivery, in arrival order for a given consumer.
pub type DeliverySink = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired when the transport observes connection loss
pub type LossCallback = Box<dyn Fn() + Send + Sync>;

/// Factory for logical broker channels
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Establish a connection and open a logical channel on it
    async fn connect(&self, settings: &BrokerSettings) -> MessagingResult<Arc<dyn BrokerChannel>>;
}

/// One logical channel on an established broker connection.
///
/// All operations assume the channel is live; the connection manager checks
/// state before handing a channel out, so a dead channel is only ever seen
/// here as an error from the driver.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a non-durable queue (no-op if it already exists)
    async fn declare_queue(&self, queue: &str) -> MessagingResult<()>;

    /// Publish one message; at-most-once per physical send
    async fn publish(&self, envelope: &Envelope) -> MessagingResult<()>;

    /// Start a consumer on `queue`, delivering each message to `sink`
    async fn subscribe(&self, queue: &str, sink: DeliverySink) -> MessagingResult<ConsumerTag>;

    /// Stop delivery for a consumer tag
    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()>;

    /// Close channel then connection; both are released on every exit path
    async fn close(&self);

    /// Register the loss observer; invoked when the connection dies
    fn set_on_closed(&self, callback: LossCallback);
}

//! # Messaging System
//!
//! Explicit composition root for the messaging core. One `MessagingSystem`
//! owns one broker link, its consumer registry, the bus facade, and the
//! reconnection supervisor; it is constructed by the process entry point and
//! passed by reference to whatever needs it.

use std::sync::Arc;

use tracing::info;

use crate::config::MessagingSettings;
use crate::messaging::broker_link::{BrokerLink, ConnectionState};
use crate::messaging::bus::MessageBus;
use crate::messaging::consumer_registry::ConsumerRegistry;
use crate::messaging::errors::MessagingResult;
use crate::messaging::reconnect::ReconnectSupervisor;
use crate::messaging::responder::RpcResponder;
use crate::messaging::rpc::RpcClient;
use crate::messaging::transport::BrokerTransport;
use crate::services::ProductDetailsClient;

/// Composition root owning one logical broker connection and the components
/// built on it
pub struct MessagingSystem {
    settings: MessagingSettings,
    link: Arc<BrokerLink>,
    registry: Arc<ConsumerRegistry>,
    bus: Arc<MessageBus>,
    supervisor: Arc<ReconnectSupervisor>,
}

impl MessagingSystem {
    /// Wire the core onto the given transport
    pub fn new(settings: MessagingSettings, transport: Arc<dyn BrokerTransport>) -> Arc<Self> {
        let link = Arc::new(BrokerLink::new(settings.broker.clone(), transport));
        let registry = Arc::new(ConsumerRegistry::new());
        let bus = Arc::new(MessageBus::new(link.clone(), registry.clone()));
        let supervisor = ReconnectSupervisor::new(
            link.clone(),
            bus.clone(),
            registry.clone(),
            settings.reconnect.clone(),
        );
        supervisor.attach();

        Arc::new(Self {
            settings,
            link,
            registry,
            bus,
            supervisor,
        })
    }

    /// Wire the core onto a real AMQP broker
    pub fn with_amqp(settings: MessagingSettings) -> Arc<Self> {
        let transport = Arc::new(crate::messaging::amqp::AmqpTransport::new());
        Self::new(settings, transport)
    }

    /// Establish the broker link and bring any dormant consumer
    /// registrations live. Resets the reconnection attempt counter, so a
    /// link that previously exhausted its attempts can recover here.
    pub async fn connect(&self) -> MessagingResult<()> {
        self.supervisor.reset_attempts();
        self.link.connect().await?;

        self.bus.reset_session();
        let failures = self
            .registry
            .replay_all(|queue, handler| {
                let bus = Arc::clone(&self.bus);
                async move { bus.subscribe_live(&queue, handler).await }
            })
            .await;
        for failure in &failures {
            tracing::error!(
                queue = %failure.queue,
                error = %failure.error,
                "failed to bring registered consumer live"
            );
        }
        Ok(())
    }

    /// Release the connection for the whole process. Halts any in-flight
    /// reconnection loop first, so shutdown is clean even mid-reconnection.
    pub async fn shutdown(&self) {
        info!("shutting down messaging system");
        self.supervisor.halt();
        self.link.close().await;
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    pub fn registry(&self) -> Arc<ConsumerRegistry> {
        self.registry.clone()
    }

    /// Request/reply client over this system's bus
    pub fn rpc(&self) -> RpcClient {
        RpcClient::new(self.bus.clone())
    }

    /// Responder for answering correlated requests on this system's bus
    pub fn responder(&self) -> RpcResponder {
        RpcResponder::new(self.bus.clone())
    }

    /// Product-details client configured from this system's settings
    pub fn product_details(&self) -> ProductDetailsClient {
        ProductDetailsClient::new(self.bus.clone(), &self.settings.rpc)
    }
}

impl std::fmt::Debug for MessagingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingSystem")
            .field("state", &self.state())
            .field("registered_consumers", &self.registry.len())
            .finish()
    }
}

//! # Broker Link
//!
//! Owns the physical connection and logical channel to the broker. Exactly
//! one link exists per messaging system; it is constructed explicitly and
//! passed by reference to the components that need it.
//!
//! Connection loss is detected asynchronously: the transport's loss observer
//! fires the registered callbacks exactly once per loss event, and every
//! mutating operation checks state first so callers fail fast with
//! `NotConnected` instead of blocking on a dead channel.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::transport::{BrokerChannel, BrokerTransport};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection; publish/consume fail fast
    Disconnected = 0,
    /// A manual connect is in progress
    Connecting = 1,
    /// Channel established; operations are valid
    Connected = 2,
    /// The supervisor is re-establishing the link
    Reconnecting = 3,
    /// Reconnection attempts exhausted; terminal until a manual connect
    Failed = 4,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// The single logical broker connection for a messaging system
pub struct BrokerLink {
    settings: BrokerSettings,
    transport: Arc<dyn BrokerTransport>,

    /// Current channel; `None` whenever the link is down
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,

    /// Current lifecycle state (atomic for lock-free fail-fast checks)
    state: AtomicU8,

    /// Armed on successful connect, disarmed on the first loss signal, so
    /// loss observers fire exactly once per loss event
    loss_armed: AtomicBool,

    /// Observers invoked once per connection loss
    lost_callbacks: parking_lot::RwLock<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl BrokerLink {
    pub fn new(settings: BrokerSettings, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            settings,
            transport,
            channel: RwLock::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            loss_armed: AtomicBool::new(false),
            lost_callbacks: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Register an observer invoked exactly once per connection loss.
    ///
    /// Not invoked again until a subsequent loss after a successful
    /// reconnection.
    pub fn on_lost(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lost_callbacks.write().push(Arc::new(callback));
    }

    /// Establish the logical channel. No-op if already connected.
    pub async fn connect(self: &Arc<Self>) -> MessagingResult<()> {
        if self.state() == ConnectionState::Connected {
            debug!("broker link already connected");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match self.open().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(host = %self.settings.host, port = self.settings.port, "🔌 Broker link established");
                Ok(())
            }
            Err(error) => {
                self.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    /// Tear down and re-open the link without leaving the current state.
    ///
    /// Used by the reconnection supervisor, which owns the `Reconnecting`
    /// state for the duration of its loop.
    pub(crate) async fn reopen(self: &Arc<Self>) -> MessagingResult<()> {
        self.teardown().await;
        self.open().await?;
        self.set_state(ConnectionState::Connected);
        info!(host = %self.settings.host, port = self.settings.port, "🔌 Broker link re-established");
        Ok(())
    }

    /// Scoped release of channel and connection.
    ///
    /// Never returns an error; both handles are released on every exit path,
    /// including after a prior partial failure.
    pub async fn close(&self) {
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        info!("broker link closed");
    }

    /// Hand out the live channel, failing fast when not connected
    pub async fn channel(&self, operation: &str) -> MessagingResult<Arc<dyn BrokerChannel>> {
        if self.state() != ConnectionState::Connected {
            return Err(MessagingError::not_connected(operation));
        }
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| MessagingError::not_connected(operation))
    }

    async fn open(self: &Arc<Self>) -> MessagingResult<()> {
        let channel = self.transport.connect(&self.settings).await?;

        let weak = Arc::downgrade(self);
        channel.set_on_closed(Box::new(move || {
            if let Some(link) = weak.upgrade() {
                link.handle_loss();
            }
        }));

        *self.channel.write().await = Some(channel);
        self.loss_armed.store(true, Ordering::Release);
        Ok(())
    }

    async fn teardown(&self) {
        self.loss_armed.store(false, Ordering::Release);
        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    fn handle_loss(&self) {
        if !self.loss_armed.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("💔 Broker connection lost");

        let callbacks: Vec<_> = self.lost_callbacks.read().iter().cloned().collect();
        for callback in callbacks {
            callback();
        }
    }
}

impl std::fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink")
            .field("host", &self.settings.host)
            .field("port", &self.settings.port)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use std::sync::atomic::AtomicU64;

    fn link_over_memory() -> (Arc<InMemoryBroker>, Arc<BrokerLink>) {
        let broker = InMemoryBroker::new();
        let link = Arc::new(BrokerLink::new(
            BrokerSettings::default(),
            broker.transport(),
        ));
        (broker, link)
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
        assert_eq!(ConnectionState::from(99), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (_broker, link) = link_over_memory();
        link.connect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
        // second connect is a no-op, not an error
        link.connect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_channel_fails_fast_when_disconnected() {
        let (_broker, link) = link_over_memory();
        let err = link.channel("publish").await.err().unwrap();
        assert!(matches!(err, MessagingError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_loss_observer_fires_once_per_loss() {
        let (broker, link) = link_over_memory();
        let losses = Arc::new(AtomicU64::new(0));
        let observed = losses.clone();
        link.on_lost(move || {
            observed.fetch_add(1, Ordering::Relaxed);
        });

        link.connect().await.unwrap();
        broker.sever_connections();
        broker.sever_connections();
        assert_eq!(losses.load(Ordering::Relaxed), 1);

        // a fresh loss after reconnection fires again
        link.reopen().await.unwrap();
        broker.sever_connections();
        assert_eq!(losses.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_close_is_quiet_and_releases_channel() {
        let (broker, link) = link_over_memory();
        link.connect().await.unwrap();
        link.close().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(link.channel("publish").await.is_err());
        // voluntary close is not a loss event
        broker.sever_connections();
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }
}

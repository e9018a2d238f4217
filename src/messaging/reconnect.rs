//! # Reconnection Supervisor
//!
//! Bounded retry loop that re-establishes the broker link after a loss event
//! and replays every registered consumer onto the new channel. Only one
//! reconnection loop runs at a time; a loss observed while already
//! reconnecting is a no-op.
//!
//! The delay between attempts is fixed. Exhausting the attempt budget leaves
//! the link in the terminal `Failed` state; publish/consume keep failing fast
//! until an external caller connects again, which also resets the counter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ReconnectSettings;
use crate::messaging::broker_link::{BrokerLink, ConnectionState};
use crate::messaging::bus::MessageBus;
use crate::messaging::consumer_registry::ConsumerRegistry;

/// Serialized, bounded reconnection loop over one broker link
pub struct ReconnectSupervisor {
    link: Arc<BrokerLink>,
    bus: Arc<MessageBus>,
    registry: Arc<ConsumerRegistry>,
    settings: ReconnectSettings,

    /// Checked-and-set atomically so concurrent loss events start one loop
    reconnecting: AtomicBool,
    attempts: AtomicU32,
    shutting_down: AtomicBool,

    /// Runtime handle captured at construction; loss observers may fire from
    /// threads that are not workers of the runtime
    runtime: Option<tokio::runtime::Handle>,
}

impl ReconnectSupervisor {
    pub fn new(
        link: Arc<BrokerLink>,
        bus: Arc<MessageBus>,
        registry: Arc<ConsumerRegistry>,
        settings: ReconnectSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            link,
            bus,
            registry,
            settings,
            reconnecting: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
            runtime: tokio::runtime::Handle::try_current().ok(),
        })
    }

    /// Subscribe this supervisor to the link's loss events
    pub fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.link.on_lost(move || {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.on_connection_lost();
            }
        });
    }

    /// Reset the attempt counter; called on manual connect
    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    /// Stop any in-flight loop at its next checkpoint; used by shutdown
    pub fn halt(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Whether a reconnection loop is currently running
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    fn on_connection_lost(self: Arc<Self>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("reconnection already in progress; ignoring loss event");
            return;
        }

        self.link.set_state(ConnectionState::Reconnecting);
        self.registry.clear_live_tags();

        let runtime = self
            .runtime
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());
        match runtime {
            Some(handle) => {
                let supervisor = self.clone();
                handle.spawn(async move {
                    supervisor.run().await;
                });
            }
            None => {
                error!("no runtime available to drive reconnection");
                self.reconnecting.store(false, Ordering::Release);
            }
        }
    }

    async fn run(&self) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                self.reconnecting.store(false, Ordering::Release);
                return;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            info!(
                attempt,
                max_attempts = self.settings.max_attempts,
                "🔄 Reconnecting to broker"
            );

            match self.link.reopen().await {
                Ok(()) => {
                    self.bus.reset_session();
                    let failures = self
                        .registry
                        .replay_all(|queue, handler| {
                            let bus = Arc::clone(&self.bus);
                            async move { bus.subscribe_live(&queue, handler).await }
                        })
                        .await;

                    for failure in &failures {
                        error!(
                            queue = %failure.queue,
                            error = %failure.error,
                            "consumer replay failed"
                        );
                    }

                    self.attempts.store(0, Ordering::Release);
                    self.reconnecting.store(false, Ordering::Release);
                    info!(
                        replay_failures = failures.len(),
                        "✅ Broker link recovered"
                    );
                    return;
                }
                Err(connect_error) => {
                    warn!(attempt, error = %connect_error, "reconnect attempt failed");

                    if attempt >= self.settings.max_attempts {
                        self.link.set_state(ConnectionState::Failed);
                        self.reconnecting.store(false, Ordering::Release);
                        error!(
                            attempts = attempt,
                            "🛑 Reconnection attempts exhausted; broker link marked failed"
                        );
                        return;
                    }

                    tokio::time::sleep(self.settings.retry_delay).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("max_attempts", &self.settings.max_attempts)
            .field("attempts", &self.attempts.load(Ordering::Acquire))
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}

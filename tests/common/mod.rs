//! Shared helpers for integration tests: a messaging system wired onto the
//! in-process broker, with short timeouts and delays.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use order_core::config::{MessagingSettings, ReconnectSettings, RpcSettings};
use order_core::messaging::{ConnectionState, InMemoryBroker, MessagingSystem, QueueHandler};
use order_core::resilience::RetryPolicy;

pub fn test_settings() -> MessagingSettings {
    MessagingSettings {
        reconnect: ReconnectSettings {
            max_attempts: 5,
            retry_delay: Duration::from_millis(10),
        },
        rpc: RpcSettings {
            request_timeout: Duration::from_millis(200),
            retry: RetryPolicy::new(
                3,
                Duration::from_millis(50),
                Duration::from_millis(200),
            ),
        },
        ..MessagingSettings::default()
    }
}

pub async fn connected_system() -> (Arc<InMemoryBroker>, Arc<MessagingSystem>) {
    let broker = InMemoryBroker::new();
    let system = MessagingSystem::new(test_settings(), broker.transport());
    system.connect().await.expect("initial connect failed");
    (broker, system)
}

pub async fn wait_for_state(system: &MessagingSystem, state: ConnectionState) {
    for _ in 0..1000 {
        if system.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for state {:?}, still {:?}",
        state,
        system.state()
    );
}

pub fn counting_handler(counter: Arc<AtomicU64>) -> QueueHandler {
    Arc::new(
        move |_delivery: order_core::messaging::Delivery| -> futures::future::BoxFuture<
            'static,
            order_core::messaging::MessagingResult<()>,
        > {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        },
    )
}

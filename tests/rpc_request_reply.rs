//! Request/reply behavior over the in-process broker: round trips against a
//! fake catalog peer, reply exclusivity, timeout cleanup, and publish
//! failure rollback.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use order_core::messaging::{
    Delivery, Envelope, InMemoryBroker, MessagingError, MessagingSystem, QueueHandler, RpcError,
};
use order_core::services::PRODUCT_DETAILS_QUEUE;
use serde_json::{json, Value};

/// Serve the request queue the way the catalog peer does: one reply per
/// request, on the request's response queue, echoing its correlation id.
async fn start_fake_catalog_peer(system: &MessagingSystem, calls: Arc<AtomicU64>) {
    system
        .responder()
        .serve(PRODUCT_DETAILS_QUEUE, move |request: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                let records: Vec<Value> = request["productIds"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|id| id.as_str())
                    .map(|id| json!({"_id": id, "name": format!("Product {id}"), "price": 9.99}))
                    .collect();
                Ok(Value::Array(records))
            }
        })
        .await
        .expect("failed to start fake peer")
        .expect("peer consumer should be live");
}

#[tokio::test]
async fn product_details_round_trip_resolves_quickly() {
    let (_broker, system) = common::connected_system().await;
    let peer_calls = Arc::new(AtomicU64::new(0));
    start_fake_catalog_peer(&system, peer_calls.clone()).await;

    let started = std::time::Instant::now();
    let products = system
        .product_details()
        .get_product_details_with_retry(&["p1".to_string(), "p2".to_string()])
        .await
        .expect("round trip failed");

    assert_eq!(products.len(), 2);
    assert_eq!(products[0].id, "p1");
    assert_eq!(products[1].id, "p2");
    assert_eq!(products[0].fields["name"], "Product p1");
    assert_eq!(peer_calls.load(Ordering::Relaxed), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn duplicate_replies_resolve_the_call_exactly_once() {
    let (_broker, system) = common::connected_system().await;
    let bus = system.bus();

    // a peer that answers every request twice with the same correlation id
    let peer_bus = bus.clone();
    let double_replier: QueueHandler = Arc::new(move |delivery: Delivery| -> BoxFuture<
        'static,
        order_core::messaging::MessagingResult<()>,
    > {
        let peer_bus = peer_bus.clone();
        Box::pin(async move {
            let reply_to = delivery.reply_to.clone().expect("request missing reply-to");
            let correlation_id = delivery
                .correlation_id
                .clone()
                .expect("request missing correlation id");
            for _ in 0..2 {
                peer_bus
                    .publish_envelope(
                        Envelope::new(&reply_to, br#"[{"_id":"p1"}]"#.to_vec())
                            .with_correlation_id(&correlation_id),
                    )
                    .await?;
            }
            Ok(())
        })
    });
    bus.consume("echo_twice", double_replier).await.unwrap();

    let reply = system
        .rpc()
        .request("echo_twice", b"{}".to_vec(), Duration::from_millis(500))
        .await
        .expect("first reply should resolve the call");
    assert_eq!(reply, br#"[{"_id":"p1"}]"#.to_vec());

    // only the peer's registration remains after call cleanup
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(system.registry().len(), 1);
}

#[tokio::test]
async fn timeout_leaves_no_reply_consumer_behind() {
    let (broker, system) = common::connected_system().await;

    // no peer is serving, so the call can only time out
    let call = system.rpc().call(PRODUCT_DETAILS_QUEUE);
    let response_queue = call.response_queue().to_string();
    let correlation_id = call.correlation_id().to_string();

    let err = call
        .send(b"{}".to_vec(), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));

    assert_eq!(broker.consumer_count(&response_queue), 0);
    assert_eq!(system.registry().len(), 0);

    // a stray matching reply published after the timeout is never consumed
    system
        .bus()
        .publish_envelope(
            Envelope::new(&response_queue, br#"[{"_id":"late"}]"#.to_vec())
                .with_correlation_id(&correlation_id),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.queue_depth(&response_queue), 1);
}

#[tokio::test]
async fn publish_failure_rolls_back_the_reply_listener() {
    let (broker, system) = common::connected_system().await;
    broker.fail_next_publishes(1);

    let call = system.rpc().call(PRODUCT_DETAILS_QUEUE);
    let response_queue = call.response_queue().to_string();

    let started = std::time::Instant::now();
    let err = call
        .send(b"{}".to_vec(), Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::PublishFailed { .. }));
    // the rollback happens immediately, not after the 30s timeout
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(broker.consumer_count(&response_queue), 0);
    assert_eq!(system.registry().len(), 0);
}

#[tokio::test]
async fn rpc_fails_fast_while_disconnected() {
    let broker = InMemoryBroker::new();
    let system = MessagingSystem::new(common::test_settings(), broker.transport());

    // never connected
    let err = system
        .rpc()
        .request(PRODUCT_DETAILS_QUEUE, b"{}".to_vec(), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Messaging(MessagingError::NotConnected { .. })
    ));
    assert_eq!(system.registry().len(), 0);
}

#[tokio::test]
async fn malformed_reply_surfaces_as_decode_failure() {
    let (_broker, system) = common::connected_system().await;
    let bus = system.bus();

    let peer_bus = bus.clone();
    let garbage_replier: QueueHandler = Arc::new(move |delivery: Delivery| -> BoxFuture<
        'static,
        order_core::messaging::MessagingResult<()>,
    > {
        let peer_bus = peer_bus.clone();
        Box::pin(async move {
            let reply_to = delivery.reply_to.clone().expect("request missing reply-to");
            let correlation_id = delivery
                .correlation_id
                .clone()
                .expect("request missing correlation id");
            peer_bus
                .publish_envelope(
                    Envelope::new(&reply_to, b"not json at all".to_vec())
                        .with_correlation_id(&correlation_id),
                )
                .await
        })
    });
    bus.consume(PRODUCT_DETAILS_QUEUE, garbage_replier)
        .await
        .unwrap();

    let err = system
        .product_details()
        .get_product_details(&["p1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::DecodeFailed { .. }));
}

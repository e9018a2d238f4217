//! # Messaging Module
//!
//! Broker client layer for the order service: a single managed connection,
//! a replayable consumer registry, a publish/consume bus, bounded
//! reconnection, and correlation-id request/reply on top.
//!
//! ## Architecture
//!
//! ```text
//! RpcClient / RpcResponder      (request/reply over the bus)
//!     └── MessageBus            (ensure-queue, publish, consume, ack/nack)
//!         ├── ConsumerRegistry  (queue -> handler, replayed on reconnect)
//!         └── BrokerLink        (connection + channel, loss detection)
//!             └── BrokerTransport (lapin AMQP, or in-process for tests)
//! ReconnectSupervisor           (bounded retry loop over BrokerLink)
//! ```

pub mod amqp;
pub mod broker_link;
pub mod bus;
pub mod consumer_registry;
pub mod errors;
pub mod memory;
pub mod message;
pub mod reconnect;
pub mod responder;
pub mod rpc;
pub mod system;
pub mod transport;

pub use amqp::AmqpTransport;
pub use broker_link::{BrokerLink, ConnectionState};
pub use bus::MessageBus;
pub use consumer_registry::{ConsumerRegistration, ConsumerRegistry, QueueHandler, ReplayFailure};
pub use errors::{MessagingError, MessagingResult, RpcError};
pub use memory::InMemoryBroker;
pub use message::{Acknowledger, ConsumerTag, Delivery, Envelope};
pub use reconnect::ReconnectSupervisor;
pub use responder::RpcResponder;
pub use rpc::{RpcCall, RpcClient};
pub use system::MessagingSystem;
pub use transport::{BrokerChannel, BrokerTransport, DeliverySink, LossCallback};

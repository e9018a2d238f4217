#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Order Core
//!
//! Messaging core for the order management service. The CRUD surface of the
//! service (REST routes, document storage, validation) lives elsewhere; this
//! crate is the broker client layer underneath it: one managed connection,
//! a replayable consumer registry, and a correlation-id request/reply
//! protocol with bounded retry, kept correct across transient broker
//! failures.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Broker link, bus, reconnection, and request/reply
//! - [`services`] - Business-facing clients (product details)
//! - [`resilience`] - Retry policy with exponential backoff
//! - [`config`] - Environment-driven settings
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use order_core::config::MessagingSettings;
//! use order_core::messaging::MessagingSystem;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = MessagingSettings::from_env()?;
//! let system = MessagingSystem::with_amqp(settings);
//! system.connect().await?;
//!
//! let products = system
//!     .product_details()
//!     .get_product_details_with_retry(&["p1".to_string(), "p2".to_string()])
//!     .await?;
//! println!("fetched {} products", products.len());
//!
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery Semantics
//!
//! At-least-once: queues are non-durable and a failing consumer handler
//! causes nack-with-requeue, so the same message may be delivered to a
//! handler arbitrarily many times. Handlers must be idempotent.

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod resilience;
pub mod services;

pub use config::{BrokerSettings, MessagingSettings, ReconnectSettings, RpcSettings};
pub use error::{OrderCoreError, Result};
pub use messaging::{
    ConnectionState, Delivery, Envelope, MessageBus, MessagingError, MessagingResult,
    MessagingSystem, RpcClient, RpcError, RpcResponder,
};
pub use resilience::RetryPolicy;
pub use services::{ProductDetailsClient, ProductRecord};

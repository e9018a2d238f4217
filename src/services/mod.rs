//! # Service Clients
//!
//! Business-facing clients built on the messaging core. The order flows use
//! these instead of talking to the bus directly.

pub mod product_details;

pub use product_details::{ProductDetailsClient, ProductRecord, PRODUCT_DETAILS_QUEUE};

//! # Product Details Client
//!
//! Fetches product records from the catalog peer service over the broker.
//! The request carries its correlation id and response queue both as message
//! properties and inside the JSON payload, which is the wire contract the
//! peer expects.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::RpcSettings;
use crate::messaging::bus::MessageBus;
use crate::messaging::errors::{MessagingResult, RpcError};
use crate::messaging::rpc::{RpcCall, RpcClient};
use crate::resilience::RetryPolicy;

/// Queue the catalog peer consumes product-details requests from
pub const PRODUCT_DETAILS_QUEUE: &str = "get_products_details";

/// One product record as returned by the catalog peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "_id")]
    pub id: String,
    /// Remaining catalog fields, passed through untouched
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProductDetailsRequest<'a> {
    product_ids: &'a [String],
    correlation_id: &'a str,
    response_queue: &'a str,
}

/// Client for the catalog peer's product-details endpoint
#[derive(Clone)]
pub struct ProductDetailsClient {
    rpc: RpcClient,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ProductDetailsClient {
    pub fn new(bus: Arc<MessageBus>, settings: &RpcSettings) -> Self {
        Self {
            rpc: RpcClient::new(bus),
            timeout: settings.request_timeout,
            retry: settings.retry,
        }
    }

    /// Single-attempt fetch of the given products' details
    pub async fn get_product_details(
        &self,
        product_ids: &[String],
    ) -> Result<Vec<ProductRecord>, RpcError> {
        let call = self.rpc.call(PRODUCT_DETAILS_QUEUE);
        debug!(
            correlation_id = %call.correlation_id(),
            count = product_ids.len(),
            "requesting product details"
        );
        let payload = encode_request(product_ids, &call)?;
        let reply = call.send(payload, self.timeout).await?;
        decode_products(&reply)
    }

    /// Fetch with bounded retry and exponential backoff.
    ///
    /// An empty reply counts as a retryable failure; the catalog peer
    /// answering with no records may be a transient condition.
    pub async fn get_product_details_with_retry(
        &self,
        product_ids: &[String],
    ) -> Result<Vec<ProductRecord>, RpcError> {
        let reply = self
            .rpc
            .request_with_retry(
                PRODUCT_DETAILS_QUEUE,
                |call| encode_request(product_ids, call),
                self.timeout,
                &self.retry,
            )
            .await?;
        decode_products(&reply)
    }
}

impl std::fmt::Debug for ProductDetailsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductDetailsClient")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

fn encode_request(product_ids: &[String], call: &RpcCall) -> MessagingResult<Vec<u8>> {
    let request = ProductDetailsRequest {
        product_ids,
        correlation_id: call.correlation_id(),
        response_queue: call.response_queue(),
    };
    serde_json::to_vec(&request).map_err(Into::into)
}

fn decode_products(reply: &[u8]) -> Result<Vec<ProductRecord>, RpcError> {
    serde_json::from_slice(reply).map_err(RpcError::decode_failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_uses_peer_field_names() {
        let ids = vec!["p1".to_string(), "p2".to_string()];
        let request = ProductDetailsRequest {
            product_ids: &ids,
            correlation_id: "abc",
            response_queue: "get_products_details_response_abc",
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["productIds"], serde_json::json!(["p1", "p2"]));
        assert_eq!(value["correlationId"], "abc");
        assert_eq!(value["responseQueue"], "get_products_details_response_abc");
    }

    #[test]
    fn test_product_record_decoding() {
        let reply = br#"[{"_id":"p1","name":"Widget","price":9.99},{"_id":"p2"}]"#;
        let products = decode_products(reply).unwrap();

        assert_eq!(products.len(), 2);
        assert_eq!(products[0].id, "p1");
        assert_eq!(products[0].fields["name"], "Widget");
        assert_eq!(products[1].id, "p2");
    }

    #[test]
    fn test_malformed_reply_is_a_decode_failure() {
        let err = decode_products(b"not json").unwrap_err();
        assert!(matches!(err, RpcError::DecodeFailed { .. }));
    }
}

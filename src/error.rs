use std::fmt;

use crate::messaging::{MessagingError, RpcError};

#[derive(Debug)]
pub enum OrderCoreError {
    ConfigurationError(String),
    MessagingError(String),
    RpcError(String),
}

impl fmt::Display for OrderCoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderCoreError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
            OrderCoreError::MessagingError(msg) => write!(f, "Messaging error: {msg}"),
            OrderCoreError::RpcError(msg) => write!(f, "RPC error: {msg}"),
        }
    }
}

impl std::error::Error for OrderCoreError {}

impl From<MessagingError> for OrderCoreError {
    fn from(err: MessagingError) -> Self {
        OrderCoreError::MessagingError(err.to_string())
    }
}

impl From<RpcError> for OrderCoreError {
    fn from(err: RpcError) -> Self {
        OrderCoreError::RpcError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrderCoreError>;

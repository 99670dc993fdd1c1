//! Correlated request/response channel to each tenant's remote executor.
//!
//! The server holds at most one executor connection per tenant. Commands
//! carry a correlation id; the executor answers each with exactly one
//! response carrying the same id. Unknown ids are dropped.

pub mod auth;
pub mod client;
pub mod message;
pub mod registry;
pub mod socket;

pub use auth::{AuthError, ExecutorAuth, ExecutorClaims};
pub use client::RpcClient;
pub use message::{actions, CorrelationId, RpcCommand, RpcResponse};
pub use registry::{ConnectionId, ExecutorHandle, ExecutorRegistry};
pub use socket::{executor_ws_handler, ExecutorGateway};

use std::time::Duration;
use thiserror::Error;

use crate::db::TenantId;
use crate::error::{ErrorCode, RelistError};

/// Failure of a single executor call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("executor for tenant {0} is not connected")]
    NotConnected(TenantId),

    #[error("executor disconnected before responding")]
    Disconnected,

    #[error("executor outbound channel is closed")]
    ChannelClosed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("executor reported an error: {0}")]
    Remote(String),

    #[error("failed to encode command: {0}")]
    Encode(String),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotConnected(_) => ErrorCode::ExecutorNotConnected,
            Self::Disconnected => ErrorCode::ExecutorDisconnected,
            Self::ChannelClosed => ErrorCode::RpcChannelClosed,
            Self::Timeout(_) => ErrorCode::RpcTimeout,
            Self::Remote(_) => ErrorCode::RpcRemoteError,
            Self::Encode(_) => ErrorCode::SerializationError,
        }
    }

    /// Label used for the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "not_connected",
            Self::Disconnected => "disconnected",
            Self::ChannelClosed => "channel_closed",
            Self::Timeout(_) => "timeout",
            Self::Remote(_) => "remote_error",
            Self::Encode(_) => "encode_error",
        }
    }
}

impl From<RpcError> for RelistError {
    fn from(err: RpcError) -> Self {
        let message = err.to_string();
        RelistError::new(err.code(), message).with_context("outcome", err.outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_codes() {
        let tenant = TenantId::parse("acme").unwrap();
        let err: RelistError = RpcError::NotConnected(tenant).into();
        assert_eq!(err.code(), ErrorCode::ExecutorNotConnected);
        assert!(!err.is_retryable());

        let err: RelistError = RpcError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(err.code(), ErrorCode::RpcTimeout);
        assert!(err.is_retryable());

        let err: RelistError = RpcError::Remote("listing rejected".into()).into();
        assert_eq!(err.code(), ErrorCode::RpcRemoteError);
        assert!(!err.is_retryable());
    }
}

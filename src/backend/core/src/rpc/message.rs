//! Wire shapes exchanged with the executor.
//!
//! Outbound: `{"correlation_id", "action", "payload"}`
//! Inbound:  `{"correlation_id", "success", "data" | "error"}`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Executor action names.
pub mod actions {
    /// HTTP-shaped request against the marketplace from the executor's session.
    pub const API_REQUEST: &str = "api_request";
    /// Lightweight liveness check of the remote session.
    pub const PING: &str = "ping";
    /// Fetch a media file and upload it to the marketplace.
    pub const UPLOAD_MEDIA: &str = "upload_media";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command sent to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCommand {
    pub correlation_id: CorrelationId,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response sent back by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(correlation_id: CorrelationId, data: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let command = RpcCommand {
            correlation_id: CorrelationId(Uuid::nil()),
            action: actions::PING.to_string(),
            payload: json!({}),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({
                "correlation_id": "00000000-0000-0000-0000-000000000000",
                "action": "ping",
                "payload": {}
            })
        );
    }

    #[test]
    fn test_response_without_data() {
        let response: RpcResponse = serde_json::from_value(json!({
            "correlation_id": "00000000-0000-0000-0000-000000000000",
            "success": false,
            "error": "session expired"
        }))
        .unwrap();
        assert!(!response.success);
        assert_eq!(response.data, None);
        assert_eq!(response.error.as_deref(), Some("session expired"));
    }
}

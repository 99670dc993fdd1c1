//! Typed job and task payloads.
//!
//! Payloads are persisted as JSON inside a versioned envelope so each
//! handler decodes only the shapes it owns.

use serde::{Deserialize, Serialize};

use super::action::ActionCode;
use crate::error::{RelistError, Result};

/// Current payload schema version.
pub const PAYLOAD_VERSION: u16 = 1;

/// Schema-versioned wrapper around a payload body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope<T> {
    pub version: u16,
    pub body: T,
}

impl<T> PayloadEnvelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            body,
        }
    }
}

impl<T> PayloadEnvelope<T>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    /// Decode a stored envelope, rejecting versions this build cannot read.
    pub fn decode(value: serde_json::Value) -> Result<Self> {
        let envelope: Self = serde_json::from_value(value)?;
        if envelope.version == 0 || envelope.version > PAYLOAD_VERSION {
            return Err(RelistError::invalid_payload(format!(
                "Unsupported payload version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Input of a job, one variant per action.
///
/// `listing` is the marketplace-specific document produced by the
/// translation layer; the core stores it without interpreting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    Publish {
        listing: serde_json::Value,
        #[serde(default)]
        photos: Vec<String>,
    },
    Update {
        remote_id: String,
        listing: serde_json::Value,
    },
    Delete {
        remote_id: String,
    },
    Sync {
        #[serde(default)]
        cursor: Option<String>,
    },
    CheckConnection,
    Upload {
        #[serde(default)]
        remote_id: Option<String>,
        urls: Vec<String>,
    },
}

impl JobInput {
    pub fn action(&self) -> ActionCode {
        match self {
            Self::Publish { .. } => ActionCode::Publish,
            Self::Update { .. } => ActionCode::Update,
            Self::Delete { .. } => ActionCode::Delete,
            Self::Sync { .. } => ActionCode::Sync,
            Self::CheckConnection => ActionCode::CheckConnection,
            Self::Upload { .. } => ActionCode::Upload,
        }
    }

    /// Reject an input that belongs to another action.
    pub fn ensure_action(&self, action: ActionCode) -> Result<()> {
        if self.action() != action {
            return Err(RelistError::invalid_payload(format!(
                "Input of kind {} does not match action {}",
                self.action(),
                action
            )));
        }
        Ok(())
    }
}

/// Result of a completed job, one variant per action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    Published {
        remote_id: String,
        #[serde(default)]
        url: Option<String>,
    },
    Updated {
        remote_id: String,
    },
    Deleted {
        remote_id: String,
    },
    Synced {
        items: u32,
        #[serde(default)]
        next_cursor: Option<String>,
    },
    Connection {
        connected: bool,
        #[serde(default)]
        account: Option<String>,
    },
    Uploaded {
        media_ids: Vec<String>,
    },
}

/// HTTP method of an executor-side request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// What a task asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRequest {
    /// HTTP-shaped call performed by the executor inside the marketplace session.
    Rpc {
        method: HttpMethod,
        path: String,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    /// Local bookkeeping write, e.g. recording a listing id on the product.
    Storage {
        key: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    /// Media transfer performed by the executor.
    Transfer { url: String },
}

impl TaskRequest {
    pub fn task_type(&self) -> &'static str {
        match self {
            Self::Rpc { .. } => "rpc",
            Self::Storage { .. } => "storage",
            Self::Transfer { .. } => "transfer",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Storage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_wire_shape() {
        let input = JobInput::Delete {
            remote_id: "881".to_string(),
        };
        let value = serde_json::to_value(PayloadEnvelope::new(input)).unwrap();
        assert_eq!(
            value,
            json!({"version": 1, "body": {"kind": "delete", "remote_id": "881"}})
        );
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let value = json!({"version": 9, "body": {"kind": "check_connection"}});
        assert!(PayloadEnvelope::<JobInput>::decode(value).is_err());
    }

    #[test]
    fn test_ensure_action() {
        let input = JobInput::Sync { cursor: None };
        assert!(input.ensure_action(ActionCode::Sync).is_ok());
        assert!(input.ensure_action(ActionCode::Publish).is_err());
    }

    #[test]
    fn test_task_request_tagging() {
        let request: TaskRequest = serde_json::from_value(json!({
            "type": "rpc",
            "method": "POST",
            "path": "/api/v2/items",
        }))
        .unwrap();
        assert_eq!(request.task_type(), "rpc");
        assert!(request.is_remote());
    }
}

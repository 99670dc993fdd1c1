//! Correlated calls over the executor registry.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::message::{actions, CorrelationId, RpcCommand, RpcResponse};
use super::registry::{ConnectionId, ExecutorRegistry};
use super::RpcError;
use crate::config::RpcTimeouts;
use crate::db::TenantId;
use crate::jobs::{HttpMethod, RpcClass};
use crate::observability::metrics;

type Reply = std::result::Result<Value, RpcError>;

#[derive(Debug)]
struct PendingSlot {
    tenant: TenantId,
    connection_id: ConnectionId,
    reply: oneshot::Sender<Reply>,
}

type PendingMap = DashMap<CorrelationId, PendingSlot>;

/// Removes the pending slot when the call ends, whichever way it ends.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
        metrics::set_rpc_pending(self.pending.len());
    }
}

/// Client for sending commands to tenant executors.
#[derive(Clone)]
pub struct RpcClient {
    registry: Arc<ExecutorRegistry>,
    pending: Arc<PendingMap>,
    timeouts: RpcTimeouts,
}

impl RpcClient {
    pub fn new(registry: Arc<ExecutorRegistry>, timeouts: RpcTimeouts) -> Self {
        Self {
            registry,
            pending: Arc::new(DashMap::new()),
            timeouts,
        }
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Default timeout for an action class.
    pub fn timeout_for(&self, class: RpcClass) -> Duration {
        match class {
            RpcClass::Ping => self.timeouts.ping,
            RpcClass::Read => self.timeouts.read,
            RpcClass::Write => self.timeouts.write,
            RpcClass::Upload => self.timeouts.upload,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send one command and wait for its response.
    ///
    /// Fails immediately when the tenant has no executor. The timeout covers
    /// both waiting for room in the outbound queue and waiting for the reply.
    #[tracing::instrument(skip_all, fields(tenant = %tenant, action = %action))]
    pub async fn call(
        &self,
        tenant: &TenantId,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Reply {
        let result = self.call_inner(tenant, action, payload, timeout).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        };
        metrics::record_rpc(action, outcome);
        result
    }

    async fn call_inner(
        &self,
        tenant: &TenantId,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Reply {
        let handle = self
            .registry
            .get(tenant)
            .ok_or_else(|| RpcError::NotConnected(tenant.clone()))?;

        let deadline = Instant::now() + timeout;
        let correlation_id = CorrelationId::new();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.pending.insert(
            correlation_id,
            PendingSlot {
                tenant: tenant.clone(),
                connection_id: handle.connection_id,
                reply: reply_tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: correlation_id,
        };
        metrics::set_rpc_pending(self.pending.len());

        let command = RpcCommand {
            correlation_id,
            action: action.to_string(),
            payload,
        };

        debug!(correlation_id = %correlation_id, "Sending executor command");
        match tokio::time::timeout_at(deadline, handle.sender().send(command)).await {
            Err(_) => return Err(RpcError::Timeout(timeout)),
            Ok(Err(_)) => return Err(RpcError::ChannelClosed),
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Err(_) => {
                warn!(correlation_id = %correlation_id, ?timeout, "Executor call timed out");
                Err(RpcError::Timeout(timeout))
            }
            // Slot dropped without a reply.
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Ok(Ok(reply)) => reply,
        }
    }

    /// Deliver a response from `tenant`'s executor. Returns `false` when no
    /// call of that tenant is waiting on the correlation id.
    pub fn resolve(&self, tenant: &TenantId, response: RpcResponse) -> bool {
        let Some((_, slot)) = self
            .pending
            .remove_if(&response.correlation_id, |_, slot| slot.tenant == *tenant)
        else {
            warn!(
                tenant = %tenant,
                correlation_id = %response.correlation_id,
                "Dropping response with no pending request"
            );
            return false;
        };
        metrics::set_rpc_pending(self.pending.len());

        let reply = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(RpcError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "unspecified executor error".to_string()),
            ))
        };

        // The caller may have timed out between remove and send.
        slot.reply.send(reply).is_ok()
    }

    /// Fail every call waiting on a connection that went away.
    pub fn fail_connection(&self, tenant: &TenantId, connection_id: ConnectionId) -> usize {
        let ids: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.tenant == *tenant && entry.connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.reply.send(Err(RpcError::Disconnected));
                failed += 1;
            }
        }
        metrics::set_rpc_pending(self.pending.len());
        failed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience calls
    // ─────────────────────────────────────────────────────────────────────────

    /// HTTP-shaped request performed from the executor's marketplace session.
    pub async fn http_request(
        &self,
        tenant: &TenantId,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> Reply {
        let payload = json!({
            "method": method,
            "path": path,
            "body": body,
        });
        self.call(tenant, actions::API_REQUEST, payload, timeout).await
    }

    pub async fn ping(&self, tenant: &TenantId, timeout: Duration) -> Reply {
        self.call(tenant, actions::PING, json!({}), timeout).await
    }

    /// Have the executor fetch `url` and upload it, optionally to an existing listing.
    pub async fn upload(
        &self,
        tenant: &TenantId,
        url: &str,
        remote_id: Option<&str>,
        timeout: Duration,
    ) -> Reply {
        let payload = json!({
            "url": url,
            "remote_id": remote_id,
        });
        self.call(tenant, actions::UPLOAD_MEDIA, payload, timeout).await
    }
}

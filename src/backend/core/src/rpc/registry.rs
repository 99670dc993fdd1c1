//! Process-wide tenant -> executor connection registry.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::message::RpcCommand;
use crate::db::TenantId;
use crate::observability::metrics;

/// Identity of one physical executor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending side of a live executor connection.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    pub connection_id: ConnectionId,
    pub tenant: TenantId,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<RpcCommand>,
    close: CancellationToken,
}

impl ExecutorHandle {
    /// Create a handle and the receiver its connection task drains.
    pub fn new(tenant: TenantId, buffer: usize) -> (Self, mpsc::Receiver<RpcCommand>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let handle = Self {
            connection_id: ConnectionId::new(),
            tenant,
            connected_at: Utc::now(),
            outbound,
            close: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn sender(&self) -> &mpsc::Sender<RpcCommand> {
        &self.outbound
    }

    /// Ask the connection task to shut down.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }
}

/// At most one [`ExecutorHandle`] per tenant.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    connections: RwLock<HashMap<TenantId, ExecutorHandle>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one for the tenant.
    /// The displaced handle is closed and returned.
    pub fn attach(&self, handle: ExecutorHandle) -> Option<ExecutorHandle> {
        let (displaced, count) = {
            let mut connections = self.connections.write();
            let displaced = connections.insert(handle.tenant.clone(), handle.clone());
            (displaced, connections.len())
        };
        metrics::set_executor_connections(count);

        if let Some(old) = &displaced {
            old.close();
            info!(
                tenant = %handle.tenant,
                old_connection = %old.connection_id,
                new_connection = %handle.connection_id,
                "Executor connection replaced"
            );
        } else {
            info!(tenant = %handle.tenant, connection = %handle.connection_id, "Executor connected");
        }
        displaced
    }

    /// Remove the tenant's entry only if it is still `connection_id`.
    pub fn detach(&self, tenant: &TenantId, connection_id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut connections = self.connections.write();
            let current = connections.get(tenant).map(|h| h.connection_id);
            let removed = current == Some(connection_id);
            if removed {
                connections.remove(tenant);
            }
            (removed, connections.len())
        };
        if removed {
            metrics::set_executor_connections(count);
            info!(tenant = %tenant, connection = %connection_id, "Executor disconnected");
        }
        removed
    }

    pub fn get(&self, tenant: &TenantId) -> Option<ExecutorHandle> {
        self.connections.read().get(tenant).cloned()
    }

    pub fn is_connected(&self, tenant: &TenantId) -> bool {
        self.connections.read().contains_key(tenant)
    }

    pub fn connected_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<_> = self.connections.read().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

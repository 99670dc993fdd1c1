//! WebSocket transport for executor connections.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::auth::{bearer_token, ExecutorAuth};
use super::client::RpcClient;
use super::message::{RpcCommand, RpcResponse};
use super::registry::ExecutorHandle;
use crate::db::{Tenant, TenantId};
use crate::error::RelistError;

/// Wires authenticated executor connections into the registry and client.
pub struct ExecutorGateway {
    auth: ExecutorAuth,
    client: RpcClient,
    outbound_buffer: usize,
}

impl ExecutorGateway {
    pub fn new(auth: ExecutorAuth, client: RpcClient, outbound_buffer: usize) -> Self {
        Self {
            auth,
            client,
            outbound_buffer,
        }
    }

    pub fn auth(&self) -> &ExecutorAuth {
        &self.auth
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Register a new connection for `tenant`, displacing any previous one.
    pub fn connect(&self, tenant: TenantId) -> (ExecutorHandle, mpsc::Receiver<RpcCommand>) {
        let (handle, rx) = ExecutorHandle::new(tenant, self.outbound_buffer);
        self.client.registry().attach(handle.clone());
        (handle, rx)
    }

    /// Tear down a connection: unregister it and fail its in-flight calls.
    pub fn disconnect(&self, handle: &ExecutorHandle) {
        self.client
            .registry()
            .detach(&handle.tenant, handle.connection_id);
        let failed = self.client.fail_connection(&handle.tenant, handle.connection_id);
        if failed > 0 {
            warn!(tenant = %handle.tenant, failed, "Failed in-flight calls of closed connection");
        }
    }

    /// Handle one inbound text frame.
    pub fn on_frame(&self, tenant: &TenantId, text: &str) {
        match serde_json::from_str::<RpcResponse>(text) {
            Ok(response) => {
                self.client.resolve(tenant, response);
            }
            Err(e) => warn!(tenant = %tenant, error = %e, "Ignoring malformed executor frame"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutorQuery {
    pub token: Option<String>,
    pub tenant_id: Option<String>,
}

/// `GET /executor/ws`. Authenticates before upgrading.
pub async fn executor_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<ExecutorQuery>,
    State(gateway): State<Arc<ExecutorGateway>>,
) -> Result<Response, RelistError> {
    let token = bearer_token(&headers).or(query.token.as_deref());
    let tenant = gateway
        .auth
        .authenticate(token, query.tenant_id.as_deref())
        .await
        .map_err(|e| {
            warn!(error = %e, "Executor handshake rejected");
            RelistError::from(e)
        })?;

    Ok(ws.on_upgrade(move |socket| serve_socket(socket, tenant, gateway)))
}

async fn serve_socket(socket: WebSocket, tenant: Tenant, gateway: Arc<ExecutorGateway>) {
    let (handle, mut outbound) = gateway.connect(tenant.id.clone());
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let forward = {
        let handle = handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = outbound.recv() => {
                        let Some(command) = command else { break };
                        let json = match serde_json::to_string(&command) {
                            Ok(json) => json,
                            Err(e) => {
                                error!(error = %e, "Failed to encode executor command");
                                continue;
                            }
                        };
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    _ = handle.closed() => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        })
    };

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => gateway.on_frame(&tenant.id, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(tenant = %tenant.id, "Executor closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(tenant = %tenant.id, error = %e, "Executor socket error");
                        break;
                    }
                    // Pings are answered by axum.
                    Some(Ok(_)) => {}
                }
            }
            _ = handle.closed() => {
                info!(tenant = %tenant.id, connection = %handle.connection_id, "Connection replaced");
                break;
            }
        }
    }

    gateway.disconnect(&handle);
    forward.abort();
}

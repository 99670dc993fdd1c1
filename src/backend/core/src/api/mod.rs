//! HTTP surface: health, Prometheus metrics and the executor socket.

mod handlers;

use axum::{extract::FromRef, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::keepalive::KeepaliveService;
use crate::rpc::{executor_ws_handler, ExecutorGateway};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ExecutorGateway>,
    pub keepalive: KeepaliveService,
    /// Absent when no Prometheus recorder was installed.
    pub prometheus: Option<PrometheusHandle>,
}

impl FromRef<AppState> for Arc<ExecutorGateway> {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/executor/ws", get(executor_ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, KeepaliveConfig};
    use crate::db::{InMemoryTenantDirectory, Tenant, TenantId};
    use crate::rpc::{ExecutorAuth, ExecutorRegistry, RpcClient};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> AppState {
        let config = ExecutorConfig::default();
        let tenant = Tenant::new(TenantId::parse("acme").unwrap());
        let directory = Arc::new(InMemoryTenantDirectory::with_tenants([tenant]));
        let rpc = RpcClient::new(Arc::new(ExecutorRegistry::new()), config.timeouts.clone());
        let auth = ExecutorAuth::new(&config, directory);
        AppState {
            gateway: Arc::new(ExecutorGateway::new(auth, rpc.clone(), config.outbound_buffer)),
            keepalive: KeepaliveService::new(rpc, KeepaliveConfig::default()),
            prometheus: None,
        }
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let response = build_router(state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let state = state();
        let tenant = TenantId::parse("acme").unwrap();
        let (_handle, _rx) = state.gateway.connect(tenant);

        let response = build_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["executors"]["connected"], 1);
    }
}

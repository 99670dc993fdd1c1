//! HTTP request handlers.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use super::AppState;
use crate::db::TenantId;
use crate::keepalive::SessionHealth;

#[derive(Serialize)]
struct SessionReport {
    tenant: TenantId,
    #[serde(flatten)]
    health: SessionHealth,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.gateway.client().registry();
    let sessions: Vec<SessionReport> = state
        .keepalive
        .snapshot()
        .into_iter()
        .map(|(tenant, health)| SessionReport { tenant, health })
        .collect();

    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "executors": {
            "connected": registry.len(),
            "sessions": sessions,
        },
    }))
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

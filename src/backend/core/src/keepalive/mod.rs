//! Periodic liveness pings to every connected executor.
//!
//! A failed ping is retried with exponential backoff. Once the attempts are
//! used up the session is marked degraded; the next success marks it
//! healthy again. Rounds are spread by ±20% of the interval so many
//! replicas do not ping in step. Nothing here touches jobs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::KeepaliveConfig;
use crate::db::TenantId;
use crate::jobs::BackoffStrategy;
use crate::observability::metrics;
use crate::rpc::RpcClient;

const INTERVAL_JITTER: f64 = 0.2;

/// Next round's delay: `interval` scaled by a random factor in `[0.8, 1.2]`.
fn jittered_interval(interval: Duration) -> Duration {
    let factor = rand::rng().random_range(1.0 - INTERVAL_JITTER..=1.0 + INTERVAL_JITTER);
    interval.mul_f64(factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Healthy,
    Degraded,
    /// Connected but not pinged yet.
    Unknown,
}

/// What the last pings said about one tenant's executor session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionHealth {
    pub state: SessionState,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self {
            state: SessionState::Unknown,
            last_success: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Clone)]
pub struct KeepaliveService {
    rpc: RpcClient,
    config: KeepaliveConfig,
    backoff: BackoffStrategy,
    sessions: Arc<DashMap<TenantId, SessionHealth>>,
}

impl KeepaliveService {
    pub fn new(rpc: RpcClient, config: KeepaliveConfig) -> Self {
        let backoff = BackoffStrategy::exponential(config.backoff_base, config.backoff_max);
        Self {
            rpc,
            config,
            backoff,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Health of a tenant's session; `Unknown` when never pinged.
    pub fn health(&self, tenant: &TenantId) -> SessionHealth {
        self.sessions
            .get(tenant)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Every tracked session, sorted by tenant.
    pub fn snapshot(&self) -> Vec<(TenantId, SessionHealth)> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    /// Ping one tenant, retrying up to `max_attempts` times.
    pub async fn ping_tenant(&self, tenant: &TenantId) -> SessionHealth {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.rpc.ping(tenant, self.config.timeout).await {
                Ok(_) => {
                    metrics::record_keepalive("success");
                    let health = SessionHealth {
                        state: SessionState::Healthy,
                        last_success: Some(Utc::now()),
                        consecutive_failures: 0,
                        last_error: None,
                    };
                    self.sessions.insert(tenant.clone(), health.clone());
                    debug!(tenant = %tenant, attempt, "Keepalive ok");
                    return health;
                }
                Err(e) => {
                    metrics::record_keepalive("failure");
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(tenant = %tenant, attempt, ?delay, error = %e, "Keepalive failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let mut entry = self.sessions.entry(tenant.clone()).or_default();
        entry.state = SessionState::Degraded;
        entry.consecutive_failures += attempts;
        entry.last_error = Some(last_error);
        warn!(
            tenant = %tenant,
            consecutive_failures = entry.consecutive_failures,
            error = ?entry.last_error,
            "Executor session degraded"
        );
        entry.value().clone()
    }

    /// Ping every connected tenant concurrently. Sessions of tenants that
    /// are no longer connected are forgotten.
    pub async fn run_once(&self) {
        let connected = self.rpc.registry().connected_tenants();
        self.sessions.retain(|tenant, _| connected.contains(tenant));
        join_all(connected.iter().map(|tenant| self.ping_tenant(tenant))).await;
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "Keepalive service started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(jittered_interval(self.config.interval)) => {
                    self.run_once().await;
                }
            }
        }
        info!("Keepalive service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcTimeouts;
    use crate::rpc::{ExecutorHandle, ExecutorRegistry, RpcResponse};

    fn service(registry: Arc<ExecutorRegistry>) -> (KeepaliveService, RpcClient) {
        let rpc = RpcClient::new(registry, RpcTimeouts::default());
        let config = KeepaliveConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(1),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
        };
        (KeepaliveService::new(rpc.clone(), config), rpc)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pings_degrade_session() {
        let registry = Arc::new(ExecutorRegistry::new());
        let tenant = TenantId::parse("acme").unwrap();
        let (handle, mut rx) = ExecutorHandle::new(tenant.clone(), 8);
        registry.attach(handle);
        let (keepalive, _) = service(registry);

        // Swallow commands without answering.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let health = keepalive.ping_tenant(&tenant).await;
        assert_eq!(health.state, SessionState::Degraded);
        assert_eq!(health.consecutive_failures, 3);
        assert!(health.last_success.is_none());
    }

    #[tokio::test]
    async fn test_answered_ping_marks_healthy() {
        let registry = Arc::new(ExecutorRegistry::new());
        let tenant = TenantId::parse("acme").unwrap();
        let (handle, mut rx) = ExecutorHandle::new(tenant.clone(), 8);
        registry.attach(handle);
        let (keepalive, rpc) = service(registry);

        let responder_tenant = tenant.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                rpc.resolve(
                    &responder_tenant,
                    RpcResponse::ok(command.correlation_id, serde_json::json!({"pong": true})),
                );
            }
        });

        assert_eq!(keepalive.health(&tenant).state, SessionState::Unknown);
        let health = keepalive.ping_tenant(&tenant).await;
        assert_eq!(health.state, SessionState::Healthy);
        assert!(health.last_success.is_some());
        assert_eq!(keepalive.health(&tenant), health);
    }

    #[tokio::test]
    async fn test_disconnected_tenant_is_forgotten() {
        let registry = Arc::new(ExecutorRegistry::new());
        let tenant = TenantId::parse("acme").unwrap();
        let (keepalive, _) = service(registry);

        keepalive.sessions.insert(tenant.clone(), SessionHealth::default());
        keepalive.run_once().await;
        assert!(keepalive.snapshot().is_empty());
    }

    #[test]
    fn test_interval_jitter_stays_within_a_fifth() {
        let interval = Duration::from_secs(60);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let delay = jittered_interval(interval);
            assert!(delay >= Duration::from_secs(48));
            assert!(delay <= Duration::from_secs(72));
            seen.insert(delay.as_millis());
        }
        assert!(seen.len() > 1);
    }
}

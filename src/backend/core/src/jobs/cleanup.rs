//! Periodic sweep over every tenant namespace.
//!
//! Two rules, each applied per tenant:
//!
//! - PENDING or PAUSED jobs past `expires_at` become EXPIRED
//! - RUNNING jobs started before `now - stuck_threshold` become FAILED,
//!   unless a live worker still holds the job row or its product

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use super::processor::TerminalHooks;
use super::store::JobStore;
use crate::config::CleanupConfig;
use crate::db::{Tenant, TenantDirectory};
use crate::error::{RelistError, Result};
use crate::observability::metrics;

/// Totals of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tenants_scanned: u64,
    pub expired: u64,
    pub failed_stuck: u64,
    /// Stuck candidates held by a live worker; revisited next sweep.
    pub skipped_locked: u64,
    /// Tenants whose sweep errored.
    pub errors: u64,
}

#[derive(Clone)]
pub struct CleanupScheduler {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn TenantDirectory>,
    hooks: TerminalHooks,
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        directory: Arc<dyn TenantDirectory>,
        hooks: TerminalHooks,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            directory,
            hooks,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<CleanupReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let threshold = chrono::Duration::from_std(self.config.stuck_threshold)
            .map_err(|_| RelistError::configuration("Stuck threshold out of range"))?;
        let started_before = now - threshold;

        let tenants = self.directory.active_tenants().await?;
        let mut report = CleanupReport::default();

        for tenant in tenants {
            report.tenants_scanned += 1;
            let span = info_span!("cleanup", tenant = %tenant.id);
            match self.sweep_tenant(&tenant, now, started_before, &mut report).instrument(span).await {
                Ok(()) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(tenant = %tenant.id, error = %e, "Cleanup sweep failed for tenant");
                }
            }
        }

        metrics::record_cleanup("expired", report.expired);
        metrics::record_cleanup("stuck", report.failed_stuck);

        if report.expired + report.failed_stuck + report.errors > 0 {
            info!(
                tenants = report.tenants_scanned,
                expired = report.expired,
                failed_stuck = report.failed_stuck,
                skipped_locked = report.skipped_locked,
                errors = report.errors,
                "Cleanup sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_tenant(
        &self,
        tenant: &Tenant,
        now: DateTime<Utc>,
        started_before: DateTime<Utc>,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let expired = self.store.expire_stale(tenant, now).await?;
        report.expired += expired.len() as u64;
        for job in &expired {
            self.hooks.apply(tenant, job).await;
        }

        let stuck = self.store.fail_stuck(tenant, started_before).await?;
        report.failed_stuck += stuck.failed.len() as u64;
        report.skipped_locked += stuck.skipped_locked;
        for job in &stuck.failed {
            warn!(job_id = %job.id, started_at = ?job.started_at, "Failed stuck job");
            self.hooks.apply(tenant, job).await;
        }
        Ok(())
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval: Duration = self.config.interval;
        info!(?interval, "Cleanup scheduler started");

        if self.config.run_on_start {
            self.log_errors(self.run_once().await);
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    self.log_errors(self.run_once().await);
                }
            }
        }
        info!("Cleanup scheduler stopped");
    }

    fn log_errors(&self, result: Result<CleanupReport>) {
        if let Err(e) = result {
            e.log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryTenantDirectory, TenantId};
    use crate::jobs::action::{ActionCode, Marketplace};
    use crate::jobs::job::{JobPriority, JobStatus, NewJob};
    use crate::jobs::payload::{JobInput, PayloadEnvelope};
    use crate::jobs::stats::InMemoryStatsSink;
    use crate::jobs::store::{InMemoryJobStore, EXPIRED_MESSAGE};

    fn sync_job(key: &str, expires_at: DateTime<Utc>) -> NewJob {
        NewJob {
            batch_id: None,
            marketplace: Marketplace::Vinted,
            action: ActionCode::Sync,
            product_id: None,
            idempotency_key: key.into(),
            priority: JobPriority::Low,
            max_retries: 0,
            input: PayloadEnvelope::new(JobInput::Sync { cursor: None }),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_inactive_tenants_are_not_swept() {
        let store = Arc::new(InMemoryJobStore::new());
        let acme = Tenant::new(TenantId::parse("acme").unwrap());
        let mut dormant = Tenant::new(TenantId::parse("dormant").unwrap());
        dormant.active = false;

        let past = Utc::now() - chrono::Duration::minutes(5);
        store.insert_job(&acme, sync_job("a", past)).await.unwrap();
        let kept = store.insert_job(&dormant, sync_job("d", past)).await.unwrap();

        let directory = Arc::new(InMemoryTenantDirectory::with_tenants([acme.clone(), dormant.clone()]));
        let stats = Arc::new(InMemoryStatsSink::new());
        let hooks = TerminalHooks::new(store.clone(), stats.clone());
        let scheduler = CleanupScheduler::new(store.clone(), directory, hooks, CleanupConfig::default());

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.tenants_scanned, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(stats.recorded(), 0);

        let untouched = store.get_job(&dormant, kept.id).await.unwrap();
        assert_eq!(untouched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_expired_job_carries_message() {
        let store = Arc::new(InMemoryJobStore::new());
        let acme = Tenant::new(TenantId::parse("acme").unwrap());
        let job = store
            .insert_job(&acme, sync_job("old", Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let directory = Arc::new(InMemoryTenantDirectory::with_tenants([acme.clone()]));
        let hooks = TerminalHooks::new(store.clone(), Arc::new(InMemoryStatsSink::new()));
        let scheduler = CleanupScheduler::new(store.clone(), directory, hooks, CleanupConfig::default());
        scheduler.run_once().await.unwrap();

        let expired = store.get_job(&acme, job.id).await.unwrap();
        assert_eq!(expired.status, JobStatus::Expired);
        assert_eq!(expired.error_message.as_deref(), Some(EXPIRED_MESSAGE));

        // A second sweep finds nothing.
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.expired, 0);
    }
}

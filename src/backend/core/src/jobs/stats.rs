//! Per-action daily job statistics.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;

use super::action::{ActionCode, Marketplace};
use super::job::Job;
use crate::db::{begin_tenant_tx, Tenant, TenantId};
use crate::error::Result;

/// Receives every terminal job transition that ran (or could have run).
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record(&self, tenant: &Tenant, job: &Job, success: bool) -> Result<()>;
}

/// Day a finished job is accounted to.
fn stats_date(job: &Job) -> NaiveDate {
    job.completed_at.unwrap_or(job.created_at).date_naive()
}

/// Upserts `job_stats` rows in the tenant's namespace.
#[derive(Clone)]
pub struct PgStatsSink {
    pool: PgPool,
}

impl PgStatsSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatsSink for PgStatsSink {
    async fn record(&self, tenant: &Tenant, job: &Job, success: bool) -> Result<()> {
        let duration_ms = job.duration_secs().map(|secs| secs * 1000.0);

        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        sqlx::query(
            r#"
            INSERT INTO job_stats (action_code, marketplace, date, total, success, failure, timed, avg_duration_ms)
            VALUES ($1, $2, $3, 1, $4, $5, $6, COALESCE($7, 0))
            ON CONFLICT (action_code, marketplace, date) DO UPDATE SET
                total = job_stats.total + 1,
                success = job_stats.success + EXCLUDED.success,
                failure = job_stats.failure + EXCLUDED.failure,
                timed = job_stats.timed + EXCLUDED.timed,
                avg_duration_ms = CASE
                    WHEN $7::double precision IS NULL THEN job_stats.avg_duration_ms
                    ELSE (job_stats.avg_duration_ms * job_stats.timed + $7) / (job_stats.timed + 1)
                END
            "#,
        )
        .bind(job.action.as_str())
        .bind(job.marketplace.as_str())
        .bind(stats_date(job))
        .bind(i64::from(success))
        .bind(i64::from(!success))
        .bind(i64::from(duration_ms.is_some()))
        .bind(duration_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// One row of daily statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DailyStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub timed: u64,
    pub avg_duration_ms: f64,
}

impl DailyStats {
    fn add(&mut self, success: bool, duration_ms: Option<f64>) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        if let Some(duration_ms) = duration_ms {
            self.avg_duration_ms =
                (self.avg_duration_ms * self.timed as f64 + duration_ms) / (self.timed + 1) as f64;
            self.timed += 1;
        }
    }
}

type StatsKey = (TenantId, ActionCode, Marketplace, NaiveDate);

/// Statistics kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryStatsSink {
    rows: Mutex<HashMap<StatsKey, DailyStats>>,
}

impl InMemoryStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        tenant: &TenantId,
        action: ActionCode,
        marketplace: Marketplace,
        date: NaiveDate,
    ) -> Option<DailyStats> {
        self.rows
            .lock()
            .get(&(tenant.clone(), action, marketplace, date))
            .copied()
    }

    /// Sum of `total` over every row.
    pub fn recorded(&self) -> u64 {
        self.rows.lock().values().map(|s| s.total).sum()
    }
}

#[async_trait]
impl StatsSink for InMemoryStatsSink {
    async fn record(&self, tenant: &Tenant, job: &Job, success: bool) -> Result<()> {
        let key = (tenant.id.clone(), job.action, job.marketplace, stats_date(job));
        self.rows
            .lock()
            .entry(key)
            .or_default()
            .add(success, job.duration_secs().map(|secs| secs * 1000.0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        let mut stats = DailyStats::default();
        stats.add(true, Some(100.0));
        stats.add(false, Some(300.0));
        stats.add(false, None);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 2);
        assert_eq!(stats.timed, 2);
        assert!((stats.avg_duration_ms - 200.0).abs() < f64::EPSILON);
    }
}

//! Job, task and batch persistence.
//!
//! Two backends implement [`JobStore`]:
//!
//! - [`PgJobStore`]: one Postgres schema per tenant
//! - [`InMemoryJobStore`]: process-local, for tests and development
//!
//! Both enforce the same claim discipline: a mutating job is claimed only
//! while holding a non-blocking exclusive lock on its product, and only if no
//! other job on that product is RUNNING. The lock never outlives the claim.

mod memory;
mod postgres;

pub use memory::{InMemoryJobStore, ProductLockGuard};
pub use postgres::PgJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::action::{ActionCode, Marketplace};
use super::job::{Batch, BatchId, BatchProgress, Job, JobId, JobPriority, JobStatus, NewJob, ProductId, Task, TaskSpec};
use super::payload::{JobOutput, PayloadEnvelope};
use crate::db::Tenant;
use crate::error::Result;

/// Message recorded on jobs failed by the stuck-worker sweep.
pub const WORKER_LOST_MESSAGE: &str = "Worker lost: job exceeded the stuck threshold while RUNNING";

/// Message recorded on jobs expired by the cleanup sweep.
pub const EXPIRED_MESSAGE: &str = "Expired: job was not processed within the expiry window";

/// Result of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The job is now RUNNING and owned by the caller.
    Claimed(Job),
    /// The product is locked or already has a RUNNING job. The job stays PENDING.
    Conflict,
    /// The job is no longer PENDING (claimed elsewhere, cancelled, paused).
    Unavailable,
    /// The product no longer exists; the job was failed in the claim transaction.
    Rejected(Job),
}

/// Terminal transition requested by the processor.
#[derive(Debug, Clone)]
pub enum Finish {
    /// RUNNING -> COMPLETED
    Completed { result: PayloadEnvelope<JobOutput> },
    /// RUNNING -> FAILED
    Failed { step: String, message: String },
    /// any non-terminal -> CANCELLED, cancelling unfinished tasks
    Cancelled,
}

impl Finish {
    pub fn target(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }

    /// Statuses the transition may start from.
    pub fn sources(&self) -> &'static [JobStatus] {
        match self {
            Self::Completed { .. } | Self::Failed { .. } => &[JobStatus::Running],
            Self::Cancelled => &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused],
        }
    }
}

/// A batch about to be inserted.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub marketplace: Marketplace,
    pub action: ActionCode,
    pub priority: JobPriority,
    pub created_by: Option<String>,
}

/// What a running handler needs to know at a safe point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub pause_requested: bool,
}

/// Outcome of the stuck-worker sweep for one tenant.
#[derive(Debug, Default)]
pub struct StuckSweep {
    pub failed: Vec<Job>,
    /// Candidates whose row or product was locked by a live worker.
    pub skipped_locked: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Creation and reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a job. Fails with `DuplicateRecord` if a live job already uses
    /// the idempotency key.
    async fn insert_job(&self, tenant: &Tenant, job: NewJob) -> Result<Job>;

    /// Insert a batch and its jobs atomically.
    async fn insert_batch(
        &self,
        tenant: &Tenant,
        batch: NewBatch,
        jobs: Vec<NewJob>,
    ) -> Result<(Batch, Vec<Job>)>;

    async fn get_job(&self, tenant: &Tenant, job_id: JobId) -> Result<Job>;

    async fn get_batch(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Batch>;

    async fn batch_jobs(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Vec<Job>>;

    /// PENDING jobs ordered by priority (desc) then age.
    async fn pending_candidates(&self, tenant: &Tenant, limit: i64) -> Result<Vec<Job>>;

    // ─────────────────────────────────────────────────────────────────────────
    // State transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// PENDING -> RUNNING. With `lock_product`, takes the product lock
    /// without waiting and refuses if another job on the product is RUNNING.
    async fn claim(&self, tenant: &Tenant, job_id: JobId, lock_product: bool)
        -> Result<ClaimOutcome>;

    /// Apply a terminal transition. Returns `None` when the job was no
    /// longer in a source status, leaving it untouched.
    async fn finish(&self, tenant: &Tenant, job_id: JobId, finish: Finish) -> Result<Option<Job>>;

    /// Cancel a waiting job outright, or flag a running one.
    async fn request_cancel(&self, tenant: &Tenant, job_id: JobId) -> Result<Job>;

    /// PENDING -> PAUSED. A RUNNING job only gets `pause_requested`; it stays
    /// RUNNING, and so unclaimable, until its worker calls [`JobStore::park`].
    async fn pause(&self, tenant: &Tenant, job_id: JobId) -> Result<Job>;

    /// RUNNING with a pause request -> PAUSED. Returns `None` when no pause
    /// is pending, leaving the job untouched.
    async fn park(&self, tenant: &Tenant, job_id: JobId) -> Result<Option<Job>>;

    /// PAUSED -> PENDING with a new expiry and a cleared cancellation flag.
    /// On a RUNNING job the pending pause request is withdrawn instead.
    async fn resume(&self, tenant: &Tenant, job_id: JobId, expires_at: DateTime<Utc>) -> Result<Job>;

    async fn control_state(&self, tenant: &Tenant, job_id: JobId) -> Result<ControlState>;

    /// Consume one unit of the job's retry budget; returns the new count.
    async fn increment_retry(&self, tenant: &Tenant, job_id: JobId) -> Result<u32>;

    // ─────────────────────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────────────────────

    /// Tasks of a job in position order.
    async fn tasks(&self, tenant: &Tenant, job_id: JobId) -> Result<Vec<Task>>;

    /// Persist planned tasks with positions 0..n.
    async fn insert_tasks(&self, tenant: &Tenant, job_id: JobId, specs: Vec<TaskSpec>)
        -> Result<Vec<Task>>;

    /// Persist task progress. Returns `false`, writing nothing, once the
    /// parent job has left RUNNING: its tasks belong to whoever moved it.
    async fn save_task(&self, tenant: &Tenant, task: &Task) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Aggregation, products and cleanup
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute batch counters and status from the child jobs.
    async fn refresh_batch(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Batch>;

    /// Record (or clear) the remote listing id of a product on a marketplace.
    async fn record_listing(
        &self,
        tenant: &Tenant,
        product_id: ProductId,
        marketplace: Marketplace,
        remote_id: Option<&str>,
    ) -> Result<()>;

    /// PENDING | PAUSED jobs whose `expires_at` has passed -> EXPIRED.
    async fn expire_stale(&self, tenant: &Tenant, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// RUNNING jobs started before `started_before` -> FAILED, skipping any
    /// whose row or product is currently locked.
    async fn fail_stuck(&self, tenant: &Tenant, started_before: DateTime<Utc>) -> Result<StuckSweep>;
}

/// Copy aggregated progress onto a batch record. Timestamps are set once.
pub(crate) fn apply_progress(batch: &mut Batch, progress: &BatchProgress, now: DateTime<Utc>) {
    batch.total = progress.total;
    batch.completed = progress.completed;
    batch.failed = progress.failed;
    batch.cancelled = progress.cancelled;
    batch.status = progress.status;
    if batch.started_at.is_none() && (progress.running > 0 || progress.finished() > 0) {
        batch.started_at = Some(now);
    }
    if batch.completed_at.is_none() && progress.status.is_final() {
        batch.completed_at = Some(now);
    }
}

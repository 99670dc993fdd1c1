//! In-memory job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{
    apply_progress, ClaimOutcome, ControlState, Finish, JobStore, NewBatch, StuckSweep, EXPIRED_MESSAGE,
    WORKER_LOST_MESSAGE,
};
use crate::db::{Tenant, TenantId};
use crate::error::{ErrorCode, RelistError, Result};
use crate::jobs::action::Marketplace;
use crate::jobs::job::{
    Batch, BatchId, BatchProgress, BatchStatus, Job, JobId, JobStatus, NewJob, ProductId, Task,
    TaskId, TaskSpec, TaskStatus,
};

#[derive(Debug, Default)]
struct TenantState {
    /// Product id -> remote listing id per marketplace.
    products: HashMap<ProductId, HashMap<Marketplace, Option<String>>>,
    jobs: HashMap<JobId, Job>,
    /// Insertion order, used as the final claim-order tiebreak.
    order: Vec<JobId>,
    tasks: HashMap<JobId, Vec<Task>>,
    batches: HashMap<BatchId, Batch>,
    locked_products: HashSet<ProductId>,
    lock_acquisitions: u64,
}

impl TenantState {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| RelistError::job_not_found(job_id))
    }

    fn check_insertable(&self, job: &NewJob) -> Result<()> {
        if let Some(product_id) = job.product_id {
            if !self.products.contains_key(&product_id) {
                return Err(RelistError::product_not_found(product_id));
            }
        }
        let key_taken = self.jobs.values().any(|existing| {
            existing.idempotency_key == job.idempotency_key
                && matches!(
                    existing.status,
                    JobStatus::Pending | JobStatus::Running | JobStatus::Paused
                )
        });
        if key_taken {
            return Err(RelistError::duplicate_job(&job.idempotency_key));
        }
        Ok(())
    }

    fn push_job(&mut self, new: NewJob) -> Job {
        let job = Job {
            id: JobId::new(),
            batch_id: new.batch_id,
            marketplace: new.marketplace,
            action: new.action,
            product_id: new.product_id,
            idempotency_key: new.idempotency_key,
            status: JobStatus::Pending,
            cancel_requested: false,
            pause_requested: false,
            priority: new.priority,
            retry_count: 0,
            max_retries: new.max_retries,
            input: new.input,
            result: None,
            failed_step: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: new.expires_at,
        };
        self.order.push(job.id);
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn cancel_unfinished_tasks(&mut self, job_id: JobId, now: DateTime<Utc>) {
        if let Some(tasks) = self.tasks.get_mut(&job_id) {
            for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
            }
        }
    }

    fn product_has_running_job(&self, product_id: ProductId, except: JobId) -> bool {
        self.jobs.values().any(|j| {
            j.id != except && j.product_id == Some(product_id) && j.status == JobStatus::Running
        })
    }
}

#[derive(Debug, Default)]
struct State {
    tenants: HashMap<TenantId, TenantState>,
}

/// Job store held in process memory.
///
/// Every operation runs under one mutex, which makes each of them atomic in
/// the way a single database transaction is.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tenant<R>(
        &self,
        tenant: &Tenant,
        f: impl FnOnce(&mut TenantState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock();
        let tenant_state = state.tenants.entry(tenant.id.clone()).or_default();
        f(tenant_state)
    }

    /// Create a product row.
    pub fn add_product(&self, tenant: &Tenant, product_id: ProductId) {
        let mut state = self.state.lock();
        state
            .tenants
            .entry(tenant.id.clone())
            .or_default()
            .products
            .entry(product_id)
            .or_default();
    }

    pub fn remove_product(&self, tenant: &Tenant, product_id: ProductId) {
        let mut state = self.state.lock();
        if let Some(t) = state.tenants.get_mut(&tenant.id) {
            t.products.remove(&product_id);
        }
    }

    /// Remote listing id recorded for a product.
    pub fn listing(
        &self,
        tenant: &Tenant,
        product_id: ProductId,
        marketplace: Marketplace,
    ) -> Option<String> {
        let state = self.state.lock();
        state
            .tenants
            .get(&tenant.id)?
            .products
            .get(&product_id)?
            .get(&marketplace)
            .cloned()
            .flatten()
    }

    /// Hold the product row lock the way a concurrent transaction would.
    /// Returns `None` if it is already held.
    pub fn hold_product_lock(
        &self,
        tenant: &Tenant,
        product_id: ProductId,
    ) -> Option<ProductLockGuard> {
        let mut state = self.state.lock();
        let t = state.tenants.entry(tenant.id.clone()).or_default();
        if !t.locked_products.insert(product_id) {
            return None;
        }
        t.lock_acquisitions += 1;
        Some(ProductLockGuard {
            state: Arc::clone(&self.state),
            tenant: tenant.id.clone(),
            product_id,
        })
    }

    /// Number of times any product lock was taken in this tenant.
    pub fn lock_acquisitions(&self, tenant: &Tenant) -> u64 {
        let state = self.state.lock();
        state
            .tenants
            .get(&tenant.id)
            .map_or(0, |t| t.lock_acquisitions)
    }

    /// Overwrite `started_at` of a job, e.g. to age a RUNNING job.
    pub fn set_started_at(&self, tenant: &Tenant, job_id: JobId, at: DateTime<Utc>) -> Result<()> {
        self.with_tenant(tenant, |t| {
            t.job_mut(job_id)?.started_at = Some(at);
            Ok(())
        })
    }
}

/// Releases an in-memory product lock on drop.
#[derive(Debug)]
pub struct ProductLockGuard {
    state: Arc<Mutex<State>>,
    tenant: TenantId,
    product_id: ProductId,
}

impl Drop for ProductLockGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(t) = state.tenants.get_mut(&self.tenant) {
            t.locked_products.remove(&self.product_id);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, tenant: &Tenant, job: NewJob) -> Result<Job> {
        self.with_tenant(tenant, |t| {
            t.check_insertable(&job)?;
            Ok(t.push_job(job))
        })
    }

    async fn insert_batch(
        &self,
        tenant: &Tenant,
        batch: NewBatch,
        jobs: Vec<NewJob>,
    ) -> Result<(Batch, Vec<Job>)> {
        self.with_tenant(tenant, |t| {
            let mut keys = HashSet::new();
            for job in &jobs {
                t.check_insertable(job)?;
                if !keys.insert(job.idempotency_key.as_str()) {
                    return Err(RelistError::duplicate_job(&job.idempotency_key));
                }
            }

            let record = Batch {
                id: BatchId::new(),
                marketplace: batch.marketplace,
                action: batch.action,
                total: jobs.len() as u32,
                completed: 0,
                failed: 0,
                cancelled: 0,
                priority: batch.priority,
                status: BatchStatus::Pending,
                created_by: batch.created_by,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            };

            let created = jobs
                .into_iter()
                .map(|mut job| {
                    job.batch_id = Some(record.id);
                    t.push_job(job)
                })
                .collect();
            t.batches.insert(record.id, record.clone());
            Ok((record, created))
        })
    }

    async fn get_job(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        self.with_tenant(tenant, |t| t.job_mut(job_id).map(|j| j.clone()))
    }

    async fn get_batch(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Batch> {
        self.with_tenant(tenant, |t| {
            t.batches
                .get(&batch_id)
                .cloned()
                .ok_or_else(|| RelistError::batch_not_found(batch_id))
        })
    }

    async fn batch_jobs(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Vec<Job>> {
        self.with_tenant(tenant, |t| {
            Ok(t.order
                .iter()
                .filter_map(|id| t.jobs.get(id))
                .filter(|j| j.batch_id == Some(batch_id))
                .cloned()
                .collect())
        })
    }

    async fn pending_candidates(&self, tenant: &Tenant, limit: i64) -> Result<Vec<Job>> {
        self.with_tenant(tenant, |t| {
            let mut pending: Vec<Job> = t
                .order
                .iter()
                .filter_map(|id| t.jobs.get(id))
                .filter(|j| j.status == JobStatus::Pending)
                .cloned()
                .collect();
            // Stable sort keeps insertion order among equal keys.
            pending.sort_by(|a, b| {
                b.priority
                    .score()
                    .cmp(&a.priority.score())
                    .then(a.created_at.cmp(&b.created_at))
            });
            pending.truncate(limit.max(0) as usize);
            Ok(pending)
        })
    }

    async fn claim(
        &self,
        tenant: &Tenant,
        job_id: JobId,
        lock_product: bool,
    ) -> Result<ClaimOutcome> {
        self.with_tenant(tenant, |t| {
            let job = t.job_mut(job_id)?;
            if job.status != JobStatus::Pending {
                return Ok(ClaimOutcome::Unavailable);
            }
            let product_id = job.product_id;

            if let (true, Some(product_id)) = (lock_product, product_id) {
                if !t.products.contains_key(&product_id) {
                    let job = t.job_mut(job_id)?;
                    job.status = JobStatus::Failed;
                    job.failed_step = Some("claim".to_string());
                    job.error_message = Some(format!("Product {} not found", product_id));
                    job.completed_at = Some(Utc::now());
                    return Ok(ClaimOutcome::Rejected(job.clone()));
                }
                if t.locked_products.contains(&product_id) {
                    return Ok(ClaimOutcome::Conflict);
                }
                // The lock lives for this critical section only.
                t.lock_acquisitions += 1;
                if t.product_has_running_job(product_id, job_id) {
                    return Ok(ClaimOutcome::Conflict);
                }
            }

            let job = t.job_mut(job_id)?;
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            Ok(ClaimOutcome::Claimed(job.clone()))
        })
    }

    async fn finish(&self, tenant: &Tenant, job_id: JobId, finish: Finish) -> Result<Option<Job>> {
        self.with_tenant(tenant, |t| {
            let now = Utc::now();
            let job = t.job_mut(job_id)?;
            if !finish.sources().contains(&job.status) {
                return Ok(None);
            }

            job.status = finish.target();
            job.completed_at = Some(now);
            job.pause_requested = false;
            match finish {
                Finish::Completed { result } => job.result = Some(result),
                Finish::Failed { step, message } => {
                    job.failed_step = Some(step);
                    job.error_message = Some(message);
                }
                Finish::Cancelled => {}
            }
            let job = job.clone();

            if job.status == JobStatus::Cancelled {
                t.cancel_unfinished_tasks(job_id, now);
            }
            Ok(Some(job))
        })
    }

    async fn request_cancel(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        self.with_tenant(tenant, |t| {
            let now = Utc::now();
            let job = t.job_mut(job_id)?;
            let status = job.status;
            match status {
                JobStatus::Pending | JobStatus::Paused => {
                    job.status = JobStatus::Cancelled;
                    job.cancel_requested = true;
                    job.completed_at = Some(now);
                    let job = job.clone();
                    t.cancel_unfinished_tasks(job_id, now);
                    Ok(job)
                }
                JobStatus::Running => {
                    job.cancel_requested = true;
                    Ok(job.clone())
                }
                _ => Err(RelistError::invalid_state_transition(status, JobStatus::Cancelled)),
            }
        })
    }

    async fn pause(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        self.with_tenant(tenant, |t| {
            let job = t.job_mut(job_id)?;
            match job.status {
                JobStatus::Pending => job.status = JobStatus::Paused,
                JobStatus::Running => job.pause_requested = true,
                other => return Err(RelistError::invalid_state_transition(other, JobStatus::Paused)),
            }
            Ok(job.clone())
        })
    }

    async fn park(&self, tenant: &Tenant, job_id: JobId) -> Result<Option<Job>> {
        self.with_tenant(tenant, |t| {
            let job = t.job_mut(job_id)?;
            if job.status != JobStatus::Running || !job.pause_requested {
                return Ok(None);
            }
            job.status = JobStatus::Paused;
            job.pause_requested = false;
            Ok(Some(job.clone()))
        })
    }

    async fn resume(
        &self,
        tenant: &Tenant,
        job_id: JobId,
        expires_at: DateTime<Utc>,
    ) -> Result<Job> {
        self.with_tenant(tenant, |t| {
            let job = t.job_mut(job_id)?;
            match job.status {
                JobStatus::Paused => {
                    job.status = JobStatus::Pending;
                    job.cancel_requested = false;
                    job.expires_at = expires_at;
                }
                JobStatus::Running if job.pause_requested => job.pause_requested = false,
                other => return Err(RelistError::invalid_state_transition(other, JobStatus::Pending)),
            }
            Ok(job.clone())
        })
    }

    async fn control_state(&self, tenant: &Tenant, job_id: JobId) -> Result<ControlState> {
        self.with_tenant(tenant, |t| {
            let job = t.job_mut(job_id)?;
            Ok(ControlState {
                status: job.status,
                cancel_requested: job.cancel_requested,
                pause_requested: job.pause_requested,
            })
        })
    }

    async fn increment_retry(&self, tenant: &Tenant, job_id: JobId) -> Result<u32> {
        self.with_tenant(tenant, |t| {
            let job = t.job_mut(job_id)?;
            job.retry_count += 1;
            Ok(job.retry_count)
        })
    }

    async fn tasks(&self, tenant: &Tenant, job_id: JobId) -> Result<Vec<Task>> {
        self.with_tenant(tenant, |t| {
            let mut tasks = t.tasks.get(&job_id).cloned().unwrap_or_default();
            tasks.sort_by_key(|task| task.position);
            Ok(tasks)
        })
    }

    async fn insert_tasks(
        &self,
        tenant: &Tenant,
        job_id: JobId,
        specs: Vec<TaskSpec>,
    ) -> Result<Vec<Task>> {
        self.with_tenant(tenant, |t| {
            t.job_mut(job_id)?;
            if t.tasks.get(&job_id).is_some_and(|tasks| !tasks.is_empty()) {
                return Err(RelistError::new(
                    ErrorCode::DuplicateRecord,
                    format!("Tasks already planned for job {}", job_id),
                ));
            }
            let now = Utc::now();
            let tasks: Vec<Task> = specs
                .into_iter()
                .enumerate()
                .map(|(position, spec)| Task {
                    id: TaskId::new(),
                    job_id,
                    position: position as i32,
                    description: spec.description,
                    status: TaskStatus::Pending,
                    request: spec.request,
                    result: None,
                    error_message: None,
                    retry_count: 0,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                })
                .collect();
            t.tasks.insert(job_id, tasks.clone());
            Ok(tasks)
        })
    }

    async fn save_task(&self, tenant: &Tenant, task: &Task) -> Result<bool> {
        self.with_tenant(tenant, |t| {
            let running = t
                .jobs
                .get(&task.job_id)
                .is_some_and(|job| job.status == JobStatus::Running);
            let slot = t
                .tasks
                .get_mut(&task.job_id)
                .and_then(|tasks| tasks.iter_mut().find(|existing| existing.id == task.id))
                .ok_or_else(|| {
                    RelistError::new(ErrorCode::TaskNotFound, format!("Task not found: {}", task.id))
                })?;
            if !running {
                return Ok(false);
            }
            *slot = task.clone();
            Ok(true)
        })
    }

    async fn refresh_batch(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Batch> {
        self.with_tenant(tenant, |t| {
            let statuses: Vec<JobStatus> = t
                .jobs
                .values()
                .filter(|j| j.batch_id == Some(batch_id))
                .map(|j| j.status)
                .collect();
            let progress = BatchProgress::from_statuses(statuses);

            let batch = t
                .batches
                .get_mut(&batch_id)
                .ok_or_else(|| RelistError::batch_not_found(batch_id))?;
            apply_progress(batch, &progress, Utc::now());
            Ok(batch.clone())
        })
    }

    async fn record_listing(
        &self,
        tenant: &Tenant,
        product_id: ProductId,
        marketplace: Marketplace,
        remote_id: Option<&str>,
    ) -> Result<()> {
        self.with_tenant(tenant, |t| {
            let listings = t
                .products
                .get_mut(&product_id)
                .ok_or_else(|| RelistError::product_not_found(product_id))?;
            listings.insert(marketplace, remote_id.map(str::to_string));
            Ok(())
        })
    }

    async fn expire_stale(&self, tenant: &Tenant, now: DateTime<Utc>) -> Result<Vec<Job>> {
        self.with_tenant(tenant, |t| {
            let stale: Vec<JobId> = t
                .jobs
                .values()
                .filter(|j| {
                    matches!(j.status, JobStatus::Pending | JobStatus::Paused) && j.expires_at < now
                })
                .map(|j| j.id)
                .collect();

            let mut expired = Vec::with_capacity(stale.len());
            for job_id in stale {
                let job = t.job_mut(job_id)?;
                job.status = JobStatus::Expired;
                job.error_message = Some(EXPIRED_MESSAGE.to_string());
                job.completed_at = Some(now);
                expired.push(job.clone());
                t.cancel_unfinished_tasks(job_id, now);
            }
            Ok(expired)
        })
    }

    async fn fail_stuck(&self, tenant: &Tenant, started_before: DateTime<Utc>) -> Result<StuckSweep> {
        self.with_tenant(tenant, |t| {
            let now = Utc::now();
            let stuck: Vec<(JobId, Option<ProductId>)> = t
                .jobs
                .values()
                .filter(|j| {
                    j.status == JobStatus::Running
                        && j.started_at.is_some_and(|started| started < started_before)
                })
                .map(|j| (j.id, j.product_id))
                .collect();

            let mut sweep = StuckSweep::default();
            for (job_id, product_id) in stuck {
                if let Some(product_id) = product_id {
                    if t.locked_products.contains(&product_id) {
                        sweep.skipped_locked += 1;
                        continue;
                    }
                    t.lock_acquisitions += 1;
                }
                let job = t.job_mut(job_id)?;
                job.status = JobStatus::Failed;
                job.failed_step = Some("worker".to_string());
                job.error_message = Some(WORKER_LOST_MESSAGE.to_string());
                job.completed_at = Some(now);
                sweep.failed.push(job.clone());
                t.cancel_unfinished_tasks(job_id, now);
            }
            Ok(sweep)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::action::ActionCode;
    use crate::jobs::job::JobPriority;
    use crate::jobs::payload::{JobInput, PayloadEnvelope, TaskRequest};
    use chrono::Duration;

    fn tenant() -> Tenant {
        Tenant::new(TenantId::parse("shop").unwrap())
    }

    fn new_job(product_id: Option<ProductId>, key: &str) -> NewJob {
        NewJob {
            batch_id: None,
            marketplace: Marketplace::Vinted,
            action: ActionCode::Delete,
            product_id,
            idempotency_key: key.to_string(),
            priority: JobPriority::Normal,
            max_retries: 3,
            input: PayloadEnvelope::new(JobInput::Delete {
                remote_id: "1".to_string(),
            }),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_duplicate_active_key_rejected() {
        let store = InMemoryJobStore::new();
        let tenant = tenant();
        store.add_product(&tenant, 1);

        store.insert_job(&tenant, new_job(Some(1), "k")).await.unwrap();
        let err = store.insert_job(&tenant, new_job(Some(1), "k")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
    }

    #[tokio::test]
    async fn test_claim_conflicts_while_product_running() {
        let store = InMemoryJobStore::new();
        let tenant = tenant();
        store.add_product(&tenant, 7);

        let a = store.insert_job(&tenant, new_job(Some(7), "a")).await.unwrap();
        let b = store.insert_job(&tenant, new_job(Some(7), "b")).await.unwrap();

        assert!(matches!(
            store.claim(&tenant, a.id, true).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            store.claim(&tenant, b.id, true).await.unwrap(),
            ClaimOutcome::Conflict
        ));
        assert_eq!(store.get_job(&tenant, b.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_conflicts_on_held_lock() {
        let store = InMemoryJobStore::new();
        let tenant = tenant();
        store.add_product(&tenant, 7);
        let job = store.insert_job(&tenant, new_job(Some(7), "a")).await.unwrap();

        let guard = store.hold_product_lock(&tenant, 7).unwrap();
        assert!(matches!(
            store.claim(&tenant, job.id, true).await.unwrap(),
            ClaimOutcome::Conflict
        ));
        drop(guard);
        assert!(matches!(
            store.claim(&tenant, job.id, true).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_claim_rejects_missing_product() {
        let store = InMemoryJobStore::new();
        let tenant = tenant();
        store.add_product(&tenant, 3);
        let job = store.insert_job(&tenant, new_job(Some(3), "a")).await.unwrap();
        store.remove_product(&tenant, 3);

        match store.claim(&tenant, job.id, true).await.unwrap() {
            ClaimOutcome::Rejected(job) => {
                assert_eq!(job.status, JobStatus::Failed);
                assert_eq!(job.failed_step.as_deref(), Some("claim"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finish_is_guarded() {
        let store = InMemoryJobStore::new();
        let tenant = tenant();
        let job = store.insert_job(&tenant, new_job(None, "a")).await.unwrap();

        // Not running yet: completion is refused.
        let result = PayloadEnvelope::new(crate::jobs::payload::JobOutput::Deleted {
            remote_id: "1".to_string(),
        });
        assert!(store
            .finish(&tenant, job.id, Finish::Completed { result: result.clone() })
            .await
            .unwrap()
            .is_none());

        store.claim(&tenant, job.id, false).await.unwrap();
        let done = store
            .finish(&tenant, job.id, Finish::Completed { result })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        // Terminal: nothing moves it.
        assert!(store.finish(&tenant, job.id, Finish::Cancelled).await.unwrap().is_none());
        assert!(store.request_cancel(&tenant, job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_save_task_refused_once_job_swept() {
        let store = InMemoryJobStore::new();
        let tenant = tenant();
        let job = store.insert_job(&tenant, new_job(None, "a")).await.unwrap();
        store.claim(&tenant, job.id, false).await.unwrap();
        let specs = vec![
            TaskSpec::new("first", TaskRequest::Transfer { url: "a".to_string() }),
            TaskSpec::new("second", TaskRequest::Transfer { url: "b".to_string() }),
        ];
        let mut tasks = store.insert_tasks(&tenant, job.id, specs).await.unwrap();

        tasks[0].status = TaskStatus::Success;
        assert!(store.save_task(&tenant, &tasks[0]).await.unwrap());

        let sweep = store.fail_stuck(&tenant, Utc::now() + Duration::minutes(1)).await.unwrap();
        assert_eq!(sweep.failed.len(), 1);

        tasks[1].status = TaskStatus::Success;
        assert!(!store.save_task(&tenant, &tasks[1]).await.unwrap());
        let stored = store.tasks(&tenant, job.id).await.unwrap();
        assert_eq!(stored[0].status, TaskStatus::Success);
        assert_eq!(stored[1].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_finish_clears_pause_request() {
        let store = InMemoryJobStore::new();
        let tenant = tenant();
        let job = store.insert_job(&tenant, new_job(None, "a")).await.unwrap();
        store.claim(&tenant, job.id, false).await.unwrap();

        let paused = store.pause(&tenant, job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Running);
        assert!(paused.pause_requested);

        let result = PayloadEnvelope::new(crate::jobs::payload::JobOutput::Deleted {
            remote_id: "1".to_string(),
        });
        let done = store
            .finish(&tenant, job.id, Finish::Completed { result })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(!done.pause_requested);
        assert!(store.park(&tenant, job.id).await.unwrap().is_none());
    }
}

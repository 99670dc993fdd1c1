//! Caller-facing job lifecycle operations.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::action::{ActionCode, ActionRegistry, Marketplace};
use super::job::{Batch, BatchId, BatchProgress, Job, JobId, JobPriority, JobStatus, NewJob, ProductId, Task};
use super::payload::{JobInput, PayloadEnvelope};
use super::processor::TerminalHooks;
use super::store::{JobStore, NewBatch};
use crate::db::Tenant;
use crate::error::{RelistError, Result};

/// A single job request.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub marketplace: Marketplace,
    pub action: ActionCode,
    pub product_id: Option<ProductId>,
    /// Falls back to the action's default priority.
    pub priority: Option<JobPriority>,
    /// Falls back to the action's default retry budget.
    pub max_retries: Option<u32>,
    pub input: JobInput,
    /// Derived from the request when absent.
    pub idempotency_key: Option<String>,
}

impl CreateJob {
    pub fn new(marketplace: Marketplace, input: JobInput) -> Self {
        Self {
            marketplace,
            action: input.action(),
            product_id: None,
            priority: None,
            max_retries: None,
            input,
            idempotency_key: None,
        }
    }

    pub fn for_product(mut self, product_id: ProductId) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// One product of a bulk request.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub product_id: ProductId,
    pub input: JobInput,
}

/// A bulk request: one job per item, same marketplace and action.
#[derive(Debug, Clone)]
pub struct CreateBatch {
    pub marketplace: Marketplace,
    pub action: ActionCode,
    pub priority: Option<JobPriority>,
    pub created_by: Option<String>,
    pub items: Vec<BatchItem>,
}

/// Idempotency key of a request: hex SHA-256 over marketplace, action,
/// product and the canonical JSON of the input.
pub fn idempotency_key(
    marketplace: Marketplace,
    action: ActionCode,
    product_id: Option<ProductId>,
    input: &JobInput,
) -> Result<String> {
    let canonical = serde_json::to_string(input)?;
    let mut hasher = Sha256::new();
    hasher.update(marketplace.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_str().as_bytes());
    hasher.update(b"|");
    if let Some(product_id) = product_id {
        hasher.update(product_id.to_string().as_bytes());
    }
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Thin facade over the store for code that creates and steers jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    actions: Arc<ActionRegistry>,
    hooks: TerminalHooks,
    expiry_window: Duration,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        actions: Arc<ActionRegistry>,
        hooks: TerminalHooks,
        expiry_window: Duration,
    ) -> Self {
        Self {
            store,
            actions,
            hooks,
            expiry_window,
        }
    }

    fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let window = chrono::Duration::from_std(self.expiry_window)
            .map_err(|_| RelistError::configuration("Expiry window out of range"))?;
        Ok(now + window)
    }

    fn new_job(&self, request: CreateJob, batch_id: Option<BatchId>, expires_at: DateTime<Utc>) -> Result<NewJob> {
        request.input.ensure_action(request.action)?;
        let definition = self.actions.get(request.action)?;
        if definition.mutating && request.product_id.is_none() {
            return Err(RelistError::validation(format!(
                "Action '{}' requires a product",
                request.action.as_str()
            )));
        }

        let idempotency_key = match request.idempotency_key {
            Some(key) => key,
            None => idempotency_key(
                request.marketplace,
                request.action,
                request.product_id,
                &request.input,
            )?,
        };

        Ok(NewJob {
            batch_id,
            marketplace: request.marketplace,
            action: request.action,
            product_id: request.product_id,
            idempotency_key,
            priority: request.priority.unwrap_or(definition.default_priority),
            max_retries: request.max_retries.unwrap_or(definition.default_max_retries),
            input: PayloadEnvelope::new(request.input),
            expires_at,
        })
    }

    /// Create a PENDING job. A live job with the same idempotency key makes
    /// this fail with `DuplicateRecord`.
    #[instrument(skip_all, fields(tenant = %tenant.id, marketplace = %request.marketplace.as_str(), action = %request.action.as_str()))]
    pub async fn create_job(&self, tenant: &Tenant, request: CreateJob) -> Result<Job> {
        let new_job = self.new_job(request, None, self.expires_at(Utc::now())?)?;
        let job = self.store.insert_job(tenant, new_job).await?;
        info!(job_id = %job.id, "Job created");
        Ok(job)
    }

    /// Create a batch and one job per item, atomically.
    #[instrument(skip_all, fields(tenant = %tenant.id, items = request.items.len()))]
    pub async fn create_batch(&self, tenant: &Tenant, request: CreateBatch) -> Result<(Batch, Vec<Job>)> {
        if request.items.is_empty() {
            return Err(RelistError::validation("A batch needs at least one product"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = request.items.iter().find(|item| !seen.insert(item.product_id)) {
            return Err(RelistError::validation(format!(
                "Product {} appears twice in the batch",
                dup.product_id
            )));
        }

        let priority = match request.priority {
            Some(priority) => priority,
            None => self.actions.get(request.action)?.default_priority,
        };
        let expires_at = self.expires_at(Utc::now())?;
        let batch_id = BatchId::new();

        let jobs = request
            .items
            .into_iter()
            .map(|item| {
                let mut job = CreateJob::new(request.marketplace, item.input).for_product(item.product_id);
                job.action = request.action;
                job.priority = Some(priority);
                self.new_job(job, Some(batch_id), expires_at)
            })
            .collect::<Result<Vec<_>>>()?;

        let (batch, jobs) = self
            .store
            .insert_batch(
                tenant,
                NewBatch {
                    marketplace: request.marketplace,
                    action: request.action,
                    priority,
                    created_by: request.created_by,
                },
                jobs,
            )
            .await?;
        info!(batch_id = %batch.id, total = batch.total, "Batch created");
        Ok((batch, jobs))
    }

    /// Cancel a waiting job outright; flag a running one for its handler.
    #[instrument(skip_all, fields(tenant = %tenant.id, job_id = %job_id))]
    pub async fn cancel_job(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        let job = self.store.request_cancel(tenant, job_id).await?;
        if job.status == JobStatus::Cancelled {
            info!("Job cancelled");
            self.hooks.apply(tenant, &job).await;
        } else {
            info!("Cancellation requested");
        }
        Ok(job)
    }

    /// Pause a waiting job now; a running one is parked by its worker at the
    /// next safe point.
    #[instrument(skip_all, fields(tenant = %tenant.id, job_id = %job_id))]
    pub async fn pause_job(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        let job = self.store.pause(tenant, job_id).await?;
        if job.status == JobStatus::Paused {
            info!("Job paused");
        } else {
            info!("Pause requested");
        }
        Ok(job)
    }

    /// PAUSED -> PENDING with a fresh expiry window. A pause still pending on
    /// a running job is withdrawn.
    #[instrument(skip_all, fields(tenant = %tenant.id, job_id = %job_id))]
    pub async fn resume_job(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        let job = self
            .store
            .resume(tenant, job_id, self.expires_at(Utc::now())?)
            .await?;
        if job.status == JobStatus::Pending {
            info!("Job resumed");
        } else {
            info!("Pause request withdrawn");
        }
        Ok(job)
    }

    pub async fn job_with_tasks(&self, tenant: &Tenant, job_id: JobId) -> Result<(Job, Vec<Task>)> {
        let job = self.store.get_job(tenant, job_id).await?;
        let tasks = self.store.tasks(tenant, job_id).await?;
        Ok((job, tasks))
    }

    pub async fn batch_progress(&self, tenant: &Tenant, batch_id: BatchId) -> Result<BatchProgress> {
        // Existence check first so an unknown id is BatchNotFound, not empty.
        self.store.get_batch(tenant, batch_id).await?;
        let jobs = self.store.batch_jobs(tenant, batch_id).await?;
        Ok(BatchProgress::from_statuses(jobs.into_iter().map(|job| job.status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TenantId;
    use crate::error::ErrorCode;
    use crate::jobs::stats::InMemoryStatsSink;
    use crate::jobs::store::InMemoryJobStore;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryJobStore>, JobService, Tenant) {
        let store = Arc::new(InMemoryJobStore::new());
        let hooks = TerminalHooks::new(store.clone(), Arc::new(InMemoryStatsSink::new()));
        let service = JobService::new(
            store.clone(),
            Arc::new(ActionRegistry::builtin()),
            hooks,
            Duration::from_secs(3600),
        );
        (store, service, Tenant::new(TenantId::parse("acme").unwrap()))
    }

    fn publish() -> JobInput {
        JobInput::Publish {
            listing: json!({"title": "Jacket", "price": 25}),
            photos: vec![],
        }
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let a = idempotency_key(Marketplace::Vinted, ActionCode::Publish, Some(1), &publish()).unwrap();
        let b = idempotency_key(Marketplace::Vinted, ActionCode::Publish, Some(1), &publish()).unwrap();
        let c = idempotency_key(Marketplace::Vinted, ActionCode::Publish, Some(2), &publish()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected() {
        let (store, service, tenant) = setup();
        store.add_product(&tenant, 1);

        let job = service
            .create_job(&tenant, CreateJob::new(Marketplace::Vinted, publish()).for_product(1))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, ActionRegistry::builtin().get(ActionCode::Publish).unwrap().default_max_retries);

        let err = service
            .create_job(&tenant, CreateJob::new(Marketplace::Vinted, publish()).for_product(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
    }

    #[tokio::test]
    async fn test_mutating_action_needs_product() {
        let (_, service, tenant) = setup();
        let err = service
            .create_job(&tenant, CreateJob::new(Marketplace::Ebay, publish()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_cancel_pending_then_terminal() {
        let (_, service, tenant) = setup();
        let job = service
            .create_job(&tenant, CreateJob::new(Marketplace::Vinted, JobInput::Sync { cursor: None }))
            .await
            .unwrap();

        let cancelled = service.cancel_job(&tenant, job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.error_message.is_none());

        let err = service.cancel_job(&tenant, job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_pause_resume_refreshes_expiry() {
        let (_, service, tenant) = setup();
        let job = service
            .create_job(&tenant, CreateJob::new(Marketplace::Etsy, JobInput::Sync { cursor: None }))
            .await
            .unwrap();

        let paused = service.pause_job(&tenant, job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);

        let resumed = service.resume_job(&tenant, job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Pending);
        assert!(resumed.expires_at >= job.expires_at);
        assert!(!resumed.cancel_requested);
    }

    #[tokio::test]
    async fn test_batch_expansion() {
        let (store, service, tenant) = setup();
        for id in [1, 2, 3] {
            store.add_product(&tenant, id);
        }

        let items = [1, 2, 3]
            .into_iter()
            .map(|product_id| BatchItem {
                product_id,
                input: JobInput::Delete {
                    remote_id: format!("r-{}", product_id),
                },
            })
            .collect();
        let (batch, jobs) = service
            .create_batch(
                &tenant,
                CreateBatch {
                    marketplace: Marketplace::Vinted,
                    action: ActionCode::Delete,
                    priority: None,
                    created_by: Some("ops".into()),
                    items,
                },
            )
            .await
            .unwrap();

        assert_eq!(batch.total, 3);
        assert_eq!(batch.completed + batch.failed + batch.cancelled, 0);
        assert!(jobs.iter().all(|job| job.batch_id == Some(batch.id)));

        let progress = service.batch_progress(&tenant, batch.id).await.unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.status, crate::jobs::BatchStatus::Pending);
    }

    #[tokio::test]
    async fn test_batch_rejects_repeated_product() {
        let (store, service, tenant) = setup();
        store.add_product(&tenant, 7);
        let item = BatchItem {
            product_id: 7,
            input: JobInput::Delete { remote_id: "x".into() },
        };
        let err = service
            .create_batch(
                &tenant,
                CreateBatch {
                    marketplace: Marketplace::Ebay,
                    action: ActionCode::Delete,
                    priority: None,
                    created_by: None,
                    items: vec![item.clone(), item],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}

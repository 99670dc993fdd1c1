//! Postgres job store. Every call runs in a transaction scoped to the
//! tenant's schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    apply_progress, ClaimOutcome, ControlState, Finish, JobStore, NewBatch, StuckSweep,
    EXPIRED_MESSAGE, WORKER_LOST_MESSAGE,
};
use crate::db::{begin_tenant_tx, Tenant};
use crate::error::{ErrorCode, RelistError, Result};
use crate::jobs::action::Marketplace;
use crate::jobs::job::{
    Batch, BatchId, BatchProgress, Job, JobId, JobPriority, JobStatus, NewJob, ProductId, Task,
    TaskId, TaskSpec,
};
use crate::jobs::payload::PayloadEnvelope;

/// DDL of one tenant namespace.
const TENANT_TABLES: &str = include_str!("../../../sql/tenant_tables.sql");

const JOB_COLUMNS: &str = "id, batch_id, marketplace, action_code, product_id, idempotency_key, \
    status, cancel_requested, pause_requested, priority, retry_count, max_retries, input_data, result_data, \
    failed_step, error_message, created_at, started_at, completed_at, expires_at";

const TASK_COLUMNS: &str = "id, job_id, position, description, status, request, result, \
    error_message, retry_count, created_at, started_at, completed_at";

const BATCH_COLUMNS: &str = "id, marketplace, action_code, total, completed, failed, cancelled, \
    priority, status, created_by, created_at, started_at, completed_at";

// ═══════════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    batch_id: Option<Uuid>,
    marketplace: String,
    action_code: String,
    product_id: Option<i64>,
    idempotency_key: String,
    status: String,
    cancel_requested: bool,
    pause_requested: bool,
    priority: i32,
    retry_count: i32,
    max_retries: i32,
    input_data: serde_json::Value,
    result_data: Option<serde_json::Value>,
    failed_step: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = RelistError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: JobId(row.id),
            batch_id: row.batch_id.map(BatchId),
            marketplace: row.marketplace.parse()?,
            action: row.action_code.parse()?,
            product_id: row.product_id,
            idempotency_key: row.idempotency_key,
            status: row.status.parse()?,
            cancel_requested: row.cancel_requested,
            pause_requested: row.pause_requested,
            priority: JobPriority::from_score(row.priority),
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            input: PayloadEnvelope::decode(row.input_data)?,
            result: row.result_data.map(PayloadEnvelope::decode).transpose()?,
            failed_step: row.failed_step,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    job_id: Uuid,
    position: i32,
    description: String,
    status: String,
    request: serde_json::Value,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = RelistError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: TaskId(row.id),
            job_id: JobId(row.job_id),
            position: row.position,
            description: row.description,
            status: row.status.parse()?,
            request: serde_json::from_value(row.request)?,
            result: row.result,
            error_message: row.error_message,
            retry_count: row.retry_count.max(0) as u32,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    marketplace: String,
    action_code: String,
    total: i32,
    completed: i32,
    failed: i32,
    cancelled: i32,
    priority: i32,
    status: String,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = RelistError;

    fn try_from(row: BatchRow) -> Result<Self> {
        Ok(Self {
            id: BatchId(row.id),
            marketplace: row.marketplace.parse()?,
            action: row.action_code.parse()?,
            total: row.total.max(0) as u32,
            completed: row.completed.max(0) as u32,
            failed: row.failed.max(0) as u32,
            cancelled: row.cancelled.max(0) as u32,
            priority: JobPriority::from_score(row.priority),
            status: row.status.parse()?,
            created_by: row.created_by,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// `Ok(None)` when the statement hit a row lock held by another transaction.
fn nowait<T>(result: std::result::Result<T, sqlx::Error>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let error = RelistError::from(e);
            if error.is_lock_conflict() {
                Ok(None)
            } else {
                Err(error)
            }
        }
    }
}

fn status_list(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Job store backed by Postgres.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tenant schema and its tables if missing.
    pub async fn install_tenant_tables(&self, tenant: &Tenant) -> Result<()> {
        let schema = tenant.checked_schema()?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema))
            .execute(&self.pool)
            .await?;

        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        (&mut *tx).execute(TENANT_TABLES).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_job(tx: &mut Transaction<'static, Postgres>, job_id: JobId) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM marketplace_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| RelistError::job_not_found(job_id))?;
        Job::try_from(row)
    }

    async fn insert_job_tx(tx: &mut Transaction<'static, Postgres>, job: NewJob) -> Result<Job> {
        if let Some(product_id) = job.product_id {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM products WHERE id = $1")
                .bind(product_id)
                .fetch_optional(&mut **tx)
                .await?;
            if exists.is_none() {
                return Err(RelistError::product_not_found(product_id));
            }
        }

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO marketplace_jobs
                (id, batch_id, marketplace, action_code, product_id, idempotency_key,
                 status, priority, max_retries, input_data, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $7, $8, $9, $10)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(job.batch_id.map(|b| b.0))
        .bind(job.marketplace.as_str())
        .bind(job.action.as_str())
        .bind(job.product_id)
        .bind(&job.idempotency_key)
        .bind(job.priority.score())
        .bind(job.max_retries as i32)
        .bind(job.input.encode()?)
        .bind(job.expires_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            let error = RelistError::from(e);
            if error.code() == ErrorCode::DuplicateRecord {
                RelistError::duplicate_job(&job.idempotency_key)
            } else {
                error
            }
        })?;

        Job::try_from(row)
    }

    async fn cancel_unfinished_tasks(
        tx: &mut Transaction<'static, Postgres>,
        job_ids: &[Uuid],
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE marketplace_tasks
            SET status = 'CANCELLED', completed_at = NOW()
            WHERE job_id = ANY($1) AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(job_ids)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Status of a job, holding its row lock until the transaction ends.
    async fn lock_status(tx: &mut Transaction<'static, Postgres>, job_id: JobId) -> Result<JobStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM marketplace_jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id.0)
                .fetch_optional(&mut **tx)
                .await?;
        status.ok_or_else(|| RelistError::job_not_found(job_id))?.parse()
    }

    async fn fetch_job_for_update(
        tx: &mut Transaction<'static, Postgres>,
        job_id: JobId,
    ) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM marketplace_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| RelistError::job_not_found(job_id))?;
        Job::try_from(row)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, tenant: &Tenant, job: NewJob) -> Result<Job> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let job = Self::insert_job_tx(&mut tx, job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn insert_batch(
        &self,
        tenant: &Tenant,
        batch: NewBatch,
        jobs: Vec<NewJob>,
    ) -> Result<(Batch, Vec<Job>)> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;

        let row = sqlx::query_as::<_, BatchRow>(&format!(
            r#"
            INSERT INTO batch_jobs (id, marketplace, action_code, total, priority, status, created_by)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(batch.marketplace.as_str())
        .bind(batch.action.as_str())
        .bind(jobs.len() as i32)
        .bind(batch.priority.score())
        .bind(&batch.created_by)
        .fetch_one(&mut *tx)
        .await?;
        let record = Batch::try_from(row)?;

        let mut created = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.batch_id = Some(record.id);
            created.push(Self::insert_job_tx(&mut tx, job).await?);
        }

        tx.commit().await?;
        Ok((record, created))
    }

    async fn get_job(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let job = Self::fetch_job(&mut tx, job_id).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get_batch(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Batch> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM batch_jobs WHERE id = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RelistError::batch_not_found(batch_id))?;
        tx.commit().await?;
        Batch::try_from(row)
    }

    async fn batch_jobs(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Vec<Job>> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM marketplace_jobs WHERE batch_id = $1 ORDER BY created_at",
            JOB_COLUMNS
        ))
        .bind(batch_id.0)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn pending_candidates(&self, tenant: &Tenant, limit: i64) -> Result<Vec<Job>> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {} FROM marketplace_jobs
            WHERE status = 'PENDING'
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#,
            JOB_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn claim(
        &self,
        tenant: &Tenant,
        job_id: JobId,
        lock_product: bool,
    ) -> Result<ClaimOutcome> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;

        // A job row being claimed by someone else is skipped, not waited on.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM marketplace_jobs WHERE id = $1 AND status = 'PENDING' FOR UPDATE SKIP LOCKED",
            JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Unavailable);
        };
        let job = Job::try_from(row)?;

        if let (true, Some(product_id)) = (lock_product, job.product_id) {
            let locked = nowait(
                sqlx::query_scalar::<_, i64>("SELECT id FROM products WHERE id = $1 FOR UPDATE NOWAIT")
                    .bind(product_id)
                    .fetch_optional(&mut *tx)
                    .await,
            )?;

            match locked {
                None => {
                    tx.rollback().await?;
                    return Ok(ClaimOutcome::Conflict);
                }
                Some(None) => {
                    let row = sqlx::query_as::<_, JobRow>(&format!(
                        r#"
                        UPDATE marketplace_jobs
                        SET status = 'FAILED', failed_step = 'claim', error_message = $2, completed_at = NOW()
                        WHERE id = $1
                        RETURNING {}
                        "#,
                        JOB_COLUMNS
                    ))
                    .bind(job_id.0)
                    .bind(format!("Product {} not found", product_id))
                    .fetch_one(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(ClaimOutcome::Rejected(Job::try_from(row)?));
                }
                Some(Some(_)) => {}
            }

            let running: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM marketplace_jobs
                    WHERE product_id = $1 AND status = 'RUNNING' AND id <> $2
                )
                "#,
            )
            .bind(product_id)
            .bind(job_id.0)
            .fetch_one(&mut *tx)
            .await?;
            if running {
                tx.rollback().await?;
                return Ok(ClaimOutcome::Conflict);
            }
        }

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE marketplace_jobs SET status = 'RUNNING', started_at = NOW() WHERE id = $1 RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_one(&mut *tx)
        .await?;

        // Commit releases the product lock before any remote call is made.
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed(Job::try_from(row)?))
    }

    async fn finish(&self, tenant: &Tenant, job_id: JobId, finish: Finish) -> Result<Option<Job>> {
        let target = finish.target();
        let sources = status_list(finish.sources());
        let (result, step, message) = match &finish {
            Finish::Completed { result } => (Some(result.encode()?), None, None),
            Finish::Failed { step, message } => (None, Some(step.clone()), Some(message.clone())),
            Finish::Cancelled => (None, None, None),
        };

        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE marketplace_jobs
            SET status = $2,
                pause_requested = FALSE,
                completed_at = NOW(),
                result_data = COALESCE($3, result_data),
                failed_step = COALESCE($4, failed_step),
                error_message = COALESCE($5, error_message)
            WHERE id = $1 AND status = ANY($6)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id.0)
        .bind(target.as_str())
        .bind(result)
        .bind(step)
        .bind(message)
        .bind(sources)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        if target == JobStatus::Cancelled {
            Self::cancel_unfinished_tasks(&mut tx, &[job_id.0]).await?;
        }
        tx.commit().await?;
        Ok(Some(Job::try_from(row)?))
    }

    async fn request_cancel(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let status = Self::lock_status(&mut tx, job_id).await?;

        let set_clause = match status {
            JobStatus::Pending | JobStatus::Paused => {
                "status = 'CANCELLED', cancel_requested = TRUE, completed_at = NOW()"
            }
            JobStatus::Running => "cancel_requested = TRUE",
            other => return Err(RelistError::invalid_state_transition(other, JobStatus::Cancelled)),
        };

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE marketplace_jobs SET {} WHERE id = $1 RETURNING {}",
            set_clause, JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_one(&mut *tx)
        .await?;

        if status != JobStatus::Running {
            Self::cancel_unfinished_tasks(&mut tx, &[job_id.0]).await?;
        }
        tx.commit().await?;
        Job::try_from(row)
    }

    async fn pause(&self, tenant: &Tenant, job_id: JobId) -> Result<Job> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let status = Self::lock_status(&mut tx, job_id).await?;

        let set_clause = match status {
            JobStatus::Pending => "status = 'PAUSED'",
            // The worker parks it at its next safe point.
            JobStatus::Running => "pause_requested = TRUE",
            other => return Err(RelistError::invalid_state_transition(other, JobStatus::Paused)),
        };

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE marketplace_jobs SET {} WHERE id = $1 RETURNING {}",
            set_clause, JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Job::try_from(row)
    }

    async fn park(&self, tenant: &Tenant, job_id: JobId) -> Result<Option<Job>> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE marketplace_jobs
            SET status = 'PAUSED', pause_requested = FALSE
            WHERE id = $1 AND status = 'RUNNING' AND pause_requested
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        row.map(Job::try_from).transpose()
    }

    async fn resume(
        &self,
        tenant: &Tenant,
        job_id: JobId,
        expires_at: DateTime<Utc>,
    ) -> Result<Job> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let job = Self::fetch_job_for_update(&mut tx, job_id).await?;

        let set_clause = match job.status {
            JobStatus::Paused => "status = 'PENDING', cancel_requested = FALSE, expires_at = $2",
            JobStatus::Running if job.pause_requested => "pause_requested = FALSE",
            other => return Err(RelistError::invalid_state_transition(other, JobStatus::Pending)),
        };

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE marketplace_jobs SET {} WHERE id = $1 RETURNING {}",
            set_clause, JOB_COLUMNS
        ))
        .bind(job_id.0)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Job::try_from(row)
    }

    async fn control_state(&self, tenant: &Tenant, job_id: JobId) -> Result<ControlState> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let row: Option<(String, bool, bool)> = sqlx::query_as(
            "SELECT status, cancel_requested, pause_requested FROM marketplace_jobs WHERE id = $1",
        )
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        let (status, cancel_requested, pause_requested) =
            row.ok_or_else(|| RelistError::job_not_found(job_id))?;
        Ok(ControlState {
            status: status.parse()?,
            cancel_requested,
            pause_requested,
        })
    }

    async fn increment_retry(&self, tenant: &Tenant, job_id: JobId) -> Result<u32> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let count: Option<i32> = sqlx::query_scalar(
            "UPDATE marketplace_jobs SET retry_count = retry_count + 1 WHERE id = $1 RETURNING retry_count",
        )
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        count
            .map(|c| c.max(0) as u32)
            .ok_or_else(|| RelistError::job_not_found(job_id))
    }

    async fn tasks(&self, tenant: &Tenant, job_id: JobId) -> Result<Vec<Task>> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM marketplace_tasks WHERE job_id = $1 ORDER BY position",
            TASK_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn insert_tasks(
        &self,
        tenant: &Tenant,
        job_id: JobId,
        specs: Vec<TaskSpec>,
    ) -> Result<Vec<Task>> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let mut tasks = Vec::with_capacity(specs.len());

        for (position, spec) in specs.into_iter().enumerate() {
            let row = sqlx::query_as::<_, TaskRow>(&format!(
                r#"
                INSERT INTO marketplace_tasks (id, job_id, position, task_type, description, status, request)
                VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)
                RETURNING {}
                "#,
                TASK_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(job_id.0)
            .bind(position as i32)
            .bind(spec.request.task_type())
            .bind(&spec.description)
            .bind(serde_json::to_value(&spec.request)?)
            .fetch_one(&mut *tx)
            .await?;
            tasks.push(Task::try_from(row)?);
        }

        tx.commit().await?;
        Ok(tasks)
    }

    async fn save_task(&self, tenant: &Tenant, task: &Task) -> Result<bool> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let result = sqlx::query(
            r#"
            UPDATE marketplace_tasks t
            SET status = $2, result = $3, error_message = $4, retry_count = $5,
                started_at = $6, completed_at = $7
            FROM marketplace_jobs j
            WHERE t.id = $1 AND j.id = t.job_id AND j.status = 'RUNNING'
            "#,
        )
        .bind(task.id.0)
        .bind(task.status.as_str())
        .bind(&task.result)
        .bind(&task.error_message)
        .bind(task.retry_count as i32)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM marketplace_tasks WHERE id = $1")
                    .bind(task.id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.commit().await?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(RelistError::new(
                    ErrorCode::TaskNotFound,
                    format!("Task not found: {}", task.id),
                )),
            };
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn refresh_batch(&self, tenant: &Tenant, batch_id: BatchId) -> Result<Batch> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;

        // Serialize concurrent refreshes of the same batch.
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM batch_jobs WHERE id = $1 FOR UPDATE",
            BATCH_COLUMNS
        ))
        .bind(batch_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RelistError::batch_not_found(batch_id))?;
        let mut batch = Batch::try_from(row)?;

        let statuses: Vec<String> =
            sqlx::query_scalar("SELECT status FROM marketplace_jobs WHERE batch_id = $1")
                .bind(batch_id.0)
                .fetch_all(&mut *tx)
                .await?;
        let statuses = statuses
            .iter()
            .map(|s| s.parse::<JobStatus>())
            .collect::<Result<Vec<_>>>()?;

        apply_progress(&mut batch, &BatchProgress::from_statuses(statuses), Utc::now());

        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET total = $2, completed = $3, failed = $4, cancelled = $5, status = $6,
                started_at = $7, completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(batch_id.0)
        .bind(batch.total as i32)
        .bind(batch.completed as i32)
        .bind(batch.failed as i32)
        .bind(batch.cancelled as i32)
        .bind(batch.status.as_str())
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(batch)
    }

    async fn record_listing(
        &self,
        tenant: &Tenant,
        product_id: ProductId,
        marketplace: Marketplace,
        remote_id: Option<&str>,
    ) -> Result<()> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
        let result = sqlx::query(
            r#"
            UPDATE products
            SET listings = CASE
                    WHEN $3::text IS NULL THEN listings - $2
                    ELSE jsonb_set(listings, ARRAY[$2], to_jsonb($3::text))
                END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(product_id)
        .bind(marketplace.as_str())
        .bind(remote_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(RelistError::product_not_found(product_id));
        }
        Ok(())
    }

    async fn expire_stale(&self, tenant: &Tenant, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut tx = begin_tenant_tx(&self.pool, tenant).await?;

        // Rows locked by an in-flight claim are left for the next sweep.
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE marketplace_jobs
            SET status = 'EXPIRED', error_message = $2, completed_at = $1
            WHERE id IN (
                SELECT id FROM marketplace_jobs
                WHERE status IN ('PENDING', 'PAUSED') AND expires_at < $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(EXPIRED_MESSAGE)
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        if !ids.is_empty() {
            Self::cancel_unfinished_tasks(&mut tx, &ids).await?;
        }
        tx.commit().await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn fail_stuck(&self, tenant: &Tenant, started_before: DateTime<Utc>) -> Result<StuckSweep> {
        let candidates: Vec<Uuid> = {
            let mut tx = begin_tenant_tx(&self.pool, tenant).await?;
            let ids = sqlx::query_scalar(
                r#"
                SELECT id FROM marketplace_jobs
                WHERE status = 'RUNNING' AND started_at < $1
                ORDER BY started_at
                "#,
            )
            .bind(started_before)
            .fetch_all(&mut *tx)
            .await?;
            tx.commit().await?;
            ids
        };

        let mut sweep = StuckSweep::default();
        for id in candidates {
            let mut tx = begin_tenant_tx(&self.pool, tenant).await?;

            let row = nowait(
                sqlx::query_as::<_, JobRow>(&format!(
                    r#"
                    SELECT {} FROM marketplace_jobs
                    WHERE id = $1 AND status = 'RUNNING' AND started_at < $2
                    FOR UPDATE NOWAIT
                    "#,
                    JOB_COLUMNS
                ))
                .bind(id)
                .bind(started_before)
                .fetch_optional(&mut *tx)
                .await,
            )?;
            let row = match row {
                None => {
                    sweep.skipped_locked += 1;
                    continue;
                }
                // Finished between the scan and the lock.
                Some(None) => continue,
                Some(Some(row)) => row,
            };

            if let Some(product_id) = row.product_id {
                let locked = nowait(
                    sqlx::query_scalar::<_, i64>(
                        "SELECT id FROM products WHERE id = $1 FOR UPDATE NOWAIT",
                    )
                    .bind(product_id)
                    .fetch_optional(&mut *tx)
                    .await,
                )?;
                if locked.is_none() {
                    sweep.skipped_locked += 1;
                    continue;
                }
            }

            let row = sqlx::query_as::<_, JobRow>(&format!(
                r#"
                UPDATE marketplace_jobs
                SET status = 'FAILED', failed_step = 'worker', error_message = $2, completed_at = NOW()
                WHERE id = $1
                RETURNING {}
                "#,
                JOB_COLUMNS
            ))
            .bind(id)
            .bind(WORKER_LOST_MESSAGE)
            .fetch_one(&mut *tx)
            .await?;
            Self::cancel_unfinished_tasks(&mut tx, &[id]).await?;
            tx.commit().await?;

            sweep.failed.push(Job::try_from(row)?);
        }

        Ok(sweep)
    }
}

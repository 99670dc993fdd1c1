//! Claims pending jobs and drives them to a terminal state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::action::{ActionKind, ActionRegistry};
use super::cancellation::JobControl;
use super::job::{BatchId, Job, JobId, JobStatus};
use super::payload::PayloadEnvelope;
use super::retry::RetryPolicy;
use super::stats::StatsSink;
use super::store::{ClaimOutcome, Finish, JobStore};
use crate::db::{Tenant, TenantId};
use crate::error::Result;
use crate::handlers::{job_context, run_pipeline, HandlerRegistry, PipelineOutcome};
use crate::observability::metrics;
use crate::ratelimit::LimiterSet;
use crate::rpc::RpcClient;

const EVENT_BUFFER: usize = 256;

/// Notification that a job reached a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub tenant: TenantId,
    pub job_id: JobId,
    pub batch_id: Option<BatchId>,
    pub kind: ActionKind,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    fn from_job(tenant: &Tenant, job: &Job) -> Self {
        Self {
            tenant: tenant.id.clone(),
            job_id: job.id,
            batch_id: job.batch_id,
            kind: job.kind(),
            status: job.status,
            error_message: job.error_message.clone(),
            at: job.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Side effects of every terminal transition: batch aggregation, stats and
/// push notification. Failures are logged; the transition itself stands.
#[derive(Clone)]
pub struct TerminalHooks {
    store: Arc<dyn JobStore>,
    stats: Arc<dyn StatsSink>,
    events: broadcast::Sender<JobEvent>,
}

impl TerminalHooks {
    pub fn new(store: Arc<dyn JobStore>, stats: Arc<dyn StatsSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            stats,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub async fn apply(&self, tenant: &Tenant, job: &Job) {
        if let Some(batch_id) = job.batch_id {
            if let Err(e) = self.store.refresh_batch(tenant, batch_id).await {
                error!(tenant = %tenant.id, batch_id = %batch_id, error = %e, "Batch aggregation failed");
            }
        }

        // Expired jobs never ran.
        if job.status != JobStatus::Expired {
            let success = job.status == JobStatus::Completed;
            if let Err(e) = self.stats.record(tenant, job, success).await {
                warn!(tenant = %tenant.id, job_id = %job.id, error = %e, "Failed to record job stats");
            }
        }

        metrics::record_finished(job.status.as_str(), job.duration_secs());
        let _ = self.events.send(JobEvent::from_job(tenant, job));
    }
}

/// Result of one [`JobProcessor::process_next`] round.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// No pending job was available.
    Idle,
    /// Every candidate's product was busy.
    Conflicted { conflicts: usize },
    /// A job was claimed and driven as far as it would go.
    Processed(Job),
}

/// Claims and runs jobs for any tenant.
#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    actions: Arc<ActionRegistry>,
    rpc: RpcClient,
    limiters: LimiterSet,
    retry: RetryPolicy,
    hooks: TerminalHooks,
    claim_batch_size: i64,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        actions: Arc<ActionRegistry>,
        rpc: RpcClient,
        limiters: LimiterSet,
        retry: RetryPolicy,
        hooks: TerminalHooks,
    ) -> Self {
        Self {
            store,
            handlers,
            actions,
            rpc,
            limiters,
            retry,
            hooks,
            claim_batch_size: 10,
        }
    }

    pub fn with_claim_batch_size(mut self, size: i64) -> Self {
        self.claim_batch_size = size.max(1);
        self
    }

    pub fn hooks(&self) -> &TerminalHooks {
        &self.hooks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.hooks.subscribe()
    }

    /// Claim the best pending job of `tenant` and run it.
    pub async fn process_next(&self, tenant: &Tenant) -> Result<ProcessOutcome> {
        let candidates = self
            .store
            .pending_candidates(tenant, self.claim_batch_size)
            .await?;
        if candidates.is_empty() {
            return Ok(ProcessOutcome::Idle);
        }

        let mut conflicts = 0;
        for candidate in candidates {
            match self.process(tenant, candidate.id).await? {
                ProcessOutcome::Processed(job) => return Ok(ProcessOutcome::Processed(job)),
                ProcessOutcome::Conflicted { .. } => conflicts += 1,
                ProcessOutcome::Idle => {}
            }
        }

        Ok(if conflicts > 0 {
            ProcessOutcome::Conflicted { conflicts }
        } else {
            ProcessOutcome::Idle
        })
    }

    /// Claim one specific job and run it if the claim succeeds.
    pub async fn process(&self, tenant: &Tenant, job_id: JobId) -> Result<ProcessOutcome> {
        let claim = self.claim(tenant, job_id).await?;
        match claim {
            ClaimOutcome::Claimed(job) => {
                Ok(ProcessOutcome::Processed(self.run_claimed(tenant, job).await?))
            }
            ClaimOutcome::Rejected(job) => {
                warn!(
                    tenant = %tenant.id,
                    job_id = %job.id,
                    error = ?job.error_message,
                    "Job rejected at claim"
                );
                self.hooks.apply(tenant, &job).await;
                Ok(ProcessOutcome::Processed(job))
            }
            ClaimOutcome::Conflict => {
                metrics::record_conflict();
                debug!(tenant = %tenant.id, job_id = %job_id, "Product busy; job stays pending");
                Ok(ProcessOutcome::Conflicted { conflicts: 1 })
            }
            ClaimOutcome::Unavailable => Ok(ProcessOutcome::Idle),
        }
    }

    async fn claim(&self, tenant: &Tenant, job_id: JobId) -> Result<ClaimOutcome> {
        let job = self.store.get_job(tenant, job_id).await?;
        let lock_product = self.actions.is_mutating(job.action);
        self.store
            .claim(tenant, job_id, lock_product)
            .instrument(info_span!("claim", tenant = %tenant.id, job_id = %job_id, lock_product))
            .await
    }

    /// Drive a claimed (RUNNING) job. Returns the job as stored afterwards.
    pub async fn run_claimed(&self, tenant: &Tenant, job: Job) -> Result<Job> {
        let span = info_span!("job", tenant = %tenant.id, job_id = %job.id, kind = %job.kind());
        async move {
            metrics::record_claimed();
            info!("Job started");

            let finish = match self.execute(tenant, &job).await {
                Ok(PipelineOutcome::Completed(output)) => Some(Finish::Completed {
                    result: PayloadEnvelope::new(output),
                }),
                Ok(PipelineOutcome::Failed { step, message }) => Some(Finish::Failed { step, message }),
                Ok(PipelineOutcome::Cancelled) => Some(Finish::Cancelled),
                Ok(PipelineOutcome::Paused) | Ok(PipelineOutcome::Abandoned) => None,
                Err(e) => {
                    e.log();
                    Some(Finish::Failed {
                        step: "processor".to_string(),
                        message: e.to_string(),
                    })
                }
            };

            let Some(finish) = finish else {
                info!("Job stopped without finishing");
                return self.store.get_job(tenant, job.id).await;
            };

            match self.store.finish(tenant, job.id, finish).await? {
                Some(done) => {
                    info!(status = %done.status, "Job finished");
                    self.hooks.apply(tenant, &done).await;
                    Ok(done)
                }
                None => {
                    // Swept while the last task ran.
                    debug!("Terminal transition lost to a concurrent change");
                    self.store.get_job(tenant, job.id).await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, tenant: &Tenant, job: &Job) -> Result<PipelineOutcome> {
        let handler = match self.handlers.get(job.kind()) {
            Ok(handler) => handler,
            Err(e) => {
                return Ok(PipelineOutcome::Failed {
                    step: "dispatch".to_string(),
                    message: e.to_string(),
                })
            }
        };

        let ctx = job_context(
            tenant,
            job,
            &self.rpc,
            &self.limiters,
            &self.actions,
            self.store.clone(),
        );
        let control = JobControl::new(self.store.clone(), tenant.clone(), job.id);
        run_pipeline(handler.as_ref(), &ctx, &control, &self.retry).await
    }
}

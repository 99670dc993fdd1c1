//! Ordered, resumable task execution for one claimed job.

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};

use super::{JobContext, MarketplaceHandler, TaskFailure};
use crate::error::Result;
use crate::jobs::{Checkpoint, JobControl, JobId, JobOutput, RetryPolicy, Task, TaskStatus};

/// How the task pipeline of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed(JobOutput),
    Failed { step: String, message: String },
    Cancelled,
    /// Paused at a safe point; the job stays PAUSED.
    Paused,
    /// The job left RUNNING through another path; leave it alone.
    Abandoned,
}

fn stop(checkpoint: Checkpoint) -> Option<PipelineOutcome> {
    match checkpoint {
        Checkpoint::Continue => None,
        Checkpoint::Cancel => Some(PipelineOutcome::Cancelled),
        Checkpoint::Pause => Some(PipelineOutcome::Paused),
        Checkpoint::Abandon => Some(PipelineOutcome::Abandoned),
    }
}

/// Run the tasks of `ctx.job` in position order.
///
/// Tasks already SUCCESS (from an earlier run of a resumed job) are skipped.
/// The control is checked before every task and before every retry, never
/// while a task is executing. Every retry consumes one unit of the job's
/// retry budget.
pub async fn run_pipeline(
    handler: &dyn MarketplaceHandler,
    ctx: &JobContext,
    control: &JobControl,
    retry: &RetryPolicy,
) -> Result<PipelineOutcome> {
    let store = &ctx.store;
    let job = &ctx.job;

    let mut tasks = store.tasks(&ctx.tenant, job.id).await?;
    if tasks.is_empty() {
        let specs = match handler.create_tasks(job) {
            Ok(specs) => specs,
            Err(e) => {
                return Ok(PipelineOutcome::Failed {
                    step: "plan".to_string(),
                    message: e.to_string(),
                })
            }
        };
        tasks = store.insert_tasks(&ctx.tenant, job.id, specs).await?;
    }

    let mut retries_used = job.retry_count;

    for index in 0..tasks.len() {
        if tasks[index].status == TaskStatus::Success {
            continue;
        }

        let (done, rest) = tasks.split_at_mut(index);
        let task = &mut rest[0];
        let span = info_span!("task", position = task.position, description = %task.description);

        loop {
            if let Some(outcome) = stop(control.checkpoint().await?) {
                return Ok(outcome);
            }

            task.status = TaskStatus::Processing;
            task.started_at = Some(Utc::now());
            task.completed_at = None;
            if !store.save_task(&ctx.tenant, task).await? {
                return Ok(PipelineOutcome::Abandoned);
            }

            let result = handler
                .execute_task(ctx, task, done)
                .instrument(span.clone())
                .await;

            task.completed_at = Some(Utc::now());
            match result {
                Ok(value) => {
                    task.status = TaskStatus::Success;
                    task.result = Some(value);
                    task.error_message = None;
                    if !store.save_task(&ctx.tenant, task).await? {
                        return Ok(abandoned(job.id, task));
                    }
                    break;
                }
                Err(failure) => {
                    task.status = failure.task_status();
                    task.error_message = Some(failure.message().to_string());
                    if !store.save_task(&ctx.tenant, task).await? {
                        return Ok(abandoned(job.id, task));
                    }

                    if !retry.should_retry(retries_used, job.max_retries, failure.is_retryable()) {
                        info!(
                            job_id = %job.id,
                            step = %task.description,
                            error = %failure,
                            "Task failed; giving up"
                        );
                        return Ok(failed(task, &failure));
                    }

                    let delay = retry.next_retry_delay(retries_used);
                    retries_used = store.increment_retry(&ctx.tenant, job.id).await?;
                    task.retry_count += 1;
                    warn!(
                        job_id = %job.id,
                        step = %task.description,
                        error = %failure,
                        retries_used,
                        ?delay,
                        "Task failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    match handler.build_output(job, &tasks) {
        Ok(output) => Ok(PipelineOutcome::Completed(output)),
        Err(e) => Ok(PipelineOutcome::Failed {
            step: "finalize".to_string(),
            message: e.to_string(),
        }),
    }
}

/// The job left RUNNING while `task` was executing; its result is dropped.
fn abandoned(job_id: JobId, task: &Task) -> PipelineOutcome {
    warn!(%job_id, step = %task.description, "Job left RUNNING mid-task; dropping result");
    PipelineOutcome::Abandoned
}

fn failed(task: &Task, failure: &TaskFailure) -> PipelineOutcome {
    PipelineOutcome::Failed {
        step: task.description.clone(),
        message: failure.message().to_string(),
    }
}

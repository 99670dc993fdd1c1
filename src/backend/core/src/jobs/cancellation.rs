//! Cooperative cancellation and pause for running jobs.
//!
//! A [`JobControl`] travels with a job through its handler. It is consulted
//! only at safe points between tasks; nothing here interrupts a remote call
//! that is already in flight.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::job::{JobId, JobStatus};
use super::store::JobStore;
use crate::db::Tenant;
use crate::error::Result;

/// What the handler should do at a safe point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    /// Stop and end the job CANCELLED.
    Cancel,
    /// Stop without finishing; the job was paused.
    Pause,
    /// Stop without touching the job; it left RUNNING through another path.
    Abandon,
}

/// Cancellation handle for one claimed job.
#[derive(Clone)]
pub struct JobControl {
    store: Arc<dyn JobStore>,
    tenant: Tenant,
    job_id: JobId,
    token: CancellationToken,
}

impl JobControl {
    pub fn new(store: Arc<dyn JobStore>, tenant: Tenant, job_id: JobId) -> Self {
        Self {
            store,
            tenant,
            job_id,
            token: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Request cancellation from within this process. Observed at the next
    /// checkpoint, like the persisted flag.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested locally or observed.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that fires once cancellation is requested or observed.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Read the job's persisted control state and decide.
    ///
    /// A pending pause request is settled here: the job moves to PAUSED only
    /// once its worker stands at a safe point, so it cannot be resumed and
    /// claimed again while a task of this run is still in flight.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let decision = loop {
            let state = self.store.control_state(&self.tenant, self.job_id).await?;
            break match state.status {
                JobStatus::Running if state.cancel_requested || self.token.is_cancelled() => {
                    Checkpoint::Cancel
                }
                JobStatus::Running if state.pause_requested => {
                    match self.store.park(&self.tenant, self.job_id).await? {
                        Some(_) => Checkpoint::Pause,
                        // Withdrawn or cancelled since the read.
                        None => continue,
                    }
                }
                JobStatus::Running => Checkpoint::Continue,
                JobStatus::Paused => Checkpoint::Pause,
                JobStatus::Cancelled => Checkpoint::Cancel,
                _ => Checkpoint::Abandon,
            };
        };

        if decision == Checkpoint::Cancel {
            self.token.cancel();
        }
        if decision != Checkpoint::Continue {
            debug!(tenant = %self.tenant.id, job_id = %self.job_id, ?decision, "Checkpoint stops job");
        }
        Ok(decision)
    }
}

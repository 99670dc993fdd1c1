//! Marketplace handlers.
//!
//! A handler owns one (marketplace, action) pair. It plans a job as an
//! ordered list of tasks, executes one task at a time, and assembles the
//! job result from the finished tasks. Ordering, retries, cancellation and
//! persistence are driven by [`pipeline`].

pub mod pipeline;
pub mod remote;

pub use pipeline::{run_pipeline, PipelineOutcome};
pub use remote::{ConnectionCheckHandler, RemoteHandler, RequestPlanner, RestPlanner};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::Tenant;
use crate::error::{RelistError, Result};
use crate::jobs::{
    ActionCode, ActionKind, ActionRegistry, Job, JobOutput, JobStore, Marketplace, Task,
    TaskSpec, TaskStatus,
};
use crate::ratelimit::{LimiterSet, SurfaceLimiter};
use crate::rpc::{RpcClient, RpcError};

/// Why a task attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure {
    /// No answer in time; retried within the job's budget.
    #[error("{0}")]
    Timeout(String),
    /// Worth another attempt.
    #[error("{0}")]
    Transient(String),
    /// Never retried.
    #[error("{0}")]
    Fatal(String),
}

impl TaskFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::Timeout(m) | Self::Transient(m) | Self::Fatal(m) => m,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Status recorded on the task for this failure.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Timeout(_) => TaskStatus::Timeout,
            _ => TaskStatus::Failed,
        }
    }
}

impl From<RpcError> for TaskFailure {
    fn from(err: RpcError) -> Self {
        let message = err.to_string();
        match err {
            RpcError::Timeout(_) => Self::Timeout(message),
            RpcError::Disconnected | RpcError::ChannelClosed => Self::Transient(message),
            RpcError::NotConnected(_) | RpcError::Remote(_) | RpcError::Encode(_) => {
                Self::Fatal(message)
            }
        }
    }
}

impl From<RelistError> for TaskFailure {
    fn from(err: RelistError) -> Self {
        let message = err.to_string();
        if err.is_retryable() {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }
}

/// Everything a handler may use while executing one job.
#[derive(Clone)]
pub struct JobContext {
    pub tenant: Tenant,
    pub job: Job,
    pub rpc: RpcClient,
    pub limiter: Arc<SurfaceLimiter>,
    pub store: Arc<dyn JobStore>,
    /// Timeout for each executor call, from the action's class.
    pub call_timeout: Duration,
}

#[async_trait]
pub trait MarketplaceHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Plan the job. Called once per job; the plan is persisted.
    fn create_tasks(&self, job: &Job) -> Result<Vec<TaskSpec>>;

    /// Execute one task. `completed` holds the tasks before it, all SUCCESS.
    async fn execute_task(
        &self,
        ctx: &JobContext,
        task: &Task,
        completed: &[Task],
    ) -> std::result::Result<Value, TaskFailure>;

    /// Assemble the job result once every task succeeded.
    fn build_output(&self, job: &Job, tasks: &[Task]) -> Result<JobOutput>;
}

/// Static mapping from action kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionKind, Arc<dyn MarketplaceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote handlers for every marketplace and action.
    pub fn with_defaults(actions: &ActionRegistry) -> Self {
        let mut registry = Self::new();
        for marketplace in Marketplace::ALL {
            let planner = Arc::new(RestPlanner::new(marketplace));
            for definition in actions.definitions() {
                let kind = ActionKind::new(marketplace, definition.code);
                if definition.code == ActionCode::CheckConnection {
                    registry.register(Arc::new(ConnectionCheckHandler::new(marketplace)));
                } else {
                    registry.register(Arc::new(RemoteHandler::new(kind, planner.clone())));
                }
            }
        }
        registry
    }

    /// Register a handler under its kind, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn MarketplaceHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: ActionKind) -> Result<Arc<dyn MarketplaceHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| RelistError::handler_not_found(kind))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builds a [`JobContext`] for a claimed job.
pub(crate) fn job_context(
    tenant: &Tenant,
    job: &Job,
    rpc: &RpcClient,
    limiters: &LimiterSet,
    actions: &ActionRegistry,
    store: Arc<dyn JobStore>,
) -> JobContext {
    let call_timeout = actions
        .get(job.action)
        .map(|def| rpc.timeout_for(def.rpc_class))
        .unwrap_or_else(|_| rpc.timeout_for(crate::jobs::RpcClass::Write));

    JobContext {
        tenant: tenant.clone(),
        job: job.clone(),
        rpc: rpc.clone(),
        limiter: limiters.get(job.marketplace),
        store,
        call_timeout,
    }
}

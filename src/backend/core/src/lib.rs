#![allow(clippy::result_large_err)]
//! # Relist Core
//!
//! Multi-tenant job orchestration for marketplace listing operations.
//!
//! ## Architecture
//!
//! - **Jobs**: Job/Task/Batch model, claim discipline, processor, worker loops
//! - **Handlers**: Per (marketplace, action) task planning and execution
//! - **RPC**: Correlated command channel to each tenant's remote executor
//! - **Rate limiting**: Jittered minimum-delay and token-bucket limiters
//! - **Keepalive**: Periodic pings and session health per connected tenant
//! - **Cleanup**: Expiry of stale work and recovery of stuck workers
//! - **Observability**: Structured tracing, OTLP export, Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod keepalive;
pub mod observability;
pub mod ratelimit;
pub mod rpc;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, RelistError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::db::{Tenant, TenantDirectory, TenantId};
    pub use crate::error::{ErrorCode, ErrorContext, RelistError, Result};
    pub use crate::handlers::{HandlerRegistry, JobContext, MarketplaceHandler, TaskFailure};
    pub use crate::jobs::{
        ActionCode, ActionKind, ActionRegistry, Batch, BatchStatus, CleanupScheduler, CreateBatch,
        CreateJob, Job, JobId, JobInput, JobOutput, JobProcessor, JobService, JobStatus, JobStore,
        JobWorker, Marketplace, Task, TaskStatus,
    };
    pub use crate::keepalive::{KeepaliveService, SessionHealth, SessionState};
    pub use crate::ratelimit::{LimiterSet, MinDelayLimiter, TokenBucketLimiter};
    pub use crate::rpc::{ExecutorGateway, ExecutorRegistry, RpcClient, RpcError};
}

//! Marketplace jobs: model, persistence and execution.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  JobService  │────▶│  JobStore   │◀────│ JobProcessor │────▶│   Handler    │
//! │ (create,     │     │ (Postgres / │     │ (claim, run, │     │ (tasks, RPC, │
//! │  cancel...)  │     │  in-memory) │     │  finish)     │     │  limiter)    │
//! └──────────────┘     └─────────────┘     └──────────────┘     └──────────────┘
//!                            ▲                    ▲
//!                            │                    │
//!                   ┌──────────────────┐   ┌─────────────┐
//!                   │ CleanupScheduler │   │  JobWorker  │
//!                   │ (expire, stuck)  │   │  (loops)    │
//!                   └──────────────────┘   └─────────────┘
//! ```
//!
//! Every terminal transition, whichever path causes it, goes through
//! [`TerminalHooks`]: batch aggregation, the stats sink and a [`JobEvent`].

pub mod action;
pub mod cancellation;
pub mod cleanup;
pub mod job;
pub mod payload;
pub mod processor;
pub mod retry;
pub mod service;
pub mod stats;
pub mod store;
pub mod worker;

pub use action::{ActionCode, ActionDefinition, ActionKind, ActionRegistry, Marketplace, RpcClass};
pub use cancellation::{Checkpoint, JobControl};
pub use cleanup::{CleanupReport, CleanupScheduler};
pub use job::{
    Batch, BatchId, BatchProgress, BatchStatus, Job, JobId, JobPriority, JobStatus, NewJob,
    ProductId, Task, TaskId, TaskSpec, TaskStatus,
};
pub use payload::{HttpMethod, JobInput, JobOutput, PayloadEnvelope, TaskRequest};
pub use processor::{JobEvent, JobProcessor, ProcessOutcome, TerminalHooks};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use service::{idempotency_key, BatchItem, CreateBatch, CreateJob, JobService};
pub use stats::{DailyStats, InMemoryStatsSink, PgStatsSink, StatsSink};
pub use store::{
    ClaimOutcome, ControlState, Finish, InMemoryJobStore, JobStore, NewBatch, PgJobStore, ProductLockGuard,
    StuckSweep, EXPIRED_MESSAGE, WORKER_LOST_MESSAGE,
};
pub use worker::{JobWorker, WorkerHandle, WorkerStats};

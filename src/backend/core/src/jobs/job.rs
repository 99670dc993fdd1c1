//! Job, Task and Batch records and their state machines.
//!
//! - **JobStatus**: `PENDING -> RUNNING -> {COMPLETED | FAILED | CANCELLED | EXPIRED}`
//!   with a `PAUSED` detour
//! - **TaskStatus**: `PENDING -> PROCESSING -> {SUCCESS | FAILED | TIMEOUT | CANCELLED}`
//! - **BatchStatus**: always derived from the child job statuses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::action::{ActionCode, ActionKind, Marketplace};
use super::payload::{JobInput, JobOutput, PayloadEnvelope, TaskRequest};
use crate::error::{ErrorCode, RelistError};

/// Product identifier inside a tenant namespace.
pub type ProductId = i64;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a job.
    JobId
);
uuid_id!(
    /// Unique identifier for a batch.
    BatchId
);
uuid_id!(
    /// Unique identifier for a task.
    TaskId
);

// ═══════════════════════════════════════════════════════════════════════════════
// Status Enums
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker
    Running,
    /// Stopped by a user; resumes to PENDING
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// Never ran within its expiry window
    Expired,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Pending or running: the job occupies its product.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Pending | Running | Paused, Cancelled) => true,
            (Pending | Paused, Expired) => true,
            (Pending | Running, Paused) => true,
            (Paused, Pending) => true,
            // A product that vanished before the claim fails the job outright.
            (Pending, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RelistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                RelistError::new(ErrorCode::DeserializationError, format!("Unknown job status: {}", s))
            })
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Success,
        Self::Failed,
        Self::Timeout,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RelistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                RelistError::new(ErrorCode::DeserializationError, format!("Unknown task status: {}", s))
            })
    }
}

/// Status of a batch, derived from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    PartiallyFailed,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::PartiallyFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::PartiallyFailed => "PARTIALLY_FAILED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::PartiallyFailed
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = RelistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                RelistError::new(ErrorCode::DeserializationError, format!("Unknown batch status: {}", s))
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs. Advisory only: it orders claim candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Get the numeric value used for ordering in storage.
    pub fn score(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Normal => 100,
            Self::High => 200,
            Self::Critical => 300,
        }
    }

    /// Inverse of [`score`](Self::score); unknown scores round down.
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 300 => Self::Critical,
            s if s >= 200 => Self::High,
            s if s >= 100 => Self::Normal,
            _ => Self::Low,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// One operation against one marketplace for (optionally) one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    pub marketplace: Marketplace,
    pub action: ActionCode,
    pub product_id: Option<ProductId>,
    pub idempotency_key: String,
    pub status: JobStatus,
    /// Cooperative cancellation flag, observed between tasks.
    pub cancel_requested: bool,
    /// Pause requested while RUNNING; the worker parks the job at its next
    /// safe point.
    pub pause_requested: bool,
    pub priority: JobPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub input: PayloadEnvelope<JobInput>,
    pub result: Option<PayloadEnvelope<JobOutput>>,
    pub failed_step: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Job {
    pub fn kind(&self) -> ActionKind {
        ActionKind::new(self.marketplace, self.action)
    }

    /// Seconds between claim and completion, when both are known.
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// A job about to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub batch_id: Option<BatchId>,
    pub marketplace: Marketplace,
    pub action: ActionCode,
    pub product_id: Option<ProductId>,
    pub idempotency_key: String,
    pub priority: JobPriority,
    pub max_retries: u32,
    pub input: PayloadEnvelope<JobInput>,
    pub expires_at: DateTime<Utc>,
}

/// A single atomic step inside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Execution order inside the job, starting at 0.
    pub position: i32,
    pub description: String,
    pub status: TaskStatus,
    pub request: TaskRequest,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A planned step, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub description: String,
    pub request: TaskRequest,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, request: TaskRequest) -> Self {
        Self {
            description: description.into(),
            request,
        }
    }
}

/// A group of jobs created from one bulk request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub marketplace: Marketplace,
    pub action: ActionCode,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub priority: JobPriority,
    pub status: BatchStatus,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batch Aggregation
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters and status of a batch computed from its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: u32,
    pub completed: u32,
    /// Failed and expired children.
    pub failed: u32,
    pub cancelled: u32,
    pub running: u32,
    pub status: BatchStatus,
}

impl BatchProgress {
    /// Aggregate child statuses. Pure: the same multiset always yields the
    /// same progress, so recomputing is idempotent.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut progress = Self {
            total: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            running: 0,
            status: BatchStatus::Pending,
        };

        for status in statuses {
            progress.total += 1;
            match status {
                JobStatus::Completed => progress.completed += 1,
                JobStatus::Failed | JobStatus::Expired => progress.failed += 1,
                JobStatus::Cancelled => progress.cancelled += 1,
                JobStatus::Running => progress.running += 1,
                JobStatus::Pending | JobStatus::Paused => {}
            }
        }

        progress.status = progress.derive_status();
        progress
    }

    pub fn finished(&self) -> u32 {
        self.completed + self.failed + self.cancelled
    }

    /// Final statuses only once every child is terminal.
    fn derive_status(&self) -> BatchStatus {
        if self.running > 0 {
            return BatchStatus::Running;
        }
        if self.total == 0 || self.finished() < self.total {
            return BatchStatus::Pending;
        }
        if self.completed == self.total {
            BatchStatus::Completed
        } else if self.failed == self.total {
            BatchStatus::Failed
        } else if self.cancelled == self.total {
            BatchStatus::Cancelled
        } else if self.completed > 0 {
            BatchStatus::PartiallyFailed
        } else {
            // Failures mixed with cancellations, no success.
            BatchStatus::Failed
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn test_job_status_terminal() {
        assert!(Completed.is_terminal());
        assert!(Expired.is_terminal());
        assert!(!Paused.is_terminal());
        assert!(Running.is_active());
        assert!(!Paused.is_active());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_expiry_only_from_waiting_states() {
        let sources: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(Expired))
            .collect();
        assert_eq!(sources, vec![Pending, Paused]);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("PAUSED".parse::<JobStatus>().unwrap(), Paused);
        assert_eq!(
            "PARTIALLY_FAILED".parse::<BatchStatus>().unwrap(),
            BatchStatus::PartiallyFailed
        );
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert_eq!(JobPriority::from_score(JobPriority::High.score()), JobPriority::High);
        assert_eq!(JobPriority::from_score(-5), JobPriority::Low);
    }

    #[test]
    fn test_batch_two_completed_one_failed_is_partial() {
        let progress = BatchProgress::from_statuses([Completed, Completed, Failed]);
        assert_eq!(progress.status, BatchStatus::PartiallyFailed);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.failed, 1);
    }

    #[test]
    fn test_batch_uniform_outcomes() {
        assert_eq!(
            BatchProgress::from_statuses([Completed, Completed]).status,
            BatchStatus::Completed
        );
        assert_eq!(BatchProgress::from_statuses([Failed, Expired]).status, BatchStatus::Failed);
        assert_eq!(
            BatchProgress::from_statuses([Cancelled, Cancelled]).status,
            BatchStatus::Cancelled
        );
        assert_eq!(BatchProgress::from_statuses([Failed, Cancelled]).status, BatchStatus::Failed);
    }

    #[test]
    fn test_batch_in_flight() {
        assert_eq!(BatchProgress::from_statuses([Running, Pending]).status, BatchStatus::Running);
        assert_eq!(BatchProgress::from_statuses([Completed, Pending]).status, BatchStatus::Pending);
        assert_eq!(BatchProgress::from_statuses(Vec::new()).status, BatchStatus::Pending);

        let mixed = BatchProgress::from_statuses([Completed, Failed, Running]);
        assert_eq!(mixed.status, BatchStatus::Running);
        assert!(!mixed.status.is_final());
        assert_eq!(
            BatchProgress::from_statuses([Completed, Failed, Pending]).status,
            BatchStatus::Pending
        );
        assert_eq!(
            BatchProgress::from_statuses([Failed, Cancelled, Paused]).status,
            BatchStatus::Pending
        );
    }

    #[test]
    fn test_batch_aggregation_is_order_independent() {
        let a = BatchProgress::from_statuses([Failed, Completed, Cancelled, Completed]);
        let b = BatchProgress::from_statuses([Completed, Cancelled, Completed, Failed]);
        assert_eq!(a, b);
        assert!(a.finished() <= a.total);
    }
}

//! Crate-wide error type.
//!
//! Every fallible operation returns [`RelistError`], which carries a stable
//! [`ErrorCode`]. Codes drive three decisions elsewhere in the crate:
//!
//! - whether a task attempt is worth retrying ([`ErrorCode::is_retryable`])
//! - how loudly the error is logged ([`ErrorSeverity`])
//! - which HTTP status the executor handshake answers with
//!
//! Errors that end a job are not propagated to the job's creator; they are
//! recorded on the job as `failed_step` and `error_message`.
//!
//! ```rust,ignore
//! use relist_core::error::{ErrorContext, Result};
//!
//! fn tenant_schema(raw: Option<&str>) -> Result<&str> {
//!     raw.context("Tenant has no schema")
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::jobs::{JobId, JobStatus, ProductId};

pub type Result<T> = std::result::Result<T, RelistError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable, machine-readable error codes. Used as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Jobs and claims
    JobNotFound,
    BatchNotFound,
    TaskNotFound,
    ProductNotFound,
    InvalidStateTransition,
    LockConflict,
    HandlerNotFound,
    InvalidPayload,

    // Executor channel
    ExecutorNotConnected,
    ExecutorDisconnected,
    RpcTimeout,
    RpcRemoteError,
    RpcChannelClosed,

    // Storage
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Encoding
    SerializationError,
    DeserializationError,

    // Executor handshake
    Unauthorized,
    Forbidden,
    InvalidToken,
    TokenExpired,
    TenantInactive,

    // Caller input
    ValidationError,
    InvalidTenant,

    // Startup
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    InternalError,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::BatchNotFound => 1001,
            Self::TaskNotFound => 1002,
            Self::ProductNotFound => 1003,
            Self::InvalidStateTransition => 1004,
            Self::LockConflict => 1005,
            Self::HandlerNotFound => 1006,
            Self::InvalidPayload => 1007,

            Self::ExecutorNotConnected => 1100,
            Self::ExecutorDisconnected => 1101,
            Self::RpcTimeout => 1102,
            Self::RpcRemoteError => 1103,
            Self::RpcChannelClosed => 1104,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2003,
            Self::DuplicateRecord => 2004,

            Self::SerializationError => 2100,
            Self::DeserializationError => 2101,

            Self::Unauthorized => 3000,
            Self::Forbidden => 3001,
            Self::InvalidToken => 3002,
            Self::TokenExpired => 3003,
            Self::TenantInactive => 3004,

            Self::ValidationError => 4000,
            Self::InvalidTenant => 4001,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Group used for the `category` metric label.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "rpc",
            2000..=2099 => "database",
            2100..=2199 => "encoding",
            3000..=3099 => "handshake",
            4000..=4099 => "validation",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }

    /// Status answered when this error ends an HTTP request.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::JobNotFound
            | Self::BatchNotFound
            | Self::TaskNotFound
            | Self::ProductNotFound
            | Self::HandlerNotFound
            | Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::InvalidStateTransition | Self::LockConflict | Self::DuplicateRecord => {
                StatusCode::CONFLICT
            }

            Self::InvalidPayload | Self::ValidationError | Self::InvalidTenant => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            Self::Unauthorized | Self::InvalidToken | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::TenantInactive => StatusCode::FORBIDDEN,

            Self::RpcTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::RpcRemoteError => StatusCode::BAD_GATEWAY,
            Self::ExecutorNotConnected
            | Self::ExecutorDisconnected
            | Self::RpcChannelClosed
            | Self::DatabaseConnectionFailed => StatusCode::SERVICE_UNAVAILABLE,

            Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether another attempt may succeed without anything changing.
    ///
    /// A lock conflict counts: the job stays pending and a later claim
    /// cycle picks it up.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockConflict
                | Self::RpcTimeout
                | Self::ExecutorDisconnected
                | Self::RpcChannelClosed
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Severity
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected contention and caller mistakes
    Low,
    /// The executor or a marketplace misbehaving
    Medium,
    /// Our own data or code is wrong
    High,
    /// The process cannot do useful work
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        use ErrorCode::*;
        match code {
            JobNotFound | BatchNotFound | TaskNotFound | ProductNotFound | RecordNotFound
            | DuplicateRecord | InvalidStateTransition | LockConflict | ValidationError
            | InvalidTenant => Self::Low,

            ExecutorNotConnected | ExecutorDisconnected | RpcTimeout | RpcRemoteError
            | RpcChannelClosed | Unauthorized | Forbidden | InvalidToken | TokenExpired
            | TenantInactive => Self::Medium,

            HandlerNotFound | InvalidPayload | DatabaseError | DatabaseQueryFailed
            | SerializationError | DeserializationError | ConfigurationError
            | MissingConfiguration | InvalidConfiguration => Self::High,

            DatabaseConnectionFailed | InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured context attached to an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Kind of entity involved: job, batch, product, tenant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn entity(entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.to_string()),
            context: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entity_id.is_none() && self.context.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RelistError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct RelistError {
    code: ErrorCode,

    /// Safe to record on a job or send to a caller
    message: Cow<'static, str>,

    /// Logged only
    internal: Option<String>,

    details: ErrorDetails,

    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RelistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(internal) = &self.internal {
            write!(f, " ({})", internal)?;
        }
        Ok(())
    }
}

impl RelistError {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal: None,
            details: ErrorDetails::default(),
            source: None,
        };
        counter!(
            "relist_errors_total",
            "code" => code.to_string(),
            "category" => code.category(),
            "severity" => format!("{:?}", ErrorSeverity::from_code(&code)).to_lowercase(),
            "retryable" => code.is_retryable().to_string(),
        )
        .increment(1);
        error
    }

    /// An error whose cause is worth logging but not recording on a job.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal = Some(internal.into());
        error
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), value);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_lock_conflict(&self) -> bool {
        self.code == ErrorCode::LockConflict
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Emit one event at the level matching the severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                error_code = %code,
                category,
                message = %self.message,
                internal = ?self.internal,
                details = ?self.details,
                source = ?self.source,
                "Operation failed"
            ),
            ErrorSeverity::Medium => warn!(
                error_code = %code,
                category,
                message = %self.message,
                internal = ?self.internal,
                "Operation failed"
            ),
            ErrorSeverity::Low => debug!(
                error_code = %code,
                category,
                message = %self.message,
                "Operation failed"
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl RelistError {
    pub fn job_not_found(job_id: JobId) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::entity("job", job_id))
    }

    pub fn batch_not_found(batch_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::BatchNotFound, format!("Batch not found: {}", batch_id))
            .with_details(ErrorDetails::entity("batch", batch_id))
    }

    pub fn product_not_found(product_id: ProductId) -> Self {
        Self::new(ErrorCode::ProductNotFound, format!("Product not found: {}", product_id))
            .with_details(ErrorDetails::entity("product", product_id))
    }

    pub fn invalid_state_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition: {} -> {}", from, to),
        )
        .with_context("from_state", from.to_string())
        .with_context("to_state", to.to_string())
    }

    /// The product is locked or already has a RUNNING job.
    pub fn lock_conflict(product_id: ProductId) -> Self {
        Self::new(
            ErrorCode::LockConflict,
            format!("Product {} is being processed by another worker", product_id),
        )
        .with_details(ErrorDetails::entity("product", product_id))
    }

    pub fn duplicate_job(idempotency_key: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateRecord,
            "A job with the same idempotency key is already active",
        )
        .with_context("idempotency_key", idempotency_key)
    }

    pub fn handler_not_found(kind: impl fmt::Display) -> Self {
        Self::new(ErrorCode::HandlerNotFound, format!("No handler registered for {}", kind))
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidPayload, message.into())
    }

    pub fn invalid_tenant(tenant: impl Into<String>) -> Self {
        let tenant = tenant.into();
        Self::new(ErrorCode::InvalidTenant, format!("Invalid tenant namespace: {}", tenant))
            .with_details(ErrorDetails::entity("tenant", &tenant))
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON body of an error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

impl From<&RelistError> for ErrorResponse {
    fn from(error: &RelistError) -> Self {
        Self {
            code: error.code,
            numeric_code: error.code.numeric_code(),
            message: error.message.to_string(),
            details: (!error.details.is_empty()).then(|| error.details.clone()),
        }
    }
}

impl IntoResponse for RelistError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.code.http_status();
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context extension
// ═══════════════════════════════════════════════════════════════════════════════

pub trait ErrorContext<T> {
    /// Wrap the failure as an internal error with `message`.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the failure under a specific code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RelistError::internal(message).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| RelistError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RelistError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| RelistError::new(code, "Value missing"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLSTATE of `FOR UPDATE NOWAIT` on a held row.
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
const PG_UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for RelistError {
    fn from(error: sqlx::Error) -> Self {
        let (code, message) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "Record not found"),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(PG_LOCK_NOT_AVAILABLE) => {
                    (ErrorCode::LockConflict, "Row is locked by another worker")
                }
                Some(PG_UNIQUE_VIOLATION) => {
                    let constraint = db.constraint().unwrap_or("unknown").to_string();
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "Record already exists",
                        format!("constraint {}", constraint),
                    )
                    .with_source(error);
                }
                _ => (ErrorCode::DatabaseQueryFailed, "Database query failed"),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                (ErrorCode::DatabaseConnectionFailed, "Database unavailable")
            }
            _ => (ErrorCode::DatabaseError, "Database error"),
        };
        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for RelistError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "Invalid JSON payload", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for RelistError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::RpcTimeout, "Deadline elapsed", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for RelistError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::MissingConfiguration,
            std::io::ErrorKind::TimedOut => ErrorCode::RpcTimeout,
            _ => ErrorCode::InternalError,
        };
        Self::with_internal(code, "I/O error", error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for RelistError {
    fn from(error: anyhow::Error) -> Self {
        error
            .downcast::<RelistError>()
            .unwrap_or_else(|other| RelistError::internal(other.to_string()))
    }
}

impl From<config::ConfigError> for RelistError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                ErrorCode::InvalidConfiguration
            }
            _ => ErrorCode::ConfigurationError,
        };
        Self::with_internal(code, "Invalid configuration", error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::RpcTimeout.is_retryable());
        assert!(ErrorCode::LockConflict.is_retryable());
        assert!(!ErrorCode::ExecutorNotConnected.is_retryable());
        assert!(!ErrorCode::RpcRemoteError.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
    }

    #[test]
    fn test_handshake_statuses() {
        assert_eq!(ErrorCode::InvalidToken.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::TenantInactive.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::TenantInactive.category(), "handshake");
    }

    #[test]
    fn test_lock_conflict_names_product() {
        let error = RelistError::lock_conflict(42);
        assert!(error.is_lock_conflict());
        assert_eq!(error.severity(), ErrorSeverity::Low);
        assert_eq!(error.details().entity_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_transition_context() {
        let error = RelistError::invalid_state_transition(JobStatus::Completed, JobStatus::Running);
        assert_eq!(
            error.details().context.get("from_state"),
            Some(&serde_json::json!("COMPLETED"))
        );
    }

    #[test]
    fn test_response_body() {
        let body = serde_json::to_value(ErrorResponse::from(&RelistError::duplicate_job("abc"))).unwrap();
        assert_eq!(body["code"], "DUPLICATE_RECORD");
        assert_eq!(body["details"]["context"]["idempotency_key"], "abc");
    }

    #[test]
    fn test_display_includes_internal() {
        let error = RelistError::with_internal(
            ErrorCode::DatabaseError,
            "Database error",
            "connection refused",
        );
        let display = error.to_string();
        assert!(display.starts_with("[DatabaseError]"));
        assert!(display.contains("connection refused"));
    }

    #[test]
    fn test_anyhow_keeps_code() {
        let back = RelistError::from(anyhow::Error::new(RelistError::lock_conflict(7)));
        assert_eq!(back.code(), ErrorCode::LockConflict);
    }

    #[tokio::test]
    async fn test_elapsed_maps_to_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        let err = RelistError::from(elapsed);
        assert_eq!(err.code(), ErrorCode::RpcTimeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_error_codes() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "config.toml");
        assert_eq!(RelistError::from(missing).code(), ErrorCode::MissingConfiguration);
        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(RelistError::from(other).code(), ErrorCode::InternalError);
    }
}

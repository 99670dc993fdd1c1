//! Handlers that carry out actions through the tenant's executor.
//!
//! Marketplace payload translation is done upstream; the `listing` document
//! in a job's input is already in the marketplace's shape. What differs per
//! marketplace here is only the request layout, captured by a
//! [`RequestPlanner`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{JobContext, MarketplaceHandler, TaskFailure};
use crate::error::{RelistError, Result};
use crate::jobs::{
    ActionCode, ActionKind, HttpMethod, Job, JobInput, JobOutput, Marketplace, RpcClass,
    Task, TaskRequest, TaskSpec,
};

/// Storage key: record the listing id on the product.
const LISTING_KEY: &str = "listing";
/// Storage key: clear the listing id from the product.
const UNLIST_KEY: &str = "unlist";

/// Turns job inputs into task plans and finished tasks into job outputs.
pub trait RequestPlanner: Send + Sync {
    fn plan(&self, job: &Job) -> Result<Vec<TaskSpec>>;

    fn output(&self, job: &Job, tasks: &[Task]) -> Result<JobOutput>;
}

/// Plain REST layout under `/{marketplace}/items`.
#[derive(Debug, Clone)]
pub struct RestPlanner {
    marketplace: Marketplace,
}

impl RestPlanner {
    pub fn new(marketplace: Marketplace) -> Self {
        Self { marketplace }
    }

    fn item_path(&self, remote_id: &str) -> String {
        format!("/{}/items/{}", self.marketplace, remote_id)
    }

    fn items_path(&self) -> String {
        format!("/{}/items", self.marketplace)
    }
}

fn rpc(method: HttpMethod, path: String, body: Option<Value>) -> TaskRequest {
    TaskRequest::Rpc { method, path, body }
}

fn str_field<'a>(value: Option<&'a Value>, field: &str) -> Option<&'a str> {
    value?.get(field)?.as_str()
}

fn media_ids(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| matches!(t.request, TaskRequest::Transfer { .. }))
        .filter_map(|t| str_field(t.result.as_ref(), "media_id").map(str::to_string))
        .collect()
}

/// Remote id returned by the last RPC task that produced one.
fn created_remote_id(tasks: &[Task]) -> Option<String> {
    tasks
        .iter()
        .rev()
        .filter(|t| matches!(t.request, TaskRequest::Rpc { .. }))
        .find_map(|t| str_field(t.result.as_ref(), "id").map(str::to_string))
}

impl RequestPlanner for RestPlanner {
    fn plan(&self, job: &Job) -> Result<Vec<TaskSpec>> {
        let input = &job.input.body;
        input.ensure_action(job.action)?;
        let has_product = job.product_id.is_some();

        let mut specs = Vec::new();
        match input {
            JobInput::Publish { listing, photos } => {
                for (i, url) in photos.iter().enumerate() {
                    specs.push(TaskSpec::new(
                        format!("Upload photo {}", i + 1),
                        TaskRequest::Transfer { url: url.clone() },
                    ));
                }
                specs.push(TaskSpec::new(
                    "Create listing",
                    rpc(HttpMethod::Post, self.items_path(), Some(listing.clone())),
                ));
                if has_product {
                    specs.push(TaskSpec::new(
                        "Record listing id",
                        TaskRequest::Storage {
                            key: LISTING_KEY.to_string(),
                            value: Value::Null,
                        },
                    ));
                }
            }
            JobInput::Update { remote_id, listing } => {
                specs.push(TaskSpec::new(
                    "Update listing",
                    rpc(HttpMethod::Put, self.item_path(remote_id), Some(listing.clone())),
                ));
                if has_product {
                    specs.push(TaskSpec::new(
                        "Record listing id",
                        TaskRequest::Storage {
                            key: LISTING_KEY.to_string(),
                            value: json!(remote_id),
                        },
                    ));
                }
            }
            JobInput::Delete { remote_id } => {
                specs.push(TaskSpec::new(
                    "Delete listing",
                    rpc(HttpMethod::Delete, self.item_path(remote_id), None),
                ));
                if has_product {
                    specs.push(TaskSpec::new(
                        "Clear listing id",
                        TaskRequest::Storage {
                            key: UNLIST_KEY.to_string(),
                            value: Value::Null,
                        },
                    ));
                }
            }
            JobInput::Sync { cursor } => {
                let path = match cursor {
                    Some(cursor) => format!("{}?cursor={}", self.items_path(), cursor),
                    None => self.items_path(),
                };
                specs.push(TaskSpec::new("Fetch inventory", rpc(HttpMethod::Get, path, None)));
            }
            JobInput::Upload { urls, .. } => {
                if urls.is_empty() {
                    return Err(RelistError::invalid_payload("Upload without media urls"));
                }
                for (i, url) in urls.iter().enumerate() {
                    specs.push(TaskSpec::new(
                        format!("Upload media {}", i + 1),
                        TaskRequest::Transfer { url: url.clone() },
                    ));
                }
            }
            JobInput::CheckConnection => {
                specs.push(TaskSpec::new(
                    "Check session",
                    rpc(HttpMethod::Get, format!("/{}/session", self.marketplace), None),
                ));
            }
        }
        Ok(specs)
    }

    fn output(&self, job: &Job, tasks: &[Task]) -> Result<JobOutput> {
        let missing = |what: &str| {
            RelistError::invalid_payload(format!("Executor response is missing {}", what))
        };

        Ok(match &job.input.body {
            JobInput::Publish { .. } => {
                let remote_id = created_remote_id(tasks).ok_or_else(|| missing("the listing id"))?;
                let url = tasks
                    .iter()
                    .rev()
                    .find_map(|t| str_field(t.result.as_ref(), "url").map(str::to_string));
                JobOutput::Published { remote_id, url }
            }
            JobInput::Update { remote_id, .. } => JobOutput::Updated {
                remote_id: remote_id.clone(),
            },
            JobInput::Delete { remote_id } => JobOutput::Deleted {
                remote_id: remote_id.clone(),
            },
            JobInput::Sync { .. } => {
                let result = tasks.last().and_then(|t| t.result.as_ref());
                let items = result
                    .and_then(|r| r.get("items"))
                    .map(|items| match items {
                        Value::Array(list) => list.len() as u32,
                        other => other.as_u64().unwrap_or(0) as u32,
                    })
                    .unwrap_or(0);
                JobOutput::Synced {
                    items,
                    next_cursor: str_field(result, "next_cursor").map(str::to_string),
                }
            }
            JobInput::Upload { .. } => JobOutput::Uploaded {
                media_ids: media_ids(tasks),
            },
            JobInput::CheckConnection => {
                let result = tasks.last().and_then(|t| t.result.as_ref());
                JobOutput::Connection {
                    connected: result
                        .and_then(|r| r.get("connected"))
                        .and_then(Value::as_bool)
                        .unwrap_or(true),
                    account: str_field(result, "account").map(str::to_string),
                }
            }
        })
    }
}

/// Remote errors worth another attempt.
fn is_transient_remote(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("429")
        || message.contains("rate limit")
        || message.contains("temporarily")
        || message.contains("503")
}

fn classify(err: crate::rpc::RpcError) -> TaskFailure {
    match &err {
        crate::rpc::RpcError::Remote(message) if is_transient_remote(message) => {
            TaskFailure::Transient(err.to_string())
        }
        _ => TaskFailure::from(err),
    }
}

/// Executes a planned job through the executor, one task at a time.
pub struct RemoteHandler {
    kind: ActionKind,
    planner: Arc<dyn RequestPlanner>,
}

impl RemoteHandler {
    pub fn new(kind: ActionKind, planner: Arc<dyn RequestPlanner>) -> Self {
        Self { kind, planner }
    }
}

#[async_trait]
impl MarketplaceHandler for RemoteHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn create_tasks(&self, job: &Job) -> Result<Vec<TaskSpec>> {
        self.planner.plan(job)
    }

    async fn execute_task(
        &self,
        ctx: &JobContext,
        task: &Task,
        completed: &[Task],
    ) -> std::result::Result<Value, TaskFailure> {
        match &task.request {
            TaskRequest::Rpc { method, path, body } => {
                let mut body = body.clone();
                let media = media_ids(completed);
                if let (Some(Value::Object(map)), false) = (body.as_mut(), media.is_empty()) {
                    map.insert("media_ids".to_string(), json!(media));
                }

                ctx.limiter.wait().await;
                ctx.rpc
                    .http_request(&ctx.tenant.id, *method, path, body, ctx.call_timeout)
                    .await
                    .map_err(classify)
            }
            TaskRequest::Transfer { url } => {
                let remote_id = match &ctx.job.input.body {
                    JobInput::Upload { remote_id, .. } => remote_id.as_deref(),
                    _ => None,
                };
                ctx.limiter.wait().await;
                ctx.rpc
                    .upload(&ctx.tenant.id, url, remote_id, ctx.rpc.timeout_for(RpcClass::Upload))
                    .await
                    .map_err(classify)
            }
            TaskRequest::Storage { key, value } => {
                let product_id = ctx
                    .job
                    .product_id
                    .ok_or_else(|| TaskFailure::Fatal("Job has no product".to_string()))?;

                let remote_id = match key.as_str() {
                    UNLIST_KEY => None,
                    LISTING_KEY => Some(match value.as_str() {
                        Some(id) => id.to_string(),
                        None => created_remote_id(completed).ok_or_else(|| {
                            TaskFailure::Fatal("No listing id to record".to_string())
                        })?,
                    }),
                    other => {
                        return Err(TaskFailure::Fatal(format!("Unknown storage key: {}", other)))
                    }
                };

                ctx.store
                    .record_listing(&ctx.tenant, product_id, ctx.job.marketplace, remote_id.as_deref())
                    .await?;
                Ok(json!({ "recorded": remote_id }))
            }
        }
    }

    fn build_output(&self, job: &Job, tasks: &[Task]) -> Result<JobOutput> {
        self.planner.output(job, tasks)
    }
}

/// Connection check that reports an unreachable session as a result
/// instead of a failure.
pub struct ConnectionCheckHandler {
    marketplace: Marketplace,
    planner: RestPlanner,
}

impl ConnectionCheckHandler {
    pub fn new(marketplace: Marketplace) -> Self {
        Self {
            marketplace,
            planner: RestPlanner::new(marketplace),
        }
    }
}

#[async_trait]
impl MarketplaceHandler for ConnectionCheckHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::new(self.marketplace, ActionCode::CheckConnection)
    }

    fn create_tasks(&self, job: &Job) -> Result<Vec<TaskSpec>> {
        self.planner.plan(job)
    }

    async fn execute_task(
        &self,
        ctx: &JobContext,
        task: &Task,
        _completed: &[Task],
    ) -> std::result::Result<Value, TaskFailure> {
        let TaskRequest::Rpc { method, path, body } = &task.request else {
            return Err(TaskFailure::Fatal("Unexpected task for connection check".into()));
        };

        match ctx
            .rpc
            .http_request(&ctx.tenant.id, *method, path, body.clone(), ctx.call_timeout)
            .await
        {
            Ok(mut session) => {
                if let Value::Object(map) = &mut session {
                    map.entry("connected").or_insert(json!(true));
                }
                Ok(session)
            }
            Err(err) => match TaskFailure::from(err) {
                TaskFailure::Fatal(message) => Ok(json!({ "connected": false, "error": message })),
                retryable => Err(retryable),
            },
        }
    }

    fn build_output(&self, job: &Job, tasks: &[Task]) -> Result<JobOutput> {
        self.planner.output(job, tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, JobPriority, JobStatus, PayloadEnvelope, TaskId, TaskStatus};
    use chrono::Utc;

    fn job(action: ActionCode, input: JobInput, product_id: Option<i64>) -> Job {
        Job {
            id: JobId::new(),
            batch_id: None,
            marketplace: Marketplace::Vinted,
            action,
            product_id,
            idempotency_key: "k".into(),
            status: JobStatus::Running,
            cancel_requested: false,
            pause_requested: false,
            priority: JobPriority::Normal,
            retry_count: 0,
            max_retries: 3,
            input: PayloadEnvelope::new(input),
            result: None,
            failed_step: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            expires_at: Utc::now(),
        }
    }

    fn done(job: &Job, position: i32, request: TaskRequest, result: Value) -> Task {
        Task {
            id: TaskId::new(),
            job_id: job.id,
            position,
            description: String::new(),
            status: TaskStatus::Success,
            request,
            result: Some(result),
            error_message: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_publish_plan_order() {
        let planner = RestPlanner::new(Marketplace::Vinted);
        let job = job(
            ActionCode::Publish,
            JobInput::Publish {
                listing: json!({"title": "Coat"}),
                photos: vec!["https://cdn/a.jpg".into(), "https://cdn/b.jpg".into()],
            },
            Some(42),
        );

        let specs = planner.plan(&job).unwrap();
        let types: Vec<_> = specs.iter().map(|s| s.request.task_type()).collect();
        assert_eq!(types, vec!["transfer", "transfer", "rpc", "storage"]);
        assert_eq!(
            specs[2].request,
            rpc(HttpMethod::Post, "/vinted/items".into(), Some(json!({"title": "Coat"})))
        );
    }

    #[test]
    fn test_plan_rejects_mismatched_input() {
        let planner = RestPlanner::new(Marketplace::Ebay);
        let job = job(ActionCode::Delete, JobInput::Sync { cursor: None }, None);
        assert!(planner.plan(&job).is_err());
    }

    #[test]
    fn test_publish_output_uses_created_id() {
        let planner = RestPlanner::new(Marketplace::Vinted);
        let job = job(
            ActionCode::Publish,
            JobInput::Publish {
                listing: json!({}),
                photos: vec![],
            },
            None,
        );
        let tasks = vec![done(
            &job,
            0,
            rpc(HttpMethod::Post, "/vinted/items".into(), None),
            json!({"id": "v-991", "url": "https://vinted/items/v-991"}),
        )];

        assert_eq!(
            planner.output(&job, &tasks).unwrap(),
            JobOutput::Published {
                remote_id: "v-991".into(),
                url: Some("https://vinted/items/v-991".into()),
            }
        );
    }

    #[test]
    fn test_sync_output_counts_items() {
        let planner = RestPlanner::new(Marketplace::Etsy);
        let job = job(ActionCode::Sync, JobInput::Sync { cursor: None }, None);
        let tasks = vec![done(
            &job,
            0,
            rpc(HttpMethod::Get, "/etsy/items".into(), None),
            json!({"items": [1, 2, 3], "next_cursor": "p2"}),
        )];
        assert_eq!(
            planner.output(&job, &tasks).unwrap(),
            JobOutput::Synced {
                items: 3,
                next_cursor: Some("p2".into()),
            }
        );
    }

    #[test]
    fn test_transient_remote_errors() {
        assert!(is_transient_remote("HTTP 429 Too Many Requests"));
        assert!(is_transient_remote("Service temporarily unavailable"));
        assert!(!is_transient_remote("Listing rejected: missing brand"));
    }
}

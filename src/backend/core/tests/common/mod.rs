//! Shared fixtures for integration tests: an in-memory harness, a fake
//! executor, and a scripted handler.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use relist_core::config::RpcTimeouts;
use relist_core::db::{Tenant, TenantId};
use relist_core::error::Result;
use relist_core::handlers::{HandlerRegistry, JobContext, MarketplaceHandler, TaskFailure};
use relist_core::jobs::{
    ActionCode, ActionKind, ActionRegistry, BackoffStrategy, InMemoryJobStore, InMemoryStatsSink,
    Job, JobOutput, JobProcessor, JobService, Marketplace, RetryPolicy, Task, TaskRequest, TaskSpec,
    TerminalHooks,
};
use relist_core::ratelimit::LimiterSet;
use relist_core::rpc::{ExecutorHandle, ExecutorRegistry, RpcClient, RpcCommand, RpcResponse};

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub tenant: Tenant,
    pub store: Arc<InMemoryJobStore>,
    pub stats: Arc<InMemoryStatsSink>,
    pub registry: Arc<ExecutorRegistry>,
    pub rpc: RpcClient,
    pub actions: Arc<ActionRegistry>,
    pub hooks: TerminalHooks,
    pub service: JobService,
}

impl Harness {
    pub fn new() -> Self {
        let tenant = Tenant::new(TenantId::parse("acme").unwrap());
        let store = Arc::new(InMemoryJobStore::new());
        let stats = Arc::new(InMemoryStatsSink::new());
        let registry = Arc::new(ExecutorRegistry::new());
        let rpc = RpcClient::new(registry.clone(), RpcTimeouts::default());
        let actions = Arc::new(ActionRegistry::builtin());
        let hooks = TerminalHooks::new(store.clone(), stats.clone());
        let service = JobService::new(
            store.clone(),
            actions.clone(),
            hooks.clone(),
            Duration::from_secs(24 * 3600),
        );

        Self {
            tenant,
            store,
            stats,
            registry,
            rpc,
            actions,
            hooks,
            service,
        }
    }

    pub fn processor(&self, handlers: HandlerRegistry) -> JobProcessor {
        JobProcessor::new(
            self.store.clone(),
            Arc::new(handlers),
            self.actions.clone(),
            self.rpc.clone(),
            LimiterSet::unlimited(),
            RetryPolicy {
                backoff: BackoffStrategy::fixed(Duration::from_millis(10)),
            },
            self.hooks.clone(),
        )
    }

    pub fn default_processor(&self) -> JobProcessor {
        self.processor(HandlerRegistry::with_defaults(&self.actions))
    }

    /// Attach a fake executor that answers each command with `respond`.
    /// Returning `None` leaves the command unanswered.
    pub fn connect_executor<F>(&self, respond: F) -> (ExecutorHandle, JoinHandle<()>)
    where
        F: Fn(&RpcCommand) -> Option<RpcResponse> + Send + 'static,
    {
        let (handle, mut rx) = ExecutorHandle::new(self.tenant.id.clone(), 16);
        self.registry.attach(handle.clone());

        let rpc = self.rpc.clone();
        let tenant = self.tenant.id.clone();
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let Some(response) = respond(&command) {
                    rpc.resolve(&tenant, response);
                }
            }
        });
        (handle, task)
    }
}

/// Path of an `api_request` command.
pub fn command_path(command: &RpcCommand) -> &str {
    command.payload["path"].as_str().unwrap_or_default()
}

// ============================================================================
// Scripted handler
// ============================================================================

/// Holds one task open until released. Fires once.
pub struct Gate {
    pub position: i32,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
    armed: AtomicBool,
}

impl Gate {
    pub fn at(position: i32) -> Arc<Self> {
        Arc::new(Self {
            position,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            armed: AtomicBool::new(true),
        })
    }
}

/// Handler with `tasks` storage-shaped steps whose outcomes are scripted
/// per position. Unscripted attempts succeed.
pub struct ScriptedHandler {
    kind: ActionKind,
    tasks: usize,
    script: Mutex<HashMap<i32, VecDeque<std::result::Result<Value, TaskFailure>>>>,
    gate: Option<Arc<Gate>>,
    executed: Mutex<Vec<i32>>,
}

impl ScriptedHandler {
    pub fn new(marketplace: Marketplace, action: ActionCode, tasks: usize) -> Self {
        Self {
            kind: ActionKind::new(marketplace, action),
            tasks,
            script: Mutex::new(HashMap::new()),
            gate: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queue the outcome of the next attempt at `position`.
    pub fn then(self, position: i32, outcome: std::result::Result<Value, TaskFailure>) -> Self {
        self.script.lock().entry(position).or_default().push_back(outcome);
        self
    }

    /// Positions in the order they were attempted.
    pub fn executed(&self) -> Vec<i32> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl MarketplaceHandler for ScriptedHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn create_tasks(&self, _job: &Job) -> Result<Vec<TaskSpec>> {
        Ok((0..self.tasks)
            .map(|i| {
                TaskSpec::new(
                    format!("Step {}", i + 1),
                    TaskRequest::Storage {
                        key: format!("step-{}", i),
                        value: Value::Null,
                    },
                )
            })
            .collect())
    }

    async fn execute_task(
        &self,
        _ctx: &JobContext,
        task: &Task,
        _completed: &[Task],
    ) -> std::result::Result<Value, TaskFailure> {
        self.executed.lock().push(task.position);

        if let Some(gate) = &self.gate {
            if gate.position == task.position && gate.armed.swap(false, Ordering::SeqCst) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }

        let scripted = self
            .script
            .lock()
            .get_mut(&task.position)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(json!({ "step": task.position })))
    }

    fn build_output(&self, _job: &Job, tasks: &[Task]) -> Result<JobOutput> {
        Ok(JobOutput::Synced {
            items: tasks.len() as u32,
            next_cursor: None,
        })
    }
}

/// Registry holding a single handler.
pub fn registry_with(handler: Arc<dyn MarketplaceHandler>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(handler);
    registry
}

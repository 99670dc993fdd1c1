//! Worker loops that keep the processor busy.
//!
//! Each loop walks the active tenants round-robin and runs at most one job
//! at a time. Loops share nothing but the processor; the claim discipline
//! in the store is what keeps them from stepping on each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

use super::job::JobStatus;
use super::processor::{JobProcessor, ProcessOutcome};
use crate::config::WorkerConfig;
use crate::db::TenantDirectory;

/// Counters shared by all loops of a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs that left a claim attempt in any state
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    /// Claims refused because the product was busy
    pub conflicts: Arc<AtomicU64>,
    /// Jobs in flight right now
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Idle => {}
            ProcessOutcome::Conflicted { conflicts } => {
                self.conflicts.fetch_add(*conflicts as u64, Ordering::Relaxed);
            }
            ProcessOutcome::Processed(job) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                match job.status {
                    JobStatus::Completed => {
                        self.succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    JobStatus::Failed => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Handle for controlling running worker loops.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    loops: JoinSet<()>,
    config: WorkerConfig,
}

impl WorkerHandle {
    /// Signal every loop to stop after its current job.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal shutdown and wait for the loops, up to the configured grace
    /// period. Loops still running after that are aborted.
    pub async fn stop(mut self) {
        self.shutdown();
        let drain = async {
            while self.loops.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            error!(
                active = self.stats.active(),
                "Worker loops did not stop in time; aborting"
            );
            self.loops.abort_all();
        }
        info!("Worker stopped");
    }
}

pub struct JobWorker {
    processor: JobProcessor,
    directory: Arc<dyn TenantDirectory>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    pub fn new(processor: JobProcessor, directory: Arc<dyn TenantDirectory>, config: WorkerConfig) -> Self {
        Self {
            processor,
            directory,
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Spawn `concurrency` loops. They stop when `outer` flips to true or
    /// through the returned handle.
    pub fn start(self, mut outer: watch::Receiver<bool>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = self.config.concurrency.max(1);
        let mut loops = JoinSet::new();

        for index in 0..concurrency {
            let worker = WorkerLoop {
                index,
                processor: self.processor.clone(),
                directory: self.directory.clone(),
                config: self.config.clone(),
                stats: self.stats.clone(),
            };
            let span = info_span!("worker", index);
            loops.spawn(worker.run(shutdown_rx.clone()).instrument(span));
        }

        // Forward the outer signal.
        let forward = shutdown_tx.clone();
        tokio::spawn(async move {
            while outer.changed().await.is_ok() {
                if *outer.borrow() {
                    let _ = forward.send(true);
                    break;
                }
            }
        });

        info!(concurrency, "Job worker started");

        WorkerHandle {
            shutdown: shutdown_tx,
            stats: self.stats,
            loops,
            config: self.config,
        }
    }
}

struct WorkerLoop {
    index: usize,
    processor: JobProcessor,
    directory: Arc<dyn TenantDirectory>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl WorkerLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // Loops start at different tenants.
        let mut cursor = self.index;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let busy = self.round(&mut cursor).await;
            if busy {
                continue;
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!("Worker loop stopped");
    }

    /// One pass over the tenants; returns whether any job was processed.
    async fn round(&self, cursor: &mut usize) -> bool {
        let tenants = match self.directory.active_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "Failed to list tenants");
                return false;
            }
        };
        if tenants.is_empty() {
            return false;
        }

        for _ in 0..tenants.len() {
            let tenant = &tenants[*cursor % tenants.len()];
            *cursor = cursor.wrapping_add(1);

            self.stats.active.fetch_add(1, Ordering::Relaxed);
            let result = self.processor.process_next(tenant).await;
            self.stats.active.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(outcome) => {
                    self.stats.record(&outcome);
                    if matches!(outcome, ProcessOutcome::Processed(_)) {
                        return true;
                    }
                }
                Err(e) => {
                    error!(tenant = %tenant.id, error = %e, "Processing round failed");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{Job, JobId, JobPriority};
    use crate::jobs::action::{ActionCode, Marketplace};
    use crate::jobs::payload::{JobInput, PayloadEnvelope};
    use chrono::Utc;

    fn job(status: JobStatus) -> Job {
        Job {
            id: JobId::new(),
            batch_id: None,
            marketplace: Marketplace::Vinted,
            action: ActionCode::Sync,
            product_id: None,
            idempotency_key: "k".into(),
            status,
            cancel_requested: false,
            pause_requested: false,
            priority: JobPriority::Normal,
            retry_count: 0,
            max_retries: 0,
            input: PayloadEnvelope::new(JobInput::Sync { cursor: None }),
            result: None,
            failed_step: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);

        stats.record(&ProcessOutcome::Processed(job(JobStatus::Completed)));
        stats.record(&ProcessOutcome::Processed(job(JobStatus::Failed)));
        stats.record(&ProcessOutcome::Processed(job(JobStatus::Paused)));
        stats.record(&ProcessOutcome::Conflicted { conflicts: 2 });
        stats.record(&ProcessOutcome::Idle);

        assert_eq!(stats.processed(), 3);
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.conflicts(), 2);
        assert_eq!(stats.active(), 0);
    }
}

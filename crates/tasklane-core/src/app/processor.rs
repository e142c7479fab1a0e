//! TaskProcessor - the facade external callers talk to.
//!
//! Owns one queue, one scheduler, one executor and any number of workers.
//! Several processors can live in one process; nothing here is global.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::default_jobs::default_jobs;
use super::reaper_loop::ReaperLoop;
use crate::config::ProcessorConfig;
use crate::domain::{TaskDefinition, TaskId, TaskResult, TaskStatus, WorkerId};
use crate::error::{Result, TaskError};
use crate::queue::{QueueStats, TaskQueue};
use crate::registry::FunctionRegistry;
use crate::scheduler::{SchedulerHandle, TaskScheduler};
use crate::worker::{TaskWorker, WorkerDeps, WorkerStats};

const RESULT_POLL: Duration = Duration::from_millis(50);

/// Everything `get_system_stats` knows, in one serializable snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub queue: QueueStats,
    pub workers: Vec<WorkerStats>,
    pub total_processed: u64,
    pub total_failed: u64,
    pub scheduled_tasks: usize,
    pub registered_functions: Vec<String>,
    pub parallel_pool: PoolStats,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub busy: usize,
    pub cpu_threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub initialized: bool,
    pub workers_running: usize,
    pub workers_total: usize,
    pub scheduler_running: bool,
}

pub struct TaskProcessor {
    config: ProcessorConfig,
    deps: WorkerDeps,
    scheduler: Arc<TaskScheduler>,
    workers: Mutex<Vec<TaskWorker>>,
    scheduler_handle: Mutex<Option<SchedulerHandle>>,
    reaper: Mutex<Option<ReaperLoop>>,
    initialized: AtomicBool,
}

impl TaskProcessor {
    pub(crate) fn new(config: ProcessorConfig, deps: WorkerDeps, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            config,
            deps,
            scheduler,
            workers: Mutex::new(Vec::new()),
            scheduler_handle: Mutex::new(None),
            reaper: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.deps.queue
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.deps.registry
    }

    /// Check the store and register the default maintenance schedules.
    /// Calling it again is harmless: ids already in the template table,
    /// whether a default from an earlier call or a caller's own override,
    /// are left as they are.
    pub async fn initialize(&self) -> Result<()> {
        self.deps.queue.store().ping().await?;

        if self.config.register_default_jobs {
            for job in default_jobs() {
                if self.scheduler.is_scheduled(&job.id).await {
                    continue;
                }
                self.scheduler.schedule(job).await?;
            }
        }

        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(
                queue = %self.config.queue_name,
                functions = self.deps.registry.len(),
                scheduled = self.scheduler.len().await,
                "task processor initialized"
            );
        }
        Ok(())
    }

    /// `initialize`, then the configured number of workers and the scheduler.
    pub async fn start(&self) -> Result<()> {
        self.initialize().await?;
        self.start_workers(self.config.num_workers).await?;
        self.start_scheduler().await
    }

    /// Spawn `n` more workers sharing this processor's queue. The lease
    /// reaper starts with the first batch.
    pub async fn start_workers(&self, n: usize) -> Result<Vec<WorkerId>> {
        self.ensure_initialized()?;

        let mut workers = self.workers.lock().await;
        let mut started = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = TaskWorker::spawn(
                WorkerId::generate_at(self.deps.queue.now()),
                self.deps.clone(),
                self.config.worker_options(),
            );
            started.push(worker.id().clone());
            workers.push(worker);
        }
        drop(workers);

        let mut reaper = self.reaper.lock().await;
        if reaper.is_none() {
            *reaper = Some(ReaperLoop::spawn(
                Arc::clone(&self.deps.queue),
                self.config.reaper_interval(),
            ));
        }

        info!(started = n, "workers started");
        Ok(started)
    }

    /// Start the scheduler tick loop. A second call is a no-op.
    pub async fn start_scheduler(&self) -> Result<()> {
        self.ensure_initialized()?;

        let mut handle = self.scheduler_handle.lock().await;
        if handle.as_ref().is_some_and(SchedulerHandle::is_running) {
            return Ok(());
        }
        *handle = Some(Arc::clone(&self.scheduler).spawn(self.config.scheduler_tick()));
        Ok(())
    }

    /// Enqueue `task`, or register it as a recurring template. Returns its id
    /// straight away.
    pub async fn submit_task(&self, task: TaskDefinition) -> Result<TaskId> {
        self.scheduler.schedule(task).await
    }

    /// Stored result of one attempt, if any.
    pub async fn get_task_result(&self, id: &TaskId) -> Result<Option<TaskResult>> {
        self.deps.queue.get_result(id).await
    }

    /// Wait up to `timeout` for the logical task rooted at `id` to finish,
    /// following retried attempts to their successors. `None` if no terminal
    /// result showed up in time.
    pub async fn await_task_result(&self, id: &TaskId, timeout: Duration) -> Result<Option<TaskResult>> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let mut current = id.clone();

        loop {
            if let Some(result) = self.deps.queue.get_result(&current).await? {
                if result.status.is_terminal() {
                    return Ok(Some(result));
                }
                if result.status == TaskStatus::Retrying
                    && let Some(next) = result.next_attempt_id()
                {
                    current = next;
                    continue;
                }
            }

            let now = tokio::time::Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(None);
            }
            let wake = now + RESULT_POLL;
            tokio::time::sleep_until(deadline.map_or(wake, |deadline| wake.min(deadline))).await;
        }
    }

    /// Cancel a task that has not been claimed yet.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<bool> {
        self.deps.queue.cancel(id).await
    }

    pub async fn get_system_stats(&self) -> Result<SystemStats> {
        let queue = self.deps.queue.get_queue_stats().await?;
        let workers: Vec<WorkerStats> = self.workers.lock().await.iter().map(TaskWorker::stats).collect();

        Ok(SystemStats {
            queue,
            total_processed: workers.iter().map(|w| w.tasks_processed).sum(),
            total_failed: workers.iter().map(|w| w.tasks_failed).sum(),
            workers,
            scheduled_tasks: self.scheduler.len().await,
            registered_functions: self.deps.registry.names(),
            parallel_pool: PoolStats {
                size: self.deps.executor.parallel_size(),
                busy: self.deps.executor.parallel_busy(),
                cpu_threshold: self.config.cpu_threshold,
            },
            timestamp: self.deps.queue.now(),
        })
    }

    pub async fn health_check(&self) -> HealthReport {
        let (store_reachable, store_error) = match self.deps.queue.store().ping().await {
            Ok(()) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };

        let workers = self.workers.lock().await;
        let workers_total = workers.len();
        let workers_running = workers.iter().filter(|w| w.is_running()).count();
        drop(workers);

        let scheduler_running = self
            .scheduler_handle
            .lock()
            .await
            .as_ref()
            .is_some_and(SchedulerHandle::is_running);

        HealthReport {
            healthy: store_reachable && workers_running == workers_total,
            store_reachable,
            store_error,
            initialized: self.initialized.load(Ordering::SeqCst),
            workers_running,
            workers_total,
            scheduler_running,
        }
    }

    /// Stop the scheduler, then the workers (each gets the configured grace
    /// period to finish in-flight attempts), then the reaper and the
    /// parallel pool.
    pub async fn shutdown(&self) {
        info!("task processor shutting down");

        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            handle.shutdown().await;
        }

        let workers: Vec<TaskWorker> = std::mem::take(&mut *self.workers.lock().await);
        for worker in &workers {
            worker.request_shutdown();
        }
        let grace = self.config.shutdown_grace();
        let mut stopping = JoinSet::new();
        for worker in workers {
            stopping.spawn(worker.shutdown(grace));
        }
        while let Some(joined) = stopping.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker shutdown task failed");
            }
        }

        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.shutdown().await;
        }
        self.deps.executor.drain(grace).await;
        info!("task processor stopped");
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TaskError::NotInitialized)
        }
    }
}

//! TaskWorker - claims and executes tasks.
//!
//! A worker runs `concurrency` independent execution slots plus a monitor
//! loop. Each slot: dequeue → look up function → execute on the classified
//! pool under the task's timeout → store the result → requeue a retry if the
//! decider says so.
//!
//! - One failing task never takes a slot down: body errors, panics and
//!   timeouts are captured into the `TaskResult`.
//! - Store outages are logged and treated as "nothing to do"; the slot backs
//!   off and tries again.
//! - Shutdown stops claiming. In-flight attempts finish or hit their timeout.
//!
//! # Retry chain
//! Every attempt is its own queue entry with its own id. The first attempt
//! carries the caller's id (`root`); attempt `n + 1` is `root#retry-n`. When
//! an attempt fails and the decider answers `Retry`, the slot:
//!
//! 1. builds the successor with `next_attempt`, eligible after the policy's
//!    delay (saturating at the far future rather than wrapping),
//! 2. enqueues it,
//! 3. only then relabels the failed attempt's result as `retrying` and links
//!    it to the successor through its metadata.
//!
//! The order matters to anyone following the chain from the root: a
//! `retrying` result always points at an attempt that exists. If step 2
//! fails the result keeps its `failed`/`timeout` status, so a caller never
//! waits on a successor that was never queued. Unknown functions and
//! validation failures are classed terminal, which the default decider
//! never retries.

pub mod executor;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use self::executor::{Execution, ExecutionPool, Executor, classify};
pub use self::stats::{WorkerCounters, WorkerStats};

use crate::domain::{Decider, Decision, FailureClass, TaskDefinition, TaskResult, WorkerId};
use crate::error::TaskError;
use crate::queue::TaskQueue;
use crate::registry::{FunctionRegistry, TaskContext};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Execution slots.
    pub concurrency: usize,
    /// Sleep when nothing is eligible.
    pub poll_interval: Duration,
    /// Sleep after a store error.
    pub error_backoff: Duration,
    pub monitor_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

/// Collaborators shared by every worker of a processor.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<FunctionRegistry>,
    pub executor: Arc<Executor>,
    pub decider: Arc<dyn Decider>,
}

struct Shared {
    id: WorkerId,
    deps: WorkerDeps,
    options: WorkerOptions,
    counters: WorkerCounters,
    /// Parent of every attempt's token; tripped when shutdown grace runs out.
    cancel: CancellationToken,
}

/// Handle to a running worker.
pub struct TaskWorker {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl TaskWorker {
    /// Start the slots and the monitor loop.
    pub fn spawn(id: WorkerId, deps: WorkerDeps, options: WorkerOptions) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started_at = deps.queue.now();
        let shared = Arc::new(Shared {
            id,
            deps,
            counters: WorkerCounters::new(started_at),
            options,
            cancel: CancellationToken::new(),
        });

        let slots = shared.options.concurrency.max(1);
        let mut joins = Vec::with_capacity(slots + 1);
        for slot in 0..slots {
            let shared = Arc::clone(&shared);
            let rx = shutdown_rx.clone();
            let slot_id = shared.id.slot(slot);
            joins.push(tokio::spawn(async move {
                slot_loop(shared, slot_id, rx).await;
            }));
        }
        {
            let shared = Arc::clone(&shared);
            joins.push(tokio::spawn(async move {
                monitor_loop(shared, shutdown_rx).await;
            }));
        }

        info!(worker_id = %shared.id, slots, "worker started");
        Self {
            shared,
            shutdown_tx,
            joins,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.shared.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.counters.snapshot(
            &self.shared.id,
            self.shared.options.concurrency.max(1),
            self.shared.deps.queue.now(),
        )
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow() && self.joins.iter().any(|j| !j.is_finished())
    }

    /// Stop claiming new tasks. Does not wait.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop claiming and wait for in-flight attempts. After `grace`, running
    /// bodies are asked to cancel; the wait continues until each one returns
    /// or reaches its own timeout.
    pub async fn shutdown(self, grace: Duration) {
        self.request_shutdown();
        let id = self.shared.id.clone();
        let cancel = self.shared.cancel.clone();

        let mut joins = self.joins;
        let drained = tokio::time::timeout(grace, async {
            while let Some(join) = joins.last_mut() {
                let _ = join.await;
                joins.pop();
            }
        })
        .await;

        if drained.is_err() {
            warn!(worker_id = %id, ?grace, "grace period elapsed; cancelling in-flight tasks");
            cancel.cancel();
            for join in joins {
                let _ = join.await;
            }
        }
        info!(worker_id = %id, "worker stopped");
    }
}

async fn slot_loop(shared: Arc<Shared>, slot_id: WorkerId, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let pause = match shared.deps.queue.dequeue(&slot_id).await {
            Ok(Some(task)) => {
                shared.process(task, &slot_id).await;
                continue;
            }
            Ok(None) => shared.options.poll_interval,
            Err(err) => {
                warn!(worker_id = %slot_id, error = %err, "dequeue failed; backing off");
                shared.options.error_backoff
            }
        };

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

async fn monitor_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.options.monitor_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let stats = shared.counters.snapshot(
                    &shared.id,
                    shared.options.concurrency.max(1),
                    shared.deps.queue.now(),
                );
                info!(
                    worker_id = %stats.worker_id,
                    processed = stats.tasks_processed,
                    failed = stats.tasks_failed,
                    success_rate = stats.success_rate,
                    avg_execution_secs = stats.average_execution_time,
                    uptime_secs = stats.uptime_seconds,
                    active = stats.active_tasks,
                    "worker stats"
                );
            }
        }
    }
}

impl Shared {
    /// Run one claimed attempt to a stored result.
    async fn process(&self, task: TaskDefinition, slot_id: &WorkerId) {
        let queue = &self.deps.queue;
        self.counters.begin();

        let mut result = TaskResult::started(&task, queue.now(), slot_id.clone(), self.id.clone());
        let failure = self.execute(&task, &mut result).await;
        result.finish(queue.now());

        if let Some(class) = failure {
            self.settle_failure(&task, &mut result, class).await;
        } else {
            info!(
                task_id = %task.id,
                worker_id = %slot_id,
                execution_secs = result.execution_time,
                "task completed"
            );
        }
        self.counters.finish(result.status, result.execution_time);

        if let Err(err) = queue.store_result(&result).await {
            error!(task_id = %task.id, error = %err, "failed to store result");
        }
    }

    /// Execute and record the outcome. Returns the failure class, if any.
    async fn execute(&self, task: &TaskDefinition, result: &mut TaskResult) -> Option<FailureClass> {
        let Some(body) = self.deps.registry.get(&task.function_name) else {
            result.fail(TaskError::UnknownFunction(task.function_name.clone()).to_string(), None);
            return Some(FailureClass::Terminal);
        };

        let pool = self.deps.executor.classify(task.cpu_requirement);
        let ctx = TaskContext {
            task_id: task.id.clone(),
            attempt: task.retry_count + 1,
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            cancel: self.cancel.child_token(),
        };

        match self.deps.executor.execute(body, ctx, task.timeout(), pool).await {
            Execution::Finished(Ok(value)) => {
                result.complete(value);
                None
            }
            Execution::Finished(Err(failure)) => {
                result.fail(failure.to_string(), failure.trace().map(str::to_string));
                Some(failure.class())
            }
            Execution::TimedOut => {
                result.time_out(task.timeout_seconds);
                Some(FailureClass::Retryable)
            }
        }
    }

    /// Ask the decider, and enqueue the next attempt when it says retry.
    async fn settle_failure(&self, task: &TaskDefinition, result: &mut TaskResult, class: FailureClass) {
        match self.deps.decider.decide(task, result, class) {
            Decision::Retry { delay, reason } => {
                let queue = &self.deps.queue;
                let next = task.next_attempt(queue.now(), delay);
                match queue.enqueue(&next).await {
                    Ok(()) => {
                        warn!(
                            task_id = %task.id,
                            next_attempt = %next.id,
                            error = result.error.as_deref().unwrap_or_default(),
                            %reason,
                            "task failed; retry scheduled"
                        );
                        result.mark_retrying(&next.id);
                    }
                    Err(err) => {
                        error!(task_id = %task.id, error = %err, "could not enqueue retry; attempt is final");
                    }
                }
            }
            Decision::GiveUp { reason } => {
                warn!(
                    task_id = %task.id,
                    status = ?result.status,
                    error = result.error.as_deref().unwrap_or_default(),
                    %reason,
                    "task failed permanently"
                );
            }
        }
    }
}

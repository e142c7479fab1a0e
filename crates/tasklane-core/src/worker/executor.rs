//! Execution pools.
//!
//! Every attempt is classified onto one of two pools by its declared
//! `cpu_requirement`:
//!
//! - **Concurrent**: async bodies are spawned on the tokio runtime, blocking
//!   bodies go to tokio's blocking threads. Bounded by the worker's slots.
//! - **Parallel**: a dedicated rayon pool sized for CPU-bound work, guarded
//!   by a semaphore shared across every worker of a processor.
//!
//! Timeouts are enforced at the await with `tokio::time::timeout`. A timed
//! out body is told to stop through its `CancellationToken`. Async bodies on
//! the concurrent pool are also aborted at their next await point. Blocking
//! and parallel bodies cannot be preempted; they keep their thread (and, on
//! the parallel pool, their permit) until they return.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, warn};

use crate::error::{Result, TaskError};
use crate::registry::{TaskBody, TaskContext, TaskFailure};

/// Which pool an attempt runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPool {
    Concurrent,
    Parallel,
}

/// Tasks needing more than `threshold` CPUs go to the parallel pool.
pub fn classify(cpu_requirement: f64, threshold: f64) -> ExecutionPool {
    if cpu_requirement > threshold {
        ExecutionPool::Parallel
    } else {
        ExecutionPool::Concurrent
    }
}

/// How an attempt ended, before it is turned into a `TaskResult`.
#[derive(Debug)]
pub enum Execution {
    Finished(Result<Value, TaskFailure>),
    TimedOut,
}

pub struct Executor {
    cpu_threshold: f64,
    parallel: Arc<rayon::ThreadPool>,
    parallel_slots: Arc<Semaphore>,
    parallel_size: usize,
}

impl Executor {
    pub fn new(parallel_size: usize, cpu_threshold: f64) -> Result<Self> {
        let parallel_size = parallel_size.max(1);
        let parallel = rayon::ThreadPoolBuilder::new()
            .num_threads(parallel_size)
            .thread_name(|i| format!("tasklane-cpu-{i}"))
            .build()
            .map_err(|e| TaskError::PoolBuild(e.to_string()))?;

        Ok(Self {
            cpu_threshold,
            parallel: Arc::new(parallel),
            parallel_slots: Arc::new(Semaphore::new(parallel_size)),
            parallel_size,
        })
    }

    pub fn classify(&self, cpu_requirement: f64) -> ExecutionPool {
        classify(cpu_requirement, self.cpu_threshold)
    }

    pub fn parallel_size(&self) -> usize {
        self.parallel_size
    }

    /// Parallel slots currently in use.
    pub fn parallel_busy(&self) -> usize {
        self.parallel_size
            .saturating_sub(self.parallel_slots.available_permits())
    }

    /// Run `body` on `pool` with a hard deadline of `timeout`.
    pub async fn execute(
        &self,
        body: &TaskBody,
        ctx: TaskContext,
        timeout: Duration,
        pool: ExecutionPool,
    ) -> Execution {
        let cancel = ctx.cancel.clone();
        let task_id = ctx.task_id.clone();

        let outcome = match pool {
            ExecutionPool::Concurrent => run_concurrent(body, ctx, timeout).await,
            ExecutionPool::Parallel => self.run_parallel(body, ctx, timeout).await,
        };

        if matches!(outcome, Execution::TimedOut) {
            cancel.cancel();
            debug!(task_id = %task_id, ?pool, "attempt timed out; cancellation requested");
        }
        outcome
    }

    async fn run_parallel(&self, body: &TaskBody, ctx: TaskContext, timeout: Duration) -> Execution {
        let slots = Arc::clone(&self.parallel_slots);
        let pool = Arc::clone(&self.parallel);
        let body = body.clone();

        let run = async move {
            let permit = slots
                .acquire_owned()
                .await
                .map_err(|_| TaskFailure::runtime("parallel pool is closed"))?;
            let (tx, rx) = oneshot::channel();
            let runtime = tokio::runtime::Handle::current();

            pool.spawn(move || {
                let _permit: OwnedSemaphorePermit = permit;
                let outcome = catch_unwind(AssertUnwindSafe(|| match body {
                    TaskBody::Blocking(f) => f(ctx),
                    TaskBody::Async(f) => runtime.block_on(f.call(ctx)),
                }));
                let _ = tx.send(outcome.unwrap_or_else(|panic| Err(panicked(panic))));
            });

            rx.await
                .map_err(|_| TaskFailure::runtime("parallel worker dropped the attempt"))?
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => Execution::Finished(result),
            Err(_) => Execution::TimedOut,
        }
    }

    /// Wait up to `grace` for running parallel attempts to return, then
    /// refuse new ones. Bodies still running after `grace` keep their thread
    /// until they return; nothing waits for them.
    pub async fn drain(&self, grace: Duration) {
        let permits = u32::try_from(self.parallel_size).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.parallel_slots.acquire_many(permits)).await {
            Ok(Ok(all)) => all.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                busy = self.parallel_busy(),
                ?grace,
                "parallel bodies still running after grace; closing pool without them"
            ),
        }
        self.parallel_slots.close();
    }
}

async fn run_concurrent(body: &TaskBody, ctx: TaskContext, timeout: Duration) -> Execution {
    let mut handle = match body {
        TaskBody::Async(f) => {
            let f = Arc::clone(f);
            tokio::spawn(async move { f.call(ctx).await })
        }
        TaskBody::Blocking(f) => {
            let f = Arc::clone(f);
            tokio::task::spawn_blocking(move || f(ctx))
        }
    };

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => Execution::Finished(result),
        Ok(Err(join_err)) => match join_err.try_into_panic() {
            Ok(panic) => Execution::Finished(Err(panicked(panic))),
            Err(_) => Execution::Finished(Err(TaskFailure::runtime("task was aborted"))),
        },
        Err(_) => {
            handle.abort();
            Execution::TimedOut
        }
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> TaskFailure {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    TaskFailure::runtime(format!("task panicked: {message}"))
}

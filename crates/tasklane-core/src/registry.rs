//! FunctionRegistry - `function_name -> task body`.
//!
//! Task definitions only ever carry a function *name*. The registry is built
//! during initialization (mutable), then shared read-only by every worker
//! through an `Arc`, so lookups need no locking. Each engine instance owns its
//! own registry; there is no process-wide table.
//!
//! Bodies come in two shapes:
//! - **async** (`TaskFunction`): awaited on the runtime, the natural fit for
//!   I/O-bound work
//! - **blocking** (plain `Fn`): run on a blocking thread, never on a runtime
//!   worker thread
//!
//! ```ignore
//! let mut registry = FunctionRegistry::new();
//! registry.register("fetch_odds", async_fn(|ctx| async move {
//!     let book: String = ctx.kwarg("book")?;
//!     Ok::<_, TaskFailure>(json!({ "book": book }))
//! }))?;
//! registry.register("fit_model", blocking_fn(|ctx| train(ctx.args)))?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::{FailureClass, TaskId};
use crate::error::{Result, TaskError};

/// Error returned by a task body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskFailure {
    /// The body ran and failed. Retried per the task's policy.
    #[error("{message}")]
    Runtime {
        message: String,
        trace: Option<String>,
    },

    /// The input can never succeed. Not retried.
    #[error("invalid task arguments: {0}")]
    Validation(String),
}

impl TaskFailure {
    pub fn runtime(message: impl Into<String>) -> Self {
        TaskFailure::Runtime {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        TaskFailure::Runtime {
            message: message.into(),
            trace: Some(trace.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        TaskFailure::Validation(message.into())
    }

    pub fn class(&self) -> FailureClass {
        match self {
            TaskFailure::Runtime { .. } => FailureClass::Retryable,
            TaskFailure::Validation(_) => FailureClass::Terminal,
        }
    }

    pub fn trace(&self) -> Option<&str> {
        match self {
            TaskFailure::Runtime { trace, .. } => trace.as_deref(),
            TaskFailure::Validation(_) => None,
        }
    }
}

/// Everything a body gets to see about its attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// 1-based.
    pub attempt: u32,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Tripped when the attempt times out or the worker shuts down. Long
    /// bodies should check it between steps; nothing is preempted.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Positional argument `index`, decoded as `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskFailure> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| TaskFailure::validation(format!("missing positional argument {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskFailure::validation(format!("argument {index}: {e}")))
    }

    /// Keyword argument `key`, decoded as `T`.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> Result<T, TaskFailure> {
        let value = self
            .kwargs
            .get(key)
            .ok_or_else(|| TaskFailure::validation(format!("missing keyword argument '{key}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskFailure::validation(format!("argument '{key}': {e}")))
    }

    /// Keyword argument `key`, or `default` when absent.
    pub fn kwarg_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, TaskFailure> {
        if self.kwargs.contains_key(key) {
            self.kwarg(key)
        } else {
            Ok(default)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An async task body.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    async fn call(&self, ctx: TaskContext) -> Result<Value, TaskFailure>;
}

pub type BlockingBody = dyn Fn(TaskContext) -> Result<Value, TaskFailure> + Send + Sync;

/// A registered body.
#[derive(Clone)]
pub enum TaskBody {
    Async(Arc<dyn TaskFunction>),
    Blocking(Arc<BlockingBody>),
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskBody::Async(_) => f.write_str("TaskBody::Async"),
            TaskBody::Blocking(_) => f.write_str("TaskBody::Blocking"),
        }
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> TaskFunction for AsyncFn<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskFailure>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext) -> Result<Value, TaskFailure> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a body.
pub fn async_fn<F, Fut>(f: F) -> TaskBody
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskFailure>> + Send + 'static,
{
    TaskBody::Async(Arc::new(AsyncFn(f)))
}

/// Wrap a synchronous closure as a body that runs off the runtime threads.
pub fn blocking_fn<F>(f: F) -> TaskBody
where
    F: Fn(TaskContext) -> Result<Value, TaskFailure> + Send + Sync + 'static,
{
    TaskBody::Blocking(Arc::new(f))
}

impl<T: TaskFunction + 'static> From<Arc<T>> for TaskBody {
    fn from(function: Arc<T>) -> Self {
        TaskBody::Async(function)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskBody>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register `body` under `name`. Names are unique.
    pub fn register(&mut self, name: impl Into<String>, body: impl Into<TaskBody>) -> Result<()> {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(TaskError::DuplicateFunction(name));
        }
        self.functions.insert(name, body.into());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskBody> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TaskContext {
        let mut kwargs = Map::new();
        kwargs.insert("days_old".into(), json!(30));
        kwargs.insert("label".into(), json!("nightly"));
        TaskContext {
            task_id: TaskId::new("task-ctx"),
            attempt: 1,
            args: vec![json!(7), json!("x")],
            kwargs,
            cancel: CancellationToken::new(),
        }
    }

    struct Echo;

    #[async_trait]
    impl TaskFunction for Echo {
        async fn call(&self, ctx: TaskContext) -> Result<Value, TaskFailure> {
            Ok(Value::Array(ctx.args))
        }
    }

    #[tokio::test]
    async fn registered_async_body_runs() {
        let mut registry = FunctionRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();

        let Some(TaskBody::Async(body)) = registry.get("echo") else {
            panic!("expected async body");
        };
        assert_eq!(body.call(ctx()).await.unwrap(), json!([7, "x"]));
    }

    #[tokio::test]
    async fn closure_adapters() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(
                "double",
                async_fn(|ctx: TaskContext| async move {
                    let n: i64 = ctx.arg(0)?;
                    Ok::<_, TaskFailure>(json!(n * 2))
                }),
            )
            .unwrap();
        registry
            .register(
                "sum",
                blocking_fn(|ctx: TaskContext| {
                    let days: u32 = ctx.kwarg("days_old")?;
                    Ok(json!(days + 1))
                }),
            )
            .unwrap();

        match registry.get("double") {
            Some(TaskBody::Async(body)) => assert_eq!(body.call(ctx()).await.unwrap(), json!(14)),
            other => panic!("unexpected {other:?}"),
        }
        match registry.get("sum") {
            Some(TaskBody::Blocking(body)) => assert_eq!(body(ctx()).unwrap(), json!(31)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = FunctionRegistry::new();
        registry.register("f", blocking_fn(|_| Ok(Value::Null))).unwrap();
        let err = registry
            .register("f", blocking_fn(|_| Ok(Value::Null)))
            .unwrap_err();
        assert!(matches!(err, TaskError::DuplicateFunction(name) if name == "f"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = FunctionRegistry::new();
        for name in ["cleanup_task", "backup_task", "cache_warming_task"] {
            registry.register(name, blocking_fn(|_| Ok(Value::Null))).unwrap();
        }
        assert_eq!(
            registry.names(),
            vec!["backup_task", "cache_warming_task", "cleanup_task"]
        );
        assert!(registry.contains("backup_task"));
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn bad_arguments_are_validation_failures() {
        let ctx = ctx();
        assert!(matches!(ctx.kwarg::<u32>("missing"), Err(TaskFailure::Validation(_))));
        assert!(matches!(ctx.kwarg::<u32>("label"), Err(TaskFailure::Validation(_))));
        assert_eq!(ctx.kwarg_or("missing", 5u32).unwrap(), 5);
        assert_eq!(
            TaskFailure::validation("x").class(),
            FailureClass::Terminal
        );
        assert_eq!(TaskFailure::runtime("x").class(), FailureClass::Retryable);
    }
}

//! ProcessorBuilder - wiring and startup validation.
//!
//! Functions are registered up front and `build()` checks the registry
//! against what the caller said it expects, so a missing payload body is a
//! startup error rather than a stream of "unknown function" failures later.

use std::sync::Arc;

use tracing::warn;

use super::default_jobs::DEFAULT_JOB_FUNCTIONS;
use super::processor::TaskProcessor;
use crate::config::ProcessorConfig;
use crate::domain::{Decider, DefaultDecider};
use crate::error::{Result, TaskError};
use crate::impls::MemoryStore;
use crate::ports::{BackingStore, Clock, SystemClock};
use crate::queue::TaskQueue;
use crate::registry::{FunctionRegistry, TaskBody};
use crate::scheduler::{CronMatcher, StandardCron, TaskScheduler};
use crate::worker::{Executor, WorkerDeps};

/// Builds a [`TaskProcessor`].
///
/// ```ignore
/// let processor = ProcessorBuilder::new(ProcessorConfig::load()?)
///     .register("predict", blocking_fn(predict))?
///     .expect_functions(&["predict"])
///     .build()?;
/// ```
///
/// Anything not supplied falls back to the in-memory store, the system
/// clock, the default retry decider and the five-field cron matcher.
pub struct ProcessorBuilder {
    config: ProcessorConfig,
    registry: FunctionRegistry,
    expected_functions: Option<Vec<String>>,
    store: Option<Arc<dyn BackingStore>>,
    clock: Option<Arc<dyn Clock>>,
    decider: Option<Arc<dyn Decider>>,
    matcher: Option<Arc<dyn CronMatcher>>,
}

impl ProcessorBuilder {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            registry: FunctionRegistry::new(),
            expected_functions: None,
            store: None,
            clock: None,
            decider: None,
            matcher: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn cron_matcher(mut self, matcher: Arc<dyn CronMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Register a task function under `name`.
    pub fn register(mut self, name: impl Into<String>, body: impl Into<TaskBody>) -> Result<Self> {
        self.registry.register(name, body)?;
        Ok(self)
    }

    /// Function names that must be registered for `build()` to succeed.
    pub fn expect_functions(mut self, names: &[&str]) -> Self {
        self.expected_functions = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<TaskProcessor> {
        if let Some(expected) = &self.expected_functions {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(TaskError::MissingFunctions(missing));
            }
        }

        if self.config.register_default_jobs {
            for name in DEFAULT_JOB_FUNCTIONS {
                if !self.registry.contains(name) {
                    warn!(function = name, "default maintenance job has no registered function");
                }
            }
        }

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let queue = Arc::new(TaskQueue::new(store, clock, self.config.queue_options()));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&queue),
            self.matcher.unwrap_or_else(|| Arc::new(StandardCron)),
        ));
        let executor = Executor::new(self.config.parallel_pool_size, self.config.cpu_threshold)?;

        let deps = WorkerDeps {
            queue,
            registry: Arc::new(self.registry),
            executor: Arc::new(executor),
            decider: self.decider.unwrap_or_else(|| Arc::new(DefaultDecider)),
        };
        Ok(TaskProcessor::new(self.config, deps, scheduler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::blocking_fn;
    use serde_json::json;

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            parallel_pool_size: 1,
            register_default_jobs: false,
            ..ProcessorConfig::default()
        }
    }

    #[test]
    fn build_succeeds_when_expectations_are_met() {
        let processor = ProcessorBuilder::new(config())
            .register("predict", blocking_fn(|_| Ok(json!(1))))
            .unwrap()
            .expect_functions(&["predict"])
            .build();
        assert!(processor.is_ok());
    }

    #[test]
    fn build_reports_missing_functions() {
        let processor = ProcessorBuilder::new(config())
            .register("predict", blocking_fn(|_| Ok(json!(1))))
            .unwrap()
            .expect_functions(&["predict", "train", "scan"])
            .build();
        assert!(matches!(
            processor,
            Err(TaskError::MissingFunctions(missing)) if missing == vec!["train".to_string(), "scan".to_string()]
        ));
    }

    #[test]
    fn build_without_expectations() {
        assert!(ProcessorBuilder::new(config()).build().is_ok());
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let result = ProcessorBuilder::new(config())
            .register("predict", blocking_fn(|_| Ok(json!(1))))
            .unwrap()
            .register("predict", blocking_fn(|_| Ok(json!(2))));
        assert!(matches!(result, Err(TaskError::DuplicateFunction(name)) if name == "predict"));
    }
}

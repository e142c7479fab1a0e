//! tasklane-core
//!
//! A priority task engine on top of a shared backing store.
//!
//! # Modules
//! - **domain**: task definitions, results, ids, retry decisions
//! - **ports**: the backing store and clock abstractions
//! - **impls**: the in-memory backing store
//! - **queue**: priority buckets, leases, results, lease reaping
//! - **registry**: function name -> task body
//! - **worker**: execution slots, the concurrent/parallel pools, counters
//! - **scheduler**: cron templates and the tick loop
//! - **app**: the `TaskProcessor` facade and its builder
//! - **config** / **observability**: layered settings and tracing setup

pub mod app;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use app::{HealthReport, ProcessorBuilder, SystemStats, TaskProcessor};
pub use crate::config::{LoggingConfig, ProcessorConfig};
pub use domain::{TaskDefinition, TaskId, TaskPriority, TaskResult, TaskStatus, TaskType, WorkerId};
pub use error::{Result, TaskError};
pub use registry::{TaskContext, TaskFailure, async_fn, blocking_fn};

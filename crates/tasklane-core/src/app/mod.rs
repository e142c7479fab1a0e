//! App - wiring the queue, workers and scheduler into one processor.
//!
//! - **ProcessorBuilder**: registration and startup validation
//! - **TaskProcessor**: submit / await / cancel / stats / health / shutdown
//! - **ReaperLoop**: recovery of tasks whose lease lapsed
//! - **default_jobs**: the built-in maintenance schedules

pub mod builder;
pub mod default_jobs;
pub mod processor;
pub mod reaper_loop;

pub use self::builder::ProcessorBuilder;
pub use self::default_jobs::{DEFAULT_JOB_FUNCTIONS, default_jobs};
pub use self::processor::{HealthReport, PoolStats, SystemStats, TaskProcessor};
pub use self::reaper_loop::ReaperLoop;

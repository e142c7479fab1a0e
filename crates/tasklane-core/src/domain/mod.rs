//! Domain model: ids, task definitions, results, retry decisions.

pub mod decision;
pub mod ids;
pub mod result;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider, FailureClass};
pub use ids::{TaskId, WorkerId};
pub use result::{NEXT_ATTEMPT_KEY, TaskResult, TaskStatus};
pub use task::{TaskDefinition, TaskPriority, TaskType};

//! Decision model: what happens after an attempt fails.
//!
//! The Decider is a pure function of the attempt's definition and result.
//! Acting on the decision (enqueueing the next attempt, relabelling the
//! result) is the worker's job.

use std::time::Duration;

use super::{TaskDefinition, TaskResult};
use crate::queue::RetryPolicy;

/// Whether a failure may be retried at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Runtime error or timeout.
    Retryable,
    /// Unknown function, malformed arguments.
    Terminal,
}

/// The next action for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Enqueue a new attempt after `delay`.
    Retry { delay: Duration, reason: String },

    /// Leave the attempt as the final word.
    GiveUp { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskDefinition, result: &TaskResult, class: FailureClass) -> Decision;
}

/// Retry while `retry_count < max_retries`, with the delay taken from the
/// task's own `retry_delay` / `exponential_backoff`.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskDefinition, result: &TaskResult, class: FailureClass) -> Decision {
        if class == FailureClass::Terminal {
            return Decision::GiveUp {
                reason: format!(
                    "non-retryable failure: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            };
        }

        if task.retry_count >= task.max_retries {
            return Decision::GiveUp {
                reason: format!(
                    "Max retries reached: {}/{}",
                    task.retry_count, task.max_retries
                ),
            };
        }

        let delay = RetryPolicy::for_task(task).next_delay(task.retry_count);
        Decision::Retry {
            delay,
            reason: format!(
                "Retry {}/{} after {:?}",
                task.retry_count + 1,
                task.max_retries,
                delay
            ),
        }
    }
}

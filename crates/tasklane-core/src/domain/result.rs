//! Per-attempt execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{TaskId, WorkerId};
use super::task::TaskDefinition;

/// Status of one attempt.
///
/// Transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Failed | Timeout
/// - Failed | Timeout -> Retrying (a new attempt has been enqueued)
/// - Pending -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    /// No further attempt will follow this one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// The attempt ended badly and the retry policy gets a say.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Timeout)
    }
}

/// Metadata key pointing from a retried attempt to its successor.
pub const NEXT_ATTEMPT_KEY: &str = "next_attempt_id";

/// Outcome of one attempt. Stored under the attempt's task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,

    /// Success payload returned by the task body.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,

    // Timing
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds.
    #[serde(default)]
    pub execution_time: f64,

    // Retry information
    pub attempt_number: u32,
    pub retry_count: u32,

    // Worker information
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub worker_node: Option<WorkerId>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskResult {
    /// A fresh `Running` result for `task`, started at `now`.
    pub fn started(
        task: &TaskDefinition,
        now: DateTime<Utc>,
        worker_id: WorkerId,
        worker_node: WorkerId,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            status: TaskStatus::Running,
            result: None,
            error: None,
            traceback: None,
            started_at: Some(now),
            completed_at: None,
            execution_time: 0.0,
            attempt_number: task.retry_count + 1,
            retry_count: task.retry_count,
            worker_id: Some(worker_id),
            worker_node: Some(worker_node),
            metadata: Map::new(),
        }
    }

    /// A result for an attempt that never ran (e.g. cancelled while pending).
    pub fn without_execution(task: &TaskDefinition, status: TaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            status,
            result: None,
            error: None,
            traceback: None,
            started_at: None,
            completed_at: Some(now),
            execution_time: 0.0,
            attempt_number: task.retry_count + 1,
            retry_count: task.retry_count,
            worker_id: None,
            worker_node: None,
            metadata: Map::new(),
        }
    }

    pub fn complete(&mut self, value: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(value);
    }

    pub fn fail(&mut self, error: impl Into<String>, traceback: Option<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.traceback = traceback;
    }

    pub fn time_out(&mut self, timeout_seconds: u64) {
        self.status = TaskStatus::Timeout;
        self.error = Some(format!("Task timed out after {timeout_seconds} seconds"));
    }

    /// Stamp completion time and derive `execution_time`.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            let elapsed = now - started;
            self.execution_time = elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6;
        }
    }

    /// Relabel a failed attempt whose successor has been enqueued.
    pub fn mark_retrying(&mut self, next_attempt: &TaskId) {
        self.status = TaskStatus::Retrying;
        self.metadata.insert(
            NEXT_ATTEMPT_KEY.to_string(),
            Value::String(next_attempt.to_string()),
        );
    }

    /// Successor attempt id, if this attempt was retried.
    pub fn next_attempt_id(&self) -> Option<TaskId> {
        self.metadata
            .get(NEXT_ATTEMPT_KEY)
            .and_then(Value::as_str)
            .map(TaskId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn task() -> TaskDefinition {
        TaskDefinition::with_id(TaskId::new("t1"), TaskType::RiskAnalysis, "risk")
    }

    #[rstest]
    #[case::completed(TaskStatus::Completed, true)]
    #[case::failed(TaskStatus::Failed, true)]
    #[case::timeout(TaskStatus::Timeout, true)]
    #[case::cancelled(TaskStatus::Cancelled, true)]
    #[case::retrying(TaskStatus::Retrying, false)]
    #[case::running(TaskStatus::Running, false)]
    #[case::pending(TaskStatus::Pending, false)]
    fn terminal_statuses(#[case] status: TaskStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn finish_computes_execution_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut result = TaskResult::started(&task(), start, WorkerId::new("w_0"), WorkerId::new("w"));
        result.complete(serde_json::json!({"ok": true}));
        result.finish(start + Duration::milliseconds(1500));

        assert_eq!(result.status, TaskStatus::Completed);
        assert!((result.execution_time - 1.5).abs() < 1e-9);
        assert_eq!(result.attempt_number, 1);
    }

    #[test]
    fn retrying_links_successor() {
        let mut result = TaskResult::without_execution(&task(), TaskStatus::Failed, Utc::now());
        assert!(result.next_attempt_id().is_none());

        result.mark_retrying(&TaskId::new("t1#retry-1"));
        assert_eq!(result.status, TaskStatus::Retrying);
        assert_eq!(result.next_attempt_id(), Some(TaskId::new("t1#retry-1")));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&TaskStatus::Timeout).unwrap(), "\"timeout\"");
    }
}

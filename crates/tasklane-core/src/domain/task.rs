//! Task definitions: what to run, how urgently, and under which limits.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::TaskId;

/// Priority bucket. Higher value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    /// Maintenance, optimization.
    Background,
    /// Cleanup, historical analysis.
    Low,
    /// Analytics updates, performance monitoring.
    Medium,
    /// Model training, pipeline failures.
    High,
    /// Real-time predictions, arbitrage alerts.
    Critical,
}

impl TaskPriority {
    /// All buckets, highest first (dequeue scan order).
    pub const DESCENDING: [TaskPriority; 5] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
        TaskPriority::Background,
    ];

    pub fn value(self) -> u8 {
        match self {
            TaskPriority::Critical => 100,
            TaskPriority::High => 80,
            TaskPriority::Medium => 60,
            TaskPriority::Low => 40,
            TaskPriority::Background => 20,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskPriority::Critical => "CRITICAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::Low => "LOW",
            TaskPriority::Background => "BACKGROUND",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Business category of a task. Informational only; dispatch goes through
/// `function_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ModelTraining,
    DataIngestion,
    PredictionBatch,
    RiskAnalysis,
    ArbitrageScan,
    PerformanceAnalysis,
    DataCleanup,
    BackupCreation,
    AlertProcessing,
    NotificationSending,
    CacheWarming,
    AnalyticsComputation,
}

/// A unit of background work. Immutable once enqueued; every attempt is its
/// own definition with its own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: TaskPriority,

    /// Registry key of the body to run.
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    // Execution limits
    pub max_retries: u32,
    pub timeout_seconds: u64,
    /// Base retry delay in seconds.
    pub retry_delay: u64,
    pub exponential_backoff: bool,

    // Scheduling
    /// Not claimable before this instant.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Never claimable after this instant.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub cron_expression: Option<String>,

    /// Advisory only. Nothing evaluates these edges.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub blocks: Vec<TaskId>,

    // Resource requirements
    pub cpu_requirement: f64,
    /// Megabytes.
    pub memory_requirement: f64,
    #[serde(default)]
    pub gpu_requirement: bool,

    // Attempt bookkeeping
    /// Zero for the first attempt.
    #[serde(default)]
    pub retry_count: u32,
    /// Id of the first attempt when this is a retry.
    #[serde(default)]
    pub root_id: Option<TaskId>,

    pub created_at: DateTime<Utc>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_created_by() -> String {
    "system".to_string()
}

impl TaskDefinition {
    /// New definition with a fresh id and the stock limits
    /// (3 retries, 300s timeout, 60s exponential backoff, 1 cpu, 512 MB).
    pub fn new(task_type: TaskType, function_name: impl Into<String>) -> Self {
        Self::with_id(TaskId::generate(), task_type, function_name)
    }

    pub fn with_id(id: TaskId, task_type: TaskType, function_name: impl Into<String>) -> Self {
        Self {
            id,
            task_type,
            priority: TaskPriority::Medium,
            function_name: function_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            max_retries: 3,
            timeout_seconds: 300,
            retry_delay: 60,
            exponential_backoff: true,
            scheduled_at: None,
            expires_at: None,
            recurring: false,
            cron_expression: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            cpu_requirement: 1.0,
            memory_requirement: 512.0,
            gpu_requirement: false,
            retry_count: 0,
            root_id: None,
            created_at: Utc::now(),
            created_by: default_created_by(),
            tags: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn retry_delay(mut self, retry_delay: u64, exponential_backoff: bool) -> Self {
        self.retry_delay = retry_delay;
        self.exponential_backoff = exponential_backoff;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Turn this definition into a recurring template.
    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.recurring = true;
        self.cron_expression = Some(expression.into());
        self
    }

    pub fn cpu_requirement(mut self, cpus: f64) -> Self {
        self.cpu_requirement = cpus;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// First instant at which the task may be claimed.
    pub fn eligible_at(&self, enqueued_at: DateTime<Utc>) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(enqueued_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Id of the first attempt of this logical task.
    pub fn root(&self) -> &TaskId {
        self.root_id.as_ref().unwrap_or(&self.id)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }

    /// The next attempt after a failure: new id, bumped retry count, eligible
    /// after `delay`. Everything else is copied.
    pub fn next_attempt(&self, now: DateTime<Utc>, delay: std::time::Duration) -> TaskDefinition {
        let retry_count = self.retry_count + 1;
        let root = self.root().clone();
        // A delay past the calendar's end parks the attempt at the end of time.
        let eligible = ChronoDuration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut next = self.clone();
        next.id = root.retry_attempt(retry_count);
        next.root_id = Some(root);
        next.retry_count = retry_count;
        next.scheduled_at = Some(eligible);
        next.created_at = now;
        next
    }

    /// A concrete one-shot instance of a recurring template, fired at `at`.
    pub fn materialize(&self, at: DateTime<Utc>) -> TaskDefinition {
        let mut instance = TaskDefinition::with_id(
            self.id.occurrence(at),
            self.task_type,
            self.function_name.clone(),
        );
        instance.priority = self.priority;
        instance.args = self.args.clone();
        instance.kwargs = self.kwargs.clone();
        instance.max_retries = self.max_retries;
        instance.timeout_seconds = self.timeout_seconds;
        instance.retry_delay = self.retry_delay;
        instance.exponential_backoff = self.exponential_backoff;
        instance.cpu_requirement = self.cpu_requirement;
        instance.memory_requirement = self.memory_requirement;
        instance.gpu_requirement = self.gpu_requirement;
        instance.tags = self.tags.clone();
        instance.created_at = at;
        instance.created_by = "scheduler".to_string();
        instance
    }
}

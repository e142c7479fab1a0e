//! Built-in maintenance schedules.
//!
//! These are configuration only: the processor registers them with the
//! scheduler, and the business layer supplies the function bodies. A
//! template already registered under one of these ids wins over the default.

use serde_json::json;

use crate::domain::{TaskDefinition, TaskId, TaskPriority, TaskType};

pub const CLEANUP_JOB: &str = "data_cleanup_daily";
pub const BACKUP_JOB: &str = "backup_daily";
pub const CACHE_WARMING_JOB: &str = "cache_warming_periodic";
pub const PERFORMANCE_ANALYSIS_JOB: &str = "performance_analysis_hourly";

pub const CLEANUP_FUNCTION: &str = "cleanup_task";
pub const BACKUP_FUNCTION: &str = "backup_task";
pub const CACHE_WARMING_FUNCTION: &str = "cache_warming_task";
pub const PERFORMANCE_ANALYSIS_FUNCTION: &str = "performance_analysis_task";

/// Function names the default schedules call.
pub const DEFAULT_JOB_FUNCTIONS: [&str; 4] = [
    CLEANUP_FUNCTION,
    BACKUP_FUNCTION,
    CACHE_WARMING_FUNCTION,
    PERFORMANCE_ANALYSIS_FUNCTION,
];

pub fn default_jobs() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::with_id(TaskId::new(CLEANUP_JOB), TaskType::DataCleanup, CLEANUP_FUNCTION)
            .priority(TaskPriority::Low)
            .kwarg("cleanup_type", "old_predictions")
            .kwarg("days_old", 30)
            .cron("0 0 * * *"),
        TaskDefinition::with_id(TaskId::new(BACKUP_JOB), TaskType::BackupCreation, BACKUP_FUNCTION)
            .priority(TaskPriority::Medium)
            .kwarg("backup_type", "incremental")
            .kwarg("data_size_mb", 2000)
            .cron("0 0 * * *"),
        TaskDefinition::with_id(
            TaskId::new(CACHE_WARMING_JOB),
            TaskType::CacheWarming,
            CACHE_WARMING_FUNCTION,
        )
        .priority(TaskPriority::Low)
        .kwarg("cache_keys", json!(["popular_predictions", "top_opportunities"]))
        .cron("*/15 * * * *"),
        TaskDefinition::with_id(
            TaskId::new(PERFORMANCE_ANALYSIS_JOB),
            TaskType::PerformanceAnalysis,
            PERFORMANCE_ANALYSIS_FUNCTION,
        )
        .priority(TaskPriority::Medium)
        .kwarg("analysis_type", "hourly_metrics")
        .kwarg("metrics_count", 25)
        .cron("0 */6 * * *"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{CronMatcher, StandardCron};
    use rstest::rstest;

    #[test]
    fn every_default_job_is_a_valid_recurring_definition() {
        let jobs = default_jobs();
        assert_eq!(jobs.len(), DEFAULT_JOB_FUNCTIONS.len());
        for job in &jobs {
            assert!(job.recurring, "{}", job.id);
            let expr = job.cron_expression.as_deref().unwrap();
            StandardCron.validate(expr).unwrap();
            assert!(DEFAULT_JOB_FUNCTIONS.contains(&job.function_name.as_str()));
        }
    }

    #[rstest]
    #[case::cleanup(CLEANUP_JOB, TaskPriority::Low, "0 0 * * *")]
    #[case::backup(BACKUP_JOB, TaskPriority::Medium, "0 0 * * *")]
    #[case::cache_warming(CACHE_WARMING_JOB, TaskPriority::Low, "*/15 * * * *")]
    #[case::performance(PERFORMANCE_ANALYSIS_JOB, TaskPriority::Medium, "0 */6 * * *")]
    fn default_job_settings(#[case] id: &str, #[case] priority: TaskPriority, #[case] cron: &str) {
        let job = default_jobs().into_iter().find(|j| j.id.as_str() == id).unwrap();
        assert_eq!(job.priority, priority);
        assert_eq!(job.cron_expression.as_deref(), Some(cron));
        assert_eq!(job.timeout_seconds, TaskDefinition::with_id(TaskId::new("x"), job.task_type, "f").timeout_seconds);
    }

    #[test]
    fn cache_warming_targets_the_two_hot_keys() {
        let job = default_jobs().into_iter().find(|j| j.id.as_str() == CACHE_WARMING_JOB).unwrap();
        assert_eq!(job.kwargs["cache_keys"], json!(["popular_predictions", "top_opportunities"]));
    }
}

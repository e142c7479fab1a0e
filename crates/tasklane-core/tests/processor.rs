use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use tasklane_core::app::default_jobs;
use tasklane_core::domain::{TaskDefinition, TaskId, TaskPriority, TaskStatus, TaskType, WorkerId};
use tasklane_core::impls::MemoryStore;
use tasklane_core::ports::ManualClock;
use tasklane_core::registry::{TaskContext, TaskFailure, async_fn, blocking_fn};
use tasklane_core::{ProcessorBuilder, ProcessorConfig, TaskError, TaskProcessor};

fn config() -> ProcessorConfig {
    ProcessorConfig {
        num_workers: 2,
        worker_concurrency: 2,
        parallel_pool_size: 2,
        poll_interval_ms: 10,
        error_backoff_ms: 20,
        shutdown_grace_secs: 5,
        register_default_jobs: false,
        ..ProcessorConfig::default()
    }
}

fn builder() -> ProcessorBuilder {
    ProcessorBuilder::new(config())
        .register(
            "predict_games",
            blocking_fn(|ctx| {
                let games: u64 = ctx.kwarg("games")?;
                Ok(json!({ "predictions": games, "confidence": 0.82 }))
            }),
        )
        .unwrap()
        .register(
            "scan_markets",
            async_fn(|ctx: TaskContext| async move {
                let markets: Vec<String> = ctx.kwarg_or("markets", Vec::new())?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, TaskFailure>(json!({ "opportunities": markets.len() }))
            }),
        )
        .unwrap()
}

async fn started(builder: ProcessorBuilder) -> TaskProcessor {
    let processor = builder.build().unwrap();
    processor.start().await.unwrap();
    processor
}

fn task(id: &str, function: &str) -> TaskDefinition {
    TaskDefinition::with_id(TaskId::new(id), TaskType::PredictionBatch, function)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submitted_task_completes() {
    let processor = started(builder()).await;

    let id = processor
        .submit_task(task("nba-slate", "predict_games").kwarg("games", 9))
        .await
        .unwrap();
    let result = processor
        .await_task_result(&id, Duration::from_secs(10))
        .await
        .unwrap()
        .expect("finished in time");

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.result, Some(json!({ "predictions": 9, "confidence": 0.82 })));
    assert_eq!(processor.get_task_result(&id).await.unwrap(), Some(result));

    processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_and_parallel_bodies_both_run() {
    let processor = started(builder()).await;

    let io = processor
        .submit_task(task("scan", "scan_markets").kwarg("markets", json!(["h2h", "spread"])))
        .await
        .unwrap();
    let cpu = processor
        .submit_task(task("heavy", "predict_games").kwarg("games", 3).cpu_requirement(4.0))
        .await
        .unwrap();

    for (id, expected) in [(io, json!({ "opportunities": 2 })), (cpu, json!({ "predictions": 3, "confidence": 0.82 }))] {
        let result = processor
            .await_task_result(&id, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed, "{id}");
        assert_eq!(result.result, Some(expected));
    }

    processor.shutdown().await;
}

#[tokio::test]
async fn dequeue_order_follows_priority_then_fifo() {
    let processor = builder().build().unwrap();
    processor.initialize().await.unwrap();

    for (id, priority) in [("A", TaskPriority::Critical), ("B", TaskPriority::Low), ("C", TaskPriority::Critical)] {
        processor
            .submit_task(task(id, "predict_games").priority(priority))
            .await
            .unwrap();
    }

    let worker = WorkerId::new("worker-client");
    let mut order = Vec::new();
    while let Some(claimed) = processor.queue().dequeue(&worker).await.unwrap() {
        order.push(claimed.id.to_string());
    }
    assert_eq!(order, ["A", "C", "B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn await_follows_the_retry_chain() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let processor = started(
        builder()
            .register(
                "train_model",
                blocking_fn(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(TaskFailure::with_trace("gradient exploded", "epoch 3"))
                }),
            )
            .unwrap(),
    )
    .await;

    let id = processor
        .submit_task(
            TaskDefinition::with_id(TaskId::new("train-xgb"), TaskType::ModelTraining, "train_model")
                .max_retries(2)
                .retry_delay(0, false),
        )
        .await
        .unwrap();

    let last = processor
        .await_task_result(&id, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.task_id, id.retry_attempt(2));
    assert_eq!(last.status, TaskStatus::Failed);
    assert_eq!(last.error.as_deref(), Some("gradient exploded"));
    assert_eq!(last.traceback.as_deref(), Some("epoch 3"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let first = processor.get_task_result(&id).await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Retrying);

    processor.shutdown().await;
}

#[tokio::test]
async fn await_gives_up_after_timeout() {
    let processor = builder().build().unwrap();
    processor.initialize().await.unwrap();

    let id = processor
        .submit_task(task("never-run", "predict_games"))
        .await
        .unwrap();
    let waited = processor
        .await_task_result(&id, Duration::from_millis(120))
        .await
        .unwrap();
    assert!(waited.is_none());
}

#[tokio::test]
async fn pending_task_can_be_cancelled_once() {
    let processor = builder().build().unwrap();
    processor.initialize().await.unwrap();

    let id = processor
        .submit_task(task("stale-odds", "predict_games").priority(TaskPriority::High))
        .await
        .unwrap();

    assert!(processor.cancel_task(&id).await.unwrap());
    assert!(!processor.cancel_task(&id).await.unwrap());

    let result = processor.get_task_result(&id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(processor.queue().dequeue(&WorkerId::new("worker-client")).await.unwrap().is_none());
    assert!(!processor.cancel_task(&TaskId::new("unknown")).await.unwrap());
}

#[tokio::test]
async fn recurring_submission_registers_a_template() {
    let processor = builder().build().unwrap();
    processor.initialize().await.unwrap();

    let id = processor
        .submit_task(
            TaskDefinition::with_id(TaskId::new("odds-refresh"), TaskType::DataIngestion, "scan_markets")
                .cron("*/5 * * * *"),
        )
        .await
        .unwrap();

    let stats = processor.get_system_stats().await.unwrap();
    assert_eq!(stats.scheduled_tasks, 1);
    assert_eq!(stats.queue.total_pending, 0);
    assert!(processor.scheduler().unschedule(&id).await);
}

#[tokio::test]
async fn invalid_cron_is_rejected_on_submit() {
    let processor = builder().build().unwrap();
    let bad = TaskDefinition::with_id(TaskId::new("bad"), TaskType::DataIngestion, "scan_markets").cron("61 * * * *");
    assert!(matches!(processor.submit_task(bad).await, Err(TaskError::InvalidCron { .. })));
}

#[tokio::test]
async fn default_jobs_are_registered_on_initialize() {
    let processor = ProcessorBuilder::new(ProcessorConfig {
        register_default_jobs: true,
        ..config()
    })
    .build()
    .unwrap();
    processor.initialize().await.unwrap();
    processor.initialize().await.unwrap();

    let ids: Vec<String> = processor
        .scheduler()
        .scheduled()
        .await
        .into_iter()
        .map(|t| t.id.to_string())
        .collect();
    assert_eq!(
        ids,
        [
            "backup_daily",
            "cache_warming_periodic",
            "data_cleanup_daily",
            "performance_analysis_hourly"
        ]
    );
    assert_eq!(processor.get_system_stats().await.unwrap().queue.total_pending, 0);
}

#[tokio::test]
async fn initialize_again_does_not_refire_or_override_defaults() {
    let midnight = Utc.with_ymd_and_hms(2025, 6, 4, 0, 0, 0).unwrap();
    let processor = ProcessorBuilder::new(ProcessorConfig {
        register_default_jobs: true,
        ..config()
    })
    .clock(Arc::new(ManualClock::new(midnight)))
    .build()
    .unwrap();

    let weekly_backup = TaskDefinition::with_id(
        TaskId::new(default_jobs::BACKUP_JOB),
        TaskType::BackupCreation,
        default_jobs::BACKUP_FUNCTION,
    )
    .cron("0 0 * * SUN");
    processor.submit_task(weekly_backup).await.unwrap();

    processor.initialize().await.unwrap();
    // Cleanup, cache warming and performance analysis are all due at 00:00;
    // 2025-06-04 is a Wednesday, so the overridden backup is not.
    assert_eq!(processor.scheduler().tick(midnight).await, 3);

    processor.initialize().await.unwrap();
    assert_eq!(processor.scheduler().tick(midnight + chrono::Duration::seconds(30)).await, 0);
    assert_eq!(processor.get_system_stats().await.unwrap().queue.total_pending, 3);

    let backup = processor
        .scheduler()
        .scheduled()
        .await
        .into_iter()
        .find(|t| t.id.as_str() == default_jobs::BACKUP_JOB)
        .unwrap();
    assert_eq!(backup.cron_expression.as_deref(), Some("0 0 * * SUN"));
}

#[tokio::test]
async fn worker_ids_follow_the_processor_clock() {
    let at = Utc.with_ymd_and_hms(2025, 6, 4, 9, 30, 0).unwrap();
    let processor = builder()
        .clock(Arc::new(ManualClock::new(at)))
        .build()
        .unwrap();
    processor.initialize().await.unwrap();

    let ids = processor.start_workers(2).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    for id in &ids {
        let body = id.as_str().strip_prefix("worker-").unwrap();
        let ulid: ulid::Ulid = body.parse().unwrap();
        assert_eq!(ulid.timestamp_ms(), at.timestamp_millis() as u64);
    }

    processor.shutdown().await;
}

#[tokio::test]
async fn workers_need_initialization() {
    let processor = builder().build().unwrap();
    assert!(matches!(processor.start_workers(1).await, Err(TaskError::NotInitialized)));
    assert!(matches!(processor.start_scheduler().await, Err(TaskError::NotInitialized)));
}

#[tokio::test]
async fn builder_rejects_missing_functions() {
    let err = builder()
        .expect_functions(&["predict_games", "risk_analysis_task"])
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, TaskError::MissingFunctions(missing) if missing == ["risk_analysis_task"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_and_health_reflect_running_workers() {
    let store = Arc::new(MemoryStore::new());
    let processor = started(builder().store(store.clone())).await;

    let id = processor
        .submit_task(task("one", "predict_games").kwarg("games", 1))
        .await
        .unwrap();
    processor
        .await_task_result(&id, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    let stats = processor.get_system_stats().await.unwrap();
    assert_eq!(stats.workers.len(), 2);
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(stats.queue.total_results, 1);
    assert_eq!(stats.registered_functions, ["predict_games", "scan_markets"]);
    assert_eq!(stats.parallel_pool.size, 2);
    let rendered: Value = serde_json::to_value(&stats).unwrap();
    assert!(rendered["queue"]["priority_breakdown"].is_object());

    let health = processor.health_check().await;
    assert!(health.healthy);
    assert_eq!(health.workers_running, 2);
    assert!(health.scheduler_running);

    store.set_available(false);
    let health = processor.health_check().await;
    assert!(!health.healthy);
    assert!(health.store_error.is_some());
    store.set_available(true);

    processor.shutdown().await;
    let health = processor.health_check().await;
    assert_eq!(health.workers_total, 0);
    assert!(!health.scheduler_running);
}

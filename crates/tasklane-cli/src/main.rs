use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tasklane_core::app::default_jobs;
use tasklane_core::observability::init_tracing;
use tasklane_core::registry::{TaskContext, TaskFunction};
use tasklane_core::{
    ProcessorBuilder, ProcessorConfig, TaskDefinition, TaskFailure, TaskPriority, TaskProcessor, TaskType,
    async_fn, blocking_fn,
};
use tracing::info;

#[derive(Debug, Deserialize)]
struct PredictionPayload {
    sport: String,
    games: u32,
}

/// Fails the first `remaining_failures` calls to show the retry chain.
struct PredictionBatch {
    remaining_failures: AtomicU32,
}

impl PredictionBatch {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskFunction for PredictionBatch {
    async fn call(&self, ctx: TaskContext) -> Result<Value, TaskFailure> {
        let payload: PredictionPayload = serde_json::from_value(Value::Object(ctx.kwargs.clone()))
            .map_err(|e| TaskFailure::validation(format!("prediction payload: {e}")))?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskFailure::runtime(format!("odds feed timed out (left={left})")));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({
            "sport": payload.sport,
            "predictions": payload.games,
            "attempt": ctx.attempt,
        }))
    }
}

/// Pure CPU work, routed to the parallel pool by its cpu requirement.
fn risk_analysis(ctx: TaskContext) -> Result<Value, TaskFailure> {
    let samples: u64 = ctx.kwarg_or("samples", 200_000)?;
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut losses = 0u64;
    for _ in 0..samples {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        if state % 100 < 37 {
            losses += 1;
        }
    }
    Ok(json!({ "samples": samples, "loss_rate": losses as f64 / samples.max(1) as f64 }))
}

fn build(config: ProcessorConfig) -> tasklane_core::Result<TaskProcessor> {
    ProcessorBuilder::new(config)
        .register("predict_games", Arc::new(PredictionBatch::new(1)))?
        .register("risk_analysis", blocking_fn(risk_analysis))?
        .register(
            default_jobs::CLEANUP_FUNCTION,
            blocking_fn(|ctx| {
                let days: u64 = ctx.kwarg_or("days_old", 30)?;
                Ok(json!({ "removed": 0, "days_old": days }))
            }),
        )?
        .register(
            default_jobs::BACKUP_FUNCTION,
            async_fn(|ctx: TaskContext| async move {
                let size: u64 = ctx.kwarg_or("data_size_mb", 0)?;
                Ok::<_, TaskFailure>(json!({ "backed_up_mb": size }))
            }),
        )?
        .register(
            default_jobs::CACHE_WARMING_FUNCTION,
            blocking_fn(|ctx| {
                let keys: Vec<String> = ctx.kwarg_or("cache_keys", Vec::new())?;
                Ok(json!({ "warmed": keys }))
            }),
        )?
        .register(
            default_jobs::PERFORMANCE_ANALYSIS_FUNCTION,
            blocking_fn(|ctx| {
                let metrics: u64 = ctx.kwarg_or("metrics_count", 0)?;
                Ok(json!({ "metrics": metrics }))
            }),
        )?
        .expect_functions(&["predict_games", "risk_analysis"])
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("TASKLANE_CONFIG") {
        Ok(path) => ProcessorConfig::load_from(path)?,
        Err(_) => ProcessorConfig::load()?,
    };
    init_tracing(&config.logging);

    let processor = build(config)?;
    processor.start().await?;

    let mut submitted = Vec::new();
    for (sport, games, priority) in [
        ("nba", 11, TaskPriority::High),
        ("nfl", 16, TaskPriority::Critical),
        ("mlb", 15, TaskPriority::Medium),
    ] {
        let task = TaskDefinition::new(TaskType::PredictionBatch, "predict_games")
            .priority(priority)
            .kwarg("sport", sport)
            .kwarg("games", games)
            .max_retries(2)
            .retry_delay(1, false)
            .tag("demo");
        submitted.push(processor.submit_task(task).await?);
    }
    submitted.push(
        processor
            .submit_task(
                TaskDefinition::new(TaskType::RiskAnalysis, "risk_analysis")
                    .priority(TaskPriority::High)
                    .kwarg("samples", 2_000_000)
                    .cpu_requirement(4.0),
            )
            .await?,
    );

    for id in &submitted {
        match processor.await_task_result(id, Duration::from_secs(30)).await? {
            Some(result) => info!(
                task_id = %id,
                attempt = %result.task_id,
                status = ?result.status,
                result = %result.result.unwrap_or(serde_json::Value::Null),
                "task finished"
            ),
            None => info!(task_id = %id, "task still running"),
        }
    }

    let stats = processor.get_system_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if std::env::args().any(|arg| arg == "--serve") {
        info!("serving; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
    }

    processor.shutdown().await;
    Ok(())
}

//! TaskScheduler - turns schedules into enqueues.
//!
//! Recurring definitions live in an in-memory template table owned by the
//! scheduler instance. Each tick materializes a fresh one-shot definition for
//! every template whose cron expression came due; the template itself is
//! never touched. One-shot and deferred definitions go
//! straight to the queue, which withholds them until `scheduled_at`.
//!
//! # Ticks and missed minutes
//! A tick does not only look at the minute it lands in. It evaluates every
//! minute from the previous tick's minute up to the current one, so a loop
//! that drifts past a minute boundary (tick at 00:00:59, next at 00:02:00)
//! still fires a template due at 00:01. Missed minutes are coalesced: a
//! template fires at most once per tick, for the latest due minute it has
//! not fired for yet. The look-back is capped at [`MAX_CATCH_UP`] so a
//! process that was suspended for hours does not replay its whole backlog.
//!
//! `last_fired` is the dedupe record. It only ever moves forward, survives
//! re-registration of the same id, and is rolled back when the enqueue for
//! a firing fails so the next tick tries that minute again.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub use self::cron::{CronMatcher, CronSchedule, StandardCron};

use crate::domain::{TaskDefinition, TaskId};
use crate::error::{Result, TaskError};
use crate::queue::TaskQueue;

/// How far back a tick looks for minutes the loop slept through.
pub const MAX_CATCH_UP: TimeDelta = TimeDelta::minutes(60);

struct Template {
    definition: TaskDefinition,
    /// Start of the last minute this template fired in.
    last_fired: Option<DateTime<Utc>>,
}

pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
    matcher: Arc<dyn CronMatcher>,
    templates: RwLock<HashMap<TaskId, Template>>,
    /// Minute of the previous tick.
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl TaskScheduler {
    pub fn new(queue: Arc<TaskQueue>, matcher: Arc<dyn CronMatcher>) -> Self {
        Self {
            queue,
            matcher,
            templates: RwLock::new(HashMap::new()),
            last_tick: Mutex::new(None),
        }
    }

    /// Register a recurring definition, or enqueue anything else.
    ///
    /// A recurring definition must carry a cron expression the matcher
    /// accepts. Registering an id again replaces the earlier definition but
    /// keeps its firing record, so it cannot fire twice in one minute.
    pub async fn schedule(&self, task: TaskDefinition) -> Result<TaskId> {
        let id = task.id.clone();

        if !task.recurring {
            self.queue.enqueue(&task).await?;
            debug!(task_id = %id, scheduled_at = ?task.scheduled_at, "one-shot task enqueued");
            return Ok(id);
        }

        let Some(expression) = task.cron_expression.as_deref() else {
            return Err(TaskError::NotRecurring(id.to_string()));
        };
        self.matcher.validate(expression)?;

        info!(task_id = %id, cron = expression, function = %task.function_name, "recurring task registered");
        let mut templates = self.templates.write().await;
        let last_fired = templates.get(&id).and_then(|t| t.last_fired);
        templates.insert(
            id.clone(),
            Template {
                definition: task,
                last_fired,
            },
        );
        Ok(id)
    }

    /// Remove a recurring template. Returns whether it existed.
    pub async fn unschedule(&self, id: &TaskId) -> bool {
        let removed = self.templates.write().await.remove(id).is_some();
        if removed {
            info!(task_id = %id, "recurring task removed");
        }
        removed
    }

    /// Registered templates, ordered by id.
    pub async fn scheduled(&self) -> Vec<TaskDefinition> {
        let templates = self.templates.read().await;
        let mut defs: Vec<TaskDefinition> = templates.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        defs
    }

    pub async fn is_scheduled(&self, id: &TaskId) -> bool {
        self.templates.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.templates.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.templates.read().await.is_empty()
    }

    /// Fire every template due between the previous tick and `now`. Each
    /// template fires at most once per minute however often this is called.
    /// Returns how many instances were enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let minute = now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now);
        let from = self.window_start(minute).await;

        let due: Vec<(TaskDefinition, DateTime<Utc>, Option<DateTime<Utc>>)> = {
            let mut templates = self.templates.write().await;
            templates
                .values_mut()
                .filter_map(|t| {
                    let at = self.latest_due(t, from, minute)?;
                    let previous = t.last_fired.replace(at);
                    Some((t.definition.clone(), at, previous))
                })
                .collect()
        };

        let mut fired = 0;
        for (template, at, previous) in due {
            let instance = template.materialize(at);
            match self.queue.enqueue(&instance).await {
                Ok(()) => {
                    fired += 1;
                    info!(template = %template.id, task_id = %instance.id, due_at = %at, "recurring task fired");
                }
                Err(err) => {
                    error!(template = %template.id, error = %err, "failed to enqueue recurring task");
                    // Let the next tick try this minute again.
                    if let Some(t) = self.templates.write().await.get_mut(&template.id)
                        && t.last_fired == Some(at)
                    {
                        t.last_fired = previous;
                    }
                }
            }
        }
        fired
    }

    /// First minute this tick evaluates. A clock that moved backwards, or a
    /// first tick, only looks at the current minute.
    async fn window_start(&self, minute: DateTime<Utc>) -> DateTime<Utc> {
        let mut last_tick = self.last_tick.lock().await;
        let horizon = minute.checked_sub_signed(MAX_CATCH_UP).unwrap_or(minute);
        let from = match *last_tick {
            Some(prev) if prev <= minute => prev.max(horizon),
            _ => minute,
        };
        if last_tick.is_none_or(|prev| prev < minute) {
            *last_tick = Some(minute);
        }
        from
    }

    fn latest_due(&self, template: &Template, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut at = to;
        while at >= from {
            if template.last_fired.is_some_and(|fired| fired >= at) {
                return None;
            }
            if self.matcher.fires_at(&template.definition, at) {
                return Some(at);
            }
            at -= TimeDelta::minutes(1);
        }
        None
    }

    /// Tick every `interval` until shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let fired = self.tick(self.queue.now()).await;
                        debug!(fired, "scheduler tick");
                    }
                }
            }
            info!("scheduler stopped");
        });

        info!(?interval, "scheduler started");
        SchedulerHandle { shutdown_tx, join }
    }
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

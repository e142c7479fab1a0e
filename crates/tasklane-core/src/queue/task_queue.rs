//! TaskQueue - leased priority queue on top of a `BackingStore`.
//!
//! # Claim protocol
//! 1. Scan buckets highest priority first, earliest score first, score <= now.
//! 2. `set_nx_ex` the lock key. Losing means another worker got there first.
//! 3. `zrem` the id from its bucket. Only the caller whose `zrem` returns
//!    `true` owns the attempt; anyone else releases its lock and moves on.
//! 4. Record the id in `running`, scored by the lease deadline, then
//!    stretch the lock to cover long task timeouts.
//!
//! Buckets are walked page by page, so any number of unclaimable heads
//! (locked, expired) never hides a claimable entry behind them.
//!
//! Every step is a single store operation. No process-wide mutex exists, so
//! any number of workers (in any number of processes) can share one store.
//! A worker that dies mid-attempt leaves its id in `running`; once the lease
//! lapses [`TaskQueue::reap_expired_leases`] puts it back in its bucket.
//! Execution is therefore at-least-once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::keys::{self, QueueKeys};
use crate::codec;
use crate::domain::{TaskDefinition, TaskId, TaskPriority, TaskResult, TaskStatus, WorkerId};
use crate::error::Result;
use crate::ports::{BackingStore, Clock};

/// Candidates fetched per page while walking a bucket.
const CLAIM_BATCH: usize = 16;

/// Longest lease a claim will take out, whatever the task's timeout.
pub const MAX_LEASE: Duration = Duration::from_secs(30 * 24 * 3600);

/// Tunables for a queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Key prefix; queues with different names never see each other.
    pub name: String,
    /// Base lease on a claimed task.
    pub lease_ttl: Duration,
    /// Slack added on top of a task's timeout when its lease is extended.
    pub lease_grace: Duration,
    pub payload_ttl: Duration,
    pub result_ttl: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "tasklane".to_string(),
            lease_ttl: Duration::from_secs(3600),
            lease_grace: Duration::from_secs(30),
            payload_ttl: Duration::from_secs(86_400),
            result_ttl: Duration::from_secs(604_800),
        }
    }
}

/// Snapshot for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_pending: usize,
    /// Pending count per priority name.
    pub priority_breakdown: BTreeMap<String, usize>,
    /// Seconds since the earliest pending eligibility time. Negative when
    /// every pending task is scheduled in the future.
    pub oldest_task_age: Option<f64>,
    pub newest_task_age: Option<f64>,
    pub total_results: usize,
    pub active_locks: usize,
    pub running: usize,
}

pub struct TaskQueue {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    keys: QueueKeys,
    options: QueueOptions,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn BackingStore>, clock: Arc<dyn Clock>, options: QueueOptions) -> Self {
        Self {
            store,
            clock,
            keys: QueueKeys::new(options.name.clone()),
            options,
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist `task` and make it claimable from its eligibility time on.
    ///
    /// The payload is written before the id enters its bucket so a racing
    /// claimer never sees an id without a payload.
    pub async fn enqueue(&self, task: &TaskDefinition) -> Result<()> {
        let now = self.clock.now();
        let payload = codec::encode("task", task)?;
        let eligible = task.eligible_at(now);

        self.store
            .setex(&self.keys.task(&task.id), &payload, self.options.payload_ttl)
            .await?;
        if let Some(expires_at) = task.expires_at {
            self.store
                .setex(
                    &self.keys.expire(&task.id),
                    &expires_at.to_rfc3339(),
                    self.options.payload_ttl,
                )
                .await?;
        }
        self.store
            .zadd(
                &self.keys.bucket(task.priority),
                task.id.as_str(),
                keys::score(eligible),
            )
            .await?;

        debug!(
            task_id = %task.id,
            priority = %task.priority,
            function = %task.function_name,
            eligible_at = %eligible,
            "task enqueued"
        );
        Ok(())
    }

    /// Claim the highest-priority eligible task for `worker_id`.
    ///
    /// `Ok(None)` means nothing eligible and unclaimed exists right now.
    pub async fn dequeue(&self, worker_id: &WorkerId) -> Result<Option<TaskDefinition>> {
        let now = self.clock.now();
        let ceiling = keys::score(now);

        for priority in TaskPriority::DESCENDING {
            let bucket = self.keys.bucket(priority);
            if let Some(task) = self.claim_from_bucket(&bucket, worker_id, now, ceiling).await? {
                info!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    priority = %priority,
                    attempt = task.retry_count + 1,
                    "task claimed"
                );
                return Ok(Some(task));
            }
        }

        Ok(None)
    }

    /// Walk one bucket page by page until a claim succeeds or every eligible
    /// entry has been tried. Pages restart at the last score seen; members
    /// already tried are skipped, and a page made only of those doubles the
    /// page size so a long run of equal scores cannot stall the walk.
    async fn claim_from_bucket(
        &self,
        bucket: &str,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        ceiling: f64,
    ) -> Result<Option<TaskDefinition>> {
        let mut floor = f64::MIN;
        let mut limit = CLAIM_BATCH;
        let mut tried: HashSet<String> = HashSet::new();

        loop {
            let page = self
                .store
                .zrange_by_score(bucket, floor, ceiling, limit)
                .await?;
            let exhausted = page.len() < limit;
            let mut fresh = false;

            for candidate in page {
                floor = floor.max(candidate.score);
                if !tried.insert(candidate.member.clone()) {
                    continue;
                }
                fresh = true;
                let id = TaskId::new(candidate.member);
                if let Some(task) = self.try_claim(bucket, &id, worker_id, now).await? {
                    return Ok(Some(task));
                }
            }

            if exhausted {
                return Ok(None);
            }
            if !fresh {
                limit = limit.saturating_mul(2);
            }
        }
    }

    async fn try_claim(
        &self,
        bucket: &str,
        id: &TaskId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskDefinition>> {
        if self.marker_expired(id, now).await? {
            if self.store.zrem(bucket, id.as_str()).await? {
                self.discard(id).await?;
                debug!(task_id = %id, "expired task discarded");
            }
            return Ok(None);
        }

        let lock_key = self.keys.lock(id);
        if !self
            .store
            .set_nx_ex(&lock_key, worker_id.as_str(), self.options.lease_ttl)
            .await?
        {
            return Ok(None);
        }

        if !self.store.zrem(bucket, id.as_str()).await? {
            // Claimed and removed by someone whose lease has since lapsed.
            self.store.delete(&lock_key).await?;
            return Ok(None);
        }

        let Some(payload) = self.store.get(&self.keys.task(id)).await? else {
            warn!(task_id = %id, "queued id without payload; dropping");
            self.store.delete(&lock_key).await?;
            return Ok(None);
        };

        let task: TaskDefinition = match codec::decode("task", &payload) {
            Ok(task) => task,
            Err(err) => {
                warn!(task_id = %id, error = %err, "undecodable payload; dropping");
                self.store.delete(&lock_key).await?;
                return Ok(None);
            }
        };

        if task.is_expired(now) {
            self.discard(id).await?;
            self.store.delete(&lock_key).await?;
            debug!(task_id = %id, "expired task discarded");
            return Ok(None);
        }

        // Into `running` before anything else can fail: from here on the
        // reaper can always recover the attempt.
        let lease = self.lease_for(&task);
        let deadline = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.store
            .zadd(&self.keys.running(), id.as_str(), keys::score(deadline))
            .await?;

        if lease > self.options.lease_ttl {
            self.store
                .setex(&lock_key, worker_id.as_str(), lease)
                .await?;
        }

        Ok(Some(task))
    }

    /// Lease long enough to cover the task's own timeout, capped at
    /// [`MAX_LEASE`].
    fn lease_for(&self, task: &TaskDefinition) -> Duration {
        self.options
            .lease_ttl
            .max(task.timeout().saturating_add(self.options.lease_grace))
            .min(MAX_LEASE.max(self.options.lease_ttl))
    }

    async fn marker_expired(&self, id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let Some(marker) = self.store.get(&self.keys.expire(id)).await? else {
            return Ok(false);
        };
        Ok(DateTime::parse_from_rfc3339(&marker)
            .map(|at| at.with_timezone(&Utc) <= now)
            .unwrap_or(false))
    }

    async fn discard(&self, id: &TaskId) -> Result<()> {
        self.store.delete(&self.keys.task(id)).await?;
        self.store.delete(&self.keys.expire(id)).await?;
        Ok(())
    }

    /// Persist `result` (last write wins) and release the attempt's lease.
    /// A completed attempt's payload is deleted; any other outcome keeps it
    /// until its TTL runs out.
    pub async fn store_result(&self, result: &TaskResult) -> Result<()> {
        let encoded = codec::encode("result", result)?;
        let id = &result.task_id;

        self.store
            .setex(&self.keys.result(id), &encoded, self.options.result_ttl)
            .await?;
        self.store.zrem(&self.keys.running(), id.as_str()).await?;
        self.store.delete(&self.keys.lock(id)).await?;
        if result.status == TaskStatus::Completed {
            self.discard(id).await?;
        }

        debug!(task_id = %id, status = ?result.status, "result stored");
        Ok(())
    }

    pub async fn get_result(&self, id: &TaskId) -> Result<Option<TaskResult>> {
        match self.store.get(&self.keys.result(id)).await? {
            Some(text) => Ok(Some(codec::decode("result", &text)?)),
            None => Ok(None),
        }
    }

    /// Cancel a task that is still pending. Returns `false` when the task is
    /// unknown or already claimed.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool> {
        let Some(payload) = self.store.get(&self.keys.task(id)).await? else {
            return Ok(false);
        };
        let task: TaskDefinition = codec::decode("task", &payload)?;

        if !self
            .store
            .zrem(&self.keys.bucket(task.priority), id.as_str())
            .await?
        {
            return Ok(false);
        }

        self.discard(id).await?;
        let result = TaskResult::without_execution(&task, TaskStatus::Cancelled, self.clock.now());
        self.store_result(&result).await?;
        info!(task_id = %id, "task cancelled");
        Ok(true)
    }

    /// Return lapsed claims to their buckets. Returns how many were requeued.
    pub async fn reap_expired_leases(&self) -> Result<usize> {
        let now = self.clock.now();
        let running = self.keys.running();
        let lapsed = self
            .store
            .zrange_by_score(&running, f64::MIN, keys::score(now), usize::MAX)
            .await?;

        let mut requeued = 0;
        for entry in lapsed {
            let id = TaskId::new(entry.member);
            if self.store.get(&self.keys.lock(&id)).await?.is_some() {
                continue;
            }

            match self.store.get(&self.keys.task(&id)).await? {
                Some(payload) => match codec::decode::<TaskDefinition>("task", &payload) {
                    Ok(task) => {
                        self.store
                            .zadd(&self.keys.bucket(task.priority), id.as_str(), keys::score(now))
                            .await?;
                        requeued += 1;
                        warn!(task_id = %id, "lease expired; task requeued");
                    }
                    Err(err) => warn!(task_id = %id, error = %err, "undecodable payload; not requeued"),
                },
                None => debug!(task_id = %id, "lease expired but payload is gone"),
            }
            self.store.zrem(&running, id.as_str()).await?;
        }

        Ok(requeued)
    }

    /// Delete every stored result. Returns how many were removed.
    pub async fn purge_results(&self) -> Result<usize> {
        let removed = self
            .store
            .delete_pattern(&self.keys.results_pattern())
            .await?;
        info!(removed, "results purged");
        Ok(removed)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let now = keys::score(self.clock.now());
        let mut stats = QueueStats::default();
        let mut oldest: Option<f64> = None;
        let mut newest: Option<f64> = None;

        for priority in TaskPriority::DESCENDING {
            let bucket = self.keys.bucket(priority);
            let count = self.store.zcard(&bucket).await?;
            stats.total_pending += count;
            stats
                .priority_breakdown
                .insert(priority.name().to_string(), count);

            if let Some(first) = self.store.zfirst(&bucket).await? {
                oldest = Some(oldest.map_or(first.score, |o| o.min(first.score)));
            }
            if let Some(last) = self.store.zlast(&bucket).await? {
                newest = Some(newest.map_or(last.score, |n| n.max(last.score)));
            }
        }

        stats.oldest_task_age = oldest.map(|score| (now - score) / 1e6);
        stats.newest_task_age = newest.map(|score| (now - score) / 1e6);
        stats.total_results = self.store.keys(&self.keys.results_pattern()).await?.len();
        stats.active_locks = self.store.keys(&self.keys.locks_pattern()).await?.len();
        stats.running = self.store.zcard(&self.keys.running()).await?;
        Ok(stats)
    }
}

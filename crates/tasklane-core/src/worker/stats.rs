//! Worker health counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{TaskStatus, WorkerId};

/// Lock-free counters updated by every execution slot of one worker.
#[derive(Debug)]
pub struct WorkerCounters {
    started_at: DateTime<Utc>,
    processed: AtomicU64,
    failed: AtomicU64,
    execution_micros: AtomicU64,
    busy: AtomicUsize,
}

impl WorkerCounters {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            execution_micros: AtomicU64::new(0),
            busy: AtomicUsize::new(0),
        }
    }

    pub fn begin(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished attempt by its final status.
    pub fn finish(&self, status: TaskStatus, execution_time: f64) {
        self.busy.fetch_sub(1, Ordering::Relaxed);
        match status {
            TaskStatus::Completed => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let micros = (execution_time.max(0.0) * 1e6) as u64;
        self.execution_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self, worker_id: &WorkerId, concurrency: usize, now: DateTime<Utc>) -> WorkerStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let attempts = processed + failed;
        let micros = self.execution_micros.load(Ordering::Relaxed);

        WorkerStats {
            worker_id: worker_id.clone(),
            tasks_processed: processed,
            tasks_failed: failed,
            success_rate: if attempts == 0 {
                0.0
            } else {
                processed as f64 / attempts as f64
            },
            average_execution_time: if attempts == 0 {
                0.0
            } else {
                micros as f64 / 1e6 / attempts as f64
            },
            uptime_seconds: (now - self.started_at).num_milliseconds().max(0) as f64 / 1e3,
            active_tasks: self.busy.load(Ordering::Relaxed),
            concurrency,
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    /// Attempts that completed.
    pub tasks_processed: u64,
    /// Attempts that failed, timed out, or hit an unknown function.
    pub tasks_failed: u64,
    pub success_rate: f64,
    /// Seconds per attempt.
    pub average_execution_time: f64,
    pub uptime_seconds: f64,
    pub active_tasks: usize,
    pub concurrency: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_derives_rates() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let counters = WorkerCounters::new(t0);
        for status in [TaskStatus::Completed, TaskStatus::Completed, TaskStatus::Completed, TaskStatus::Timeout] {
            counters.begin();
            counters.finish(status, 0.5);
        }
        counters.begin();

        let stats = counters.snapshot(&WorkerId::new("worker-1"), 4, t0 + chrono::Duration::seconds(90));
        assert_eq!(stats.tasks_processed, 3);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.success_rate, 0.75);
        assert_eq!(stats.average_execution_time, 0.5);
        assert_eq!(stats.uptime_seconds, 90.0);
        assert_eq!(stats.active_tasks, 1);
    }

    #[test]
    fn idle_worker_reports_zeroes() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let stats = WorkerCounters::new(t0).snapshot(&WorkerId::new("worker-1"), 1, t0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_execution_time, 0.0);
    }
}

//! ReaperLoop - recovers tasks whose lease ran out.
//!
//! A worker that dies mid-attempt leaves its task id in the running set with
//! no lease behind it. Each pass puts those payloads back in their priority
//! bucket so another worker can claim them (at-least-once).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::queue::TaskQueue;

/// Handle to a running reaper.
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn(queue: Arc<TaskQueue>, interval: Duration) -> Self {
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
                        match queue.reap_expired_leases().await {
                            Ok(0) => debug!("no expired leases"),
                            Ok(requeued) => info!(requeued, "requeued tasks with expired leases"),
                            Err(err) => warn!(error = %err, "lease reaping failed"),
                        }
                    }
                }
            }
            info!("reaper stopped");
        });

        info!(?interval, "reaper started");
        Self { shutdown_tx, join }
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskDefinition, TaskId, TaskType, WorkerId};
    use crate::impls::MemoryStore;
    use crate::ports::{BackingStore, ManualClock};
    use crate::queue::QueueOptions;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn requeues_abandoned_claims() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(chrono::Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap()));
        let options = QueueOptions {
            lease_ttl: Duration::from_secs(30),
            ..QueueOptions::default()
        };
        let queue = Arc::new(TaskQueue::new(store.clone(), clock.clone(), options));

        let task = TaskDefinition::with_id(TaskId::new("abandoned"), TaskType::DataIngestion, "ingest")
            .timeout_seconds(10);
        queue.enqueue(&task).await.unwrap();
        let claimed = queue.dequeue(&WorkerId::new("worker-dead")).await.unwrap();
        assert_eq!(claimed.map(|t| t.id), Some(task.id.clone()));

        // The worker never reports back: its lease lapses.
        store.delete(&queue.keys().lock(&task.id)).await.unwrap();
        clock.advance(chrono::Duration::seconds(60));

        let reaper = ReaperLoop::spawn(Arc::clone(&queue), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(reaper.is_running());
        reaper.shutdown().await;

        let again = queue.dequeue(&WorkerId::new("worker-live")).await.unwrap();
        assert_eq!(again.map(|t| t.id), Some(task.id));
    }
}

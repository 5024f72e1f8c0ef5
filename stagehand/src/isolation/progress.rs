//! ProgressTracker: periodic snapshots of active operations.
//!
//! Rather than a callback-timer per operation, this runs as one
//! `tokio::time::interval` loop spawned once by
//! [`super::manager::IsolationManager::start`] — exactly one timer for the
//! whole engine, never one per operation. Routing the tick through
//! [`super::thread_pool::DedicatedThreadPool`] was considered and rejected:
//! that pool is built for synchronous blocking closures, not a recurring
//! async timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::types::{EventType, OperationContext, OperationStatus};
use super::worker::Worker;

/// Status of one operation as surfaced to observability. Cancelled
/// operations are reported as `Cancelled` rather than folded into `Failed`,
/// since `OperationContext::status` already distinguishes them and losing
/// that distinction here would make `statistics()` and `progress()` disagree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl From<OperationStatus> for ProgressStatus {
    fn from(s: OperationStatus) -> Self {
        match s {
            OperationStatus::Processing => ProgressStatus::Processing,
            OperationStatus::Completed => ProgressStatus::Completed,
            OperationStatus::Failed => ProgressStatus::Failed,
            OperationStatus::Cancelled => ProgressStatus::Cancelled,
        }
    }
}

/// Point-in-time view of one in-flight (or just-finished) operation.
#[derive(Clone, Debug)]
pub struct ProgressSnapshot {
    pub operation_id: String,
    pub event_type: EventType,
    pub file_path: Option<std::path::PathBuf>,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub status: ProgressStatus,
    pub bytes_processed: u64,
}

impl ProgressSnapshot {
    fn from_context(ctx: &OperationContext) -> Self {
        let elapsed = Utc::now()
            .signed_duration_since(ctx.start_time)
            .to_std()
            .unwrap_or_default();
        Self {
            operation_id: ctx.operation_id.clone(),
            event_type: ctx.event_type,
            file_path: ctx.file_path.clone(),
            start_time: ctx.start_time,
            elapsed,
            status: ctx.status().into(),
            bytes_processed: ctx.bytes_processed,
        }
    }
}

/// Reads every worker's active operations on a fixed interval and
/// republishes them, both as a queryable latest-known map (for
/// `IsolationManager::progress`) and as a broadcast stream for subscribers.
/// Missed ticks are dropped, never queued.
pub struct ProgressTracker {
    workers: Vec<Arc<Worker>>,
    interval: Duration,
    latest: Arc<DashMap<String, ProgressSnapshot>>,
    tx: broadcast::Sender<ProgressSnapshot>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
    pub fn new(workers: Vec<Arc<Worker>>, interval: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            workers,
            interval,
            latest: Arc::new(DashMap::new()),
            tx,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Spawns the single tick loop. Idempotent: a second call is a no-op
    /// while the first loop is still running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            loop {
                ticker.tick().await;
                this.tick();
            }
        }));
    }

    fn tick(&self) {
        for worker in &self.workers {
            for ctx in worker.active_contexts() {
                let snapshot = ProgressSnapshot::from_context(&ctx);
                self.latest
                    .insert(snapshot.operation_id.clone(), snapshot.clone());
                // A full subscriber just misses this tick's snapshot; the
                // publish itself never blocks or retries.
                let _ = self.tx.send(snapshot);
            }
        }
        // Operations that finished between ticks stop appearing in any
        // worker's active set, but their last snapshot stays queryable via
        // `progress()` until `forget` is called explicitly (the manager does
        // this once it has relayed the terminal snapshot to the caller), so
        // a caller that raced the tick still observes the final state.
    }

    pub fn progress(&self, operation_id: &str) -> Option<ProgressSnapshot> {
        self.latest.get(operation_id).map(|e| e.value().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn forget(&self, operation_id: &str) {
        self.latest.remove(operation_id);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_none_before_the_first_tick() {
        let tracker = ProgressTracker::new(Vec::new(), Duration::from_millis(100));
        assert!(tracker.progress("missing-op").is_none());
    }

    #[test]
    fn forget_removes_a_previously_tracked_snapshot() {
        let tracker = ProgressTracker::new(Vec::new(), Duration::from_millis(100));
        tracker.latest.insert(
            "op-1".to_string(),
            ProgressSnapshot {
                operation_id: "op-1".to_string(),
                event_type: EventType::FileRead,
                file_path: None,
                start_time: Utc::now(),
                elapsed: Duration::ZERO,
                status: ProgressStatus::Processing,
                bytes_processed: 0,
            },
        );
        assert!(tracker.progress("op-1").is_some());
        tracker.forget("op-1");
        assert!(tracker.progress("op-1").is_none());
    }

    #[test]
    fn cancelled_status_survives_the_operation_status_conversion() {
        assert_eq!(
            ProgressStatus::from(OperationStatus::Cancelled),
            ProgressStatus::Cancelled
        );
        assert_eq!(
            ProgressStatus::from(OperationStatus::Failed),
            ProgressStatus::Failed
        );
    }

    #[tokio::test]
    async fn stop_before_start_is_a_harmless_no_op() {
        let tracker = Arc::new(ProgressTracker::new(Vec::new(), Duration::from_millis(10)));
        tracker.stop();
    }
}

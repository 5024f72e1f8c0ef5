//! Worker: one per event type. Dequeues batches, groups by priority,
//! splits into sub-batches, dispatches with a per-event-type parallelism
//! policy, and records outcomes through `ErrorRecovery` and the statistics
//! bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{Notify, mpsc};

use super::error::IsolationError;
use super::processor::EventProcessor;
use super::queue::EventQueue;
use super::recovery::{ErrorRecovery, RecoveryOutcome, RetryTicket};
use super::resource_pool::{ResourcePool, ceil_pow2};
use super::stats::{Alert, AlertBus};
use super::types::{EventType, IOEvent, OperationContext, Priority};

/// `Starting -> Running -> Draining -> Stopped`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct WorkerCounters {
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    events_cancelled: AtomicU64,
    total_processing_nanos: AtomicU64,
}

/// Derived, not source-of-truth, per-worker counters.
#[derive(Clone, Debug, Default)]
pub struct WorkerStatistics {
    pub event_type: Option<EventType>,
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_cancelled: u64,
    pub average_processing: Duration,
    pub active_operations: usize,
}

/// One worker per event type. Owns its queue reference, resource pool
/// reference, processor, and the set of operation contexts it currently
/// holds exclusively.
pub struct Worker {
    event_type: EventType,
    queue: Arc<EventQueue>,
    resource_pool: ResourcePool,
    recovery: Arc<ErrorRecovery>,
    processor: Arc<dyn EventProcessor>,
    alerts: AlertBus,
    state: AtomicU8,
    in_flight: AtomicU64,
    drain_notify: Notify,
    active: DashMap<String, OperationContext>,
    pending_retries: DashMap<String, IOEvent>,
    counters: WorkerCounters,
    batch_max: usize,
    sub_batch_size: usize,
    operation_deadline: Duration,
    max_buffer: u32,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_type: EventType,
        queue: Arc<EventQueue>,
        resource_pool: ResourcePool,
        recovery: Arc<ErrorRecovery>,
        processor: Arc<dyn EventProcessor>,
        alerts: AlertBus,
        batch_max: usize,
        sub_batch_size: usize,
        operation_deadline: Duration,
        max_buffer: u32,
    ) -> Self {
        Self {
            event_type,
            queue,
            resource_pool,
            recovery,
            processor,
            alerts,
            state: AtomicU8::new(WorkerState::Starting as u8),
            in_flight: AtomicU64::new(0),
            drain_notify: Notify::new(),
            active: DashMap::new(),
            pending_retries: DashMap::new(),
            counters: WorkerCounters::default(),
            batch_max,
            sub_batch_size,
            operation_deadline,
            max_buffer,
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: WorkerState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn active_contexts(&self) -> Vec<OperationContext> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Main loop for this worker's dedicated OS thread's async task. Runs
    /// until `stop()` moves the state past `Draining`.
    pub async fn run(self: Arc<Self>, mut retries: mpsc::UnboundedReceiver<RetryTicket>) {
        self.set_state(WorkerState::Running);
        self.alerts.publish(Alert::WorkerStarted {
            event_type: self.event_type,
        });

        loop {
            if self.state() == WorkerState::Stopped {
                break;
            }
            if self.state() == WorkerState::Draining && self.in_flight.load(Ordering::Acquire) == 0
            {
                break;
            }

            if !self.queue.is_processing() {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }

            // Drain any retries the recovery sweeper scheduled for this
            // worker's operations before pulling fresh work, so backoff
            // retries do not starve behind new submissions indefinitely.
            while let Ok(ticket) = retries.try_recv() {
                if let Some((_, event)) = self.pending_retries.remove(&ticket.operation_id) {
                    tracing::debug!(operation_id = %ticket.operation_id, attempt = ticket.attempt, "re-invoking processor for recovery retry");
                    self.process_one(event).await;
                }
            }

            let batch = self
                .queue
                .take_batch(self.batch_max, Duration::from_millis(50))
                .await;
            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }

            self.dispatch_batch(batch).await;
        }

        self.set_state(WorkerState::Stopped);
        self.drain_notify.notify_waiters();
    }

    async fn dispatch_batch(self: &Arc<Self>, batch: Vec<IOEvent>) {
        let mut by_priority: HashMap<Priority, Vec<IOEvent>> = HashMap::new();
        for event in batch {
            by_priority.entry(event.priority).or_default().push(event);
        }

        for priority in Priority::all() {
            let Some(events) = by_priority.remove(&priority) else {
                continue;
            };
            for sub_batch in events.chunks(self.sub_batch_size) {
                self.dispatch_sub_batch(sub_batch.to_vec()).await;
            }
        }
    }

    async fn dispatch_sub_batch(self: &Arc<Self>, sub_batch: Vec<IOEvent>) {
        if self.event_type.is_sequential() {
            for event in sub_batch {
                self.process_one(event).await;
            }
        } else if let Some(limit) = self.event_type.bounded_parallelism() {
            use futures::stream::StreamExt;
            futures::stream::iter(sub_batch)
                .for_each_concurrent(limit, |event| {
                    let this = Arc::clone(self);
                    async move { this.process_one(event).await }
                })
                .await;
        } else {
            let futures = sub_batch
                .into_iter()
                .map(|event| {
                    let this = Arc::clone(self);
                    async move { this.process_one(event).await }
                })
                .collect::<Vec<_>>();
            futures::future::join_all(futures).await;
        }
    }

    async fn process_one(self: &Arc<Self>, event: IOEvent) {
        if event.cancel.is_cancelled() {
            // Already cancelled before dispatch: dropped silently.
            return;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let mut ctx = OperationContext::start(&event);
        self.active.insert(ctx.operation_id.clone(), ctx.clone());

        let buffer_size = ceil_pow2(event.data_len().max(1024) as u32).min(self.max_buffer);
        let buffer = match self.resource_pool.get_buffer(buffer_size) {
            Ok(buffer) => Some(buffer),
            Err(err) => {
                // `get_buffer` only fails on a zero-sized request, which
                // `max(1024, ...)` above makes unreachable in practice; kept
                // as a real error path rather than an `unwrap` in case a
                // future caller ever drives `buffer_size` to zero.
                self.alerts.publish(Alert::WorkerError {
                    event_type: self.event_type,
                    message: err.to_string(),
                });
                None
            }
        };

        let operation_id = event.id.clone();
        let event_type = event.event_type;
        let priority = event.priority;
        let cancel = event.cancel.clone();
        let event_for_retry = event.clone();

        let processor = Arc::clone(&self.processor);
        let deadline = self.operation_deadline;

        let outcome = {
            let ctx_for_call = ctx.clone();
            let fut = processor.process(event, ctx_for_call, cancel.clone());
            let timed = tokio::time::timeout(
                deadline,
                std::panic::AssertUnwindSafe(fut).catch_unwind(),
            );
            match timed.await {
                Ok(Ok(Ok(outcome))) => Ok(outcome),
                Ok(Ok(Err(err))) => Err(err),
                Ok(Err(panic)) => {
                    let message = panic_message(&panic);
                    self.alerts.publish(Alert::EventProcessingFailed {
                        event_type,
                        operation_id: operation_id.clone(),
                        message: message.clone(),
                    });
                    Err(IsolationError::ProcessorPanic(message))
                }
                Err(_elapsed) => Err(IsolationError::Timeout(deadline)),
            }
        };

        // drop the buffer explicitly so it is returned to the pool on every
        // exit path, including the panic/timeout branches above.
        drop(buffer);

        match outcome {
            Ok(outcome) => {
                ctx.mark_completed(outcome.bytes_processed);
                self.counters.events_processed.fetch_add(1, Ordering::Relaxed);
                if self.recovery.mark_successful(&operation_id) {
                    self.alerts.publish(Alert::CircuitBreakerClosed {
                        event_type,
                        operation_id: operation_id.clone(),
                    });
                }
            }
            Err(err) if cancel.is_cancelled() => {
                ctx.mark_cancelled(format!("cancelled: {err}"));
                self.counters.events_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                ctx.mark_failed(err.to_string());
                self.counters.events_failed.fetch_add(1, Ordering::Relaxed);
                self.alerts.publish(Alert::EventProcessingFailed {
                    event_type,
                    operation_id: operation_id.clone(),
                    message: err.to_string(),
                });
                match self
                    .recovery
                    .attempt_recovery(&operation_id, &err, event_type, priority)
                {
                    RecoveryOutcome::RecoveryQueued { attempt } => {
                        tracing::debug!(operation_id = %operation_id, attempt, "recovery queued");
                        self.pending_retries.insert(operation_id.clone(), event_for_retry);
                    }
                    RecoveryOutcome::CircuitBreakerOpen => {
                        self.alerts.publish(Alert::CircuitBreakerOpened {
                            event_type,
                            operation_id: operation_id.clone(),
                        });
                    }
                    RecoveryOutcome::MaxAttemptsReached => {
                        self.alerts.publish(Alert::CircuitBreakerOpened {
                            event_type,
                            operation_id: operation_id.clone(),
                        });
                    }
                }
            }
        }

        let elapsed = Utc::now()
            .signed_duration_since(ctx.start_time)
            .to_std()
            .unwrap_or_default();
        self.counters
            .total_processing_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);

        self.active.remove(&operation_id);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Moves to `Draining`, allowing in-flight work to finish, then waits
    /// up to `timeout` before force-stopping.
    pub async fn stop(self: &Arc<Self>, timeout: Duration) {
        self.set_state(WorkerState::Draining);
        self.queue.close();

        let waited = tokio::time::timeout(timeout, async {
            while self.in_flight.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        if waited.is_err() {
            self.alerts.publish(Alert::WorkerStopTimeout {
                event_type: self.event_type,
            });
        }
        self.set_state(WorkerState::Stopped);
    }

    pub fn cancel_operation(&self, operation_id: &str) {
        if let Some(ctx) = self.active.get(operation_id) {
            ctx.cancel.cancel();
        }
    }

    pub fn statistics(&self) -> WorkerStatistics {
        let processed = self.counters.events_processed.load(Ordering::Relaxed);
        let total_nanos = self.counters.total_processing_nanos.load(Ordering::Relaxed);
        let completed = processed + self.counters.events_failed.load(Ordering::Relaxed);
        let average = if completed > 0 {
            Duration::from_nanos(total_nanos / completed.max(1))
        } else {
            Duration::ZERO
        };
        WorkerStatistics {
            event_type: Some(self.event_type),
            events_processed: processed,
            events_failed: self.counters.events_failed.load(Ordering::Relaxed),
            events_cancelled: self.counters.events_cancelled.load(Ordering::Relaxed),
            average_processing: average,
            active_operations: self.active.len(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::types::{CancelToken, Outcome};
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl EventProcessor for AlwaysOk {
        async fn process(
            &self,
            event: IOEvent,
            _ctx: OperationContext,
            _cancel: CancelToken,
        ) -> crate::isolation::error::Result<Outcome> {
            Ok(Outcome::new(event.data_len() as u64))
        }
    }

    struct AlwaysPanics;

    #[async_trait]
    impl EventProcessor for AlwaysPanics {
        async fn process(
            &self,
            _event: IOEvent,
            _ctx: OperationContext,
            _cancel: CancelToken,
        ) -> crate::isolation::error::Result<Outcome> {
            panic!("boom");
        }
    }

    fn test_worker(processor: Arc<dyn EventProcessor>) -> Arc<Worker> {
        let queue = Arc::new(EventQueue::new(16));
        let resource_pool = ResourcePool::new(10, 64 * 1024, Duration::from_secs(300));
        let (recovery, _global_rx) = ErrorRecovery::new(
            3,
            Duration::from_millis(10),
            Duration::from_secs(30),
            3,
            1000,
        );
        Arc::new(Worker::new(
            EventType::FileWrite,
            queue,
            resource_pool,
            Arc::new(recovery),
            processor,
            AlertBus::new(16),
            32,
            5,
            Duration::from_secs(5),
            64 * 1024,
        ))
    }

    #[tokio::test]
    async fn processing_a_successful_event_updates_counters_and_clears_active() {
        let worker = test_worker(Arc::new(AlwaysOk));
        let event = IOEvent::new("op-1", EventType::FileWrite, Priority::Medium)
            .with_data(vec![1, 2, 3]);
        worker.process_one(event).await;

        let stats = worker.statistics();
        assert_eq!(stats.events_processed, 1);
        assert_eq!(stats.events_failed, 0);
        assert_eq!(stats.active_operations, 0);
    }

    #[tokio::test]
    async fn a_cancelled_event_is_dropped_silently_at_dequeue() {
        let worker = test_worker(Arc::new(AlwaysOk));
        let event = IOEvent::new("op-2", EventType::FileWrite, Priority::Medium);
        event.cancel.cancel();
        worker.process_one(event).await;

        let stats = worker.statistics();
        assert_eq!(stats.events_processed, 0);
        assert_eq!(stats.events_failed, 0);
        assert_eq!(stats.events_cancelled, 0);
    }

    #[tokio::test]
    async fn a_processor_panic_is_isolated_and_recorded_as_failed() {
        let worker = test_worker(Arc::new(AlwaysPanics));
        let event = IOEvent::new("op-3", EventType::FileWrite, Priority::Low);
        worker.process_one(event).await;

        let stats = worker.statistics();
        assert_eq!(stats.events_processed, 0);
        assert_eq!(stats.events_failed, 1);
    }

    #[tokio::test]
    async fn stop_moves_to_stopped_once_in_flight_work_drains() {
        let worker = test_worker(Arc::new(AlwaysOk));
        assert_eq!(worker.state(), WorkerState::Starting);
        worker.stop(Duration::from_millis(200)).await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}

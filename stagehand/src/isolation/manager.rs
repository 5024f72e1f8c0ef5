//! IsolationManager: the engine's public API. Routes events to the
//! per-type queue/worker pair, owns the resource pool, recovery layer,
//! dedicated thread pool, alert bus, and progress tracker, and guarantees
//! that no entry point ever performs blocking I/O on the caller's thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use super::config::IsolationConfig;
use super::error::{RejectReason, Result};
use super::processor::{EventProcessor, PathValidator};
use super::progress::{ProgressSnapshot, ProgressTracker};
use super::queue::{EventQueue, PushResult};
use super::recovery::{ErrorRecovery, RetryTicket};
use super::resource_pool::ResourcePool;
use super::stats::{Alert, AlertBus, IsolationStatistics};
use super::thread_pool::DedicatedThreadPool;
use super::types::{EventType, IOEvent};
use super::worker::Worker;

/// Outcome of [`IsolationManager::submit`].
#[derive(Clone, Debug)]
pub enum AcceptResult {
    Accepted { operation_id: String },
    Rejected(RejectReason),
    /// A `FileRead`/`FileWrite` event whose path the injected
    /// [`PathValidator`] rejected before dispatch.
    ValidationFailed(String),
    /// No processor was registered for this event's type at construction.
    Unroutable(EventType),
}

/// Per-item report for [`IsolationManager::submit_batch`]. Each item is
/// admitted independently (one queue push is already atomic); this just
/// aggregates the individual [`AcceptResult`]s into one report rather than
/// promising all-or-nothing admission for the whole batch.
#[derive(Clone, Debug, Default)]
pub struct BatchAcceptResult {
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, AcceptResult)>,
}

/// Public entry point. One [`EventQueue`] and [`Worker`] per registered
/// [`EventType`] — a static `EventType -> (Queue, Worker, Processor)`
/// dispatch table built once at construction from the caller-supplied
/// processor map rather than grown dynamically.
pub struct IsolationManager {
    config: IsolationConfig,
    queues: HashMap<EventType, Arc<EventQueue>>,
    workers: HashMap<EventType, Arc<Worker>>,
    resource_pool: ResourcePool,
    recovery: Arc<ErrorRecovery>,
    thread_pool: Arc<DedicatedThreadPool>,
    alerts: AlertBus,
    progress_tracker: Arc<ProgressTracker>,
    path_validator: Arc<dyn PathValidator>,
    global_retry_rx: Mutex<Option<mpsc::UnboundedReceiver<RetryTicket>>>,
    worker_retry_txs: HashMap<EventType, mpsc::UnboundedSender<RetryTicket>>,
    worker_retry_rxs: Mutex<Option<HashMap<EventType, mpsc::UnboundedReceiver<RetryTicket>>>>,
    background_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IsolationManager {
    /// Builds every queue/worker pair named by `processors`. Event types
    /// with no registered processor are simply never routable — `submit`
    /// returns [`AcceptResult::Unroutable`] for them rather than silently
    /// dropping work.
    pub fn new(
        config: IsolationConfig,
        path_validator: Arc<dyn PathValidator>,
        processors: HashMap<EventType, Arc<dyn EventProcessor>>,
    ) -> Self {
        let (recovery, global_retry_rx) = ErrorRecovery::new(
            config.max_recovery_attempts,
            config.recovery_delay,
            config.circuit_breaker_cooldown,
            config.consecutive_failures_to_open,
            config.error_history_cap,
        );
        let recovery = Arc::new(recovery);
        let resource_pool = ResourcePool::new(
            config.max_pooled_buffers_per_class,
            config.max_buffer_size,
            config.buffer_idle_expire,
        );
        let thread_pool = Arc::new(DedicatedThreadPool::start(
            config.dedicated_pool_size,
            config.dedicated_pool_size * 4,
        ));
        let alerts = AlertBus::new(1024);

        let mut queues = HashMap::with_capacity(processors.len());
        let mut workers = HashMap::with_capacity(processors.len());
        let mut worker_retry_txs = HashMap::with_capacity(processors.len());
        let mut worker_retry_rxs = HashMap::with_capacity(processors.len());

        for (event_type, processor) in processors {
            let queue = Arc::new(EventQueue::new(config.queue_capacity));
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = Arc::new(Worker::new(
                event_type,
                Arc::clone(&queue),
                resource_pool.clone(),
                Arc::clone(&recovery),
                processor,
                alerts.clone(),
                config.batch_max,
                config.worker_parallel_sub_batch,
                config.operation_deadline,
                config.max_buffer_size,
            ));
            queues.insert(event_type, queue);
            workers.insert(event_type, worker);
            worker_retry_txs.insert(event_type, tx);
            worker_retry_rxs.insert(event_type, rx);
        }

        let progress_tracker = Arc::new(ProgressTracker::new(
            workers.values().cloned().collect(),
            config.progress_interval,
        ));

        Self {
            config,
            queues,
            workers,
            resource_pool,
            recovery,
            thread_pool,
            alerts,
            progress_tracker,
            path_validator,
            global_retry_rx: Mutex::new(Some(global_retry_rx)),
            worker_retry_txs,
            worker_retry_rxs: Mutex::new(Some(worker_retry_rxs)),
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Spawns each worker's run loop, the retry-ticket distributor, the
    /// resource pool and recovery-state sweepers, and the progress tracker.
    /// Idempotent per-component: calling twice does not double-spawn a
    /// worker loop (the per-worker retry receiver is consumed on first call).
    pub fn start(&self) {
        let mut tasks = self.background_tasks.lock().unwrap();

        if let Some(mut rxs) = self.worker_retry_rxs.lock().unwrap().take() {
            for (event_type, worker) in &self.workers {
                if let Some(rx) = rxs.remove(event_type) {
                    let worker = Arc::clone(worker);
                    tasks.push(tokio::spawn(async move {
                        worker.run(rx).await;
                    }));
                }
            }
        }

        // The recovery layer owns exactly one retry channel; route each
        // ticket to the worker that owns the operation by its recorded
        // event type so re-invocation happens on the right worker.
        if let Some(mut global_rx) = self.global_retry_rx.lock().unwrap().take() {
            let recovery = Arc::clone(&self.recovery);
            let worker_retry_txs = self.worker_retry_txs.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(ticket) = global_rx.recv().await {
                    if let Some(event_type) = recovery.event_type_for(&ticket.operation_id) {
                        if let Some(tx) = worker_retry_txs.get(&event_type) {
                            let _ = tx.send(ticket);
                        }
                    }
                }
            }));
        }

        {
            let pool = self.resource_pool.clone();
            let interval = self.config.cleanup_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    pool.cleanup_expired();
                }
            }));
        }

        {
            // No dedicated tunable names this cadence; it piggybacks on
            // the same sweep interval as the resource pool.
            let recovery = Arc::clone(&self.recovery);
            let interval = self.config.cleanup_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    recovery.cleanup();
                }
            }));
        }

        self.progress_tracker.start();
        tracing::info!(workers = self.workers.len(), "isolation manager started");
    }

    /// Routes `event` to the queue for its type. Never blocks on I/O:
    /// validation is a synchronous path check (for file events) and the
    /// queue push is a non-blocking, capacity-bounded insert.
    pub fn submit(&self, event: IOEvent) -> AcceptResult {
        if let Some(reason) = self.reject_on_validation(&event) {
            tracing::warn!(operation_id = %event.id, %reason, "submission rejected by path validator");
            return AcceptResult::ValidationFailed(reason);
        }

        let Some(queue) = self.queues.get(&event.event_type) else {
            tracing::warn!(event_type = %event.event_type, "no worker registered for event type");
            return AcceptResult::Unroutable(event.event_type);
        };

        let operation_id = event.id.clone();
        match queue.push(event) {
            PushResult::Accepted => {
                tracing::debug!(%operation_id, "event accepted");
                AcceptResult::Accepted { operation_id }
            }
            PushResult::Rejected(reason) => {
                tracing::warn!(%operation_id, %reason, "event rejected at submission");
                AcceptResult::Rejected(reason)
            }
        }
    }

    fn reject_on_validation(&self, event: &IOEvent) -> Option<String> {
        if !event.event_type.is_file_event() {
            return None;
        }
        let path = event.file_path.as_deref()?;
        let validation = match event.event_type {
            EventType::FileRead => self.path_validator.validate_read(path),
            EventType::FileWrite => self.path_validator.validate_write(path),
            _ => unreachable!("is_file_event only admits FileRead/FileWrite"),
        };
        if validation.ok {
            None
        } else {
            Some(validation.reason.unwrap_or_else(|| "path rejected".to_string()))
        }
    }

    /// Admits each event independently; a failure partway through does not
    /// roll back the events already accepted.
    pub fn submit_batch(&self, events: Vec<IOEvent>) -> BatchAcceptResult {
        let mut result = BatchAcceptResult::default();
        for event in events {
            let id = event.id.clone();
            match self.submit(event) {
                AcceptResult::Accepted { operation_id } => result.accepted.push(operation_id),
                other => result.rejected.push((id, other)),
            }
        }
        result
    }

    /// Runs `f` on the dedicated thread pool, suspending only the awaiting
    /// task (never a producer's render-loop thread) until it completes.
    pub async fn execute_on_io_pool<T, F>(&self, name: impl Into<String>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.thread_pool.execute(name, f).await
    }

    /// Trips cancellation for `operation_id` on whichever worker currently
    /// holds it, and drops it from progress tracking.
    pub fn cancel(&self, operation_id: &str) {
        for worker in self.workers.values() {
            worker.cancel_operation(operation_id);
        }
        self.progress_tracker.forget(operation_id);
        tracing::debug!(%operation_id, "cancellation requested");
    }

    pub fn progress(&self, operation_id: &str) -> Option<ProgressSnapshot> {
        self.progress_tracker.progress(operation_id)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.progress_tracker.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn statistics(&self) -> IsolationStatistics {
        IsolationStatistics {
            workers: self.workers.values().map(|w| w.statistics()).collect(),
            pool: self.resource_pool.snapshot(),
            recovery: self.recovery.statistics(),
            thread_pool: self.thread_pool.statistics(),
        }
    }

    /// Pauses every queue, lets in-flight work drain for up to `timeout`
    /// per worker, tears down background sweepers, and stops the dedicated
    /// pool. After this returns, no worker executes further processor code.
    pub async fn stop(&self, timeout: Duration) {
        for queue in self.queues.values() {
            queue.close();
        }

        let stops = self.workers.values().map(|w| {
            let w = Arc::clone(w);
            async move { w.stop(timeout).await }
        });
        futures::future::join_all(stops).await;

        for task in self.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.progress_tracker.stop();
        self.thread_pool.stop();
        tracing::info!("isolation manager stopped");
    }
}

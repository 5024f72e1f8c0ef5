//! DedicatedThreadPool: a fixed set of OS threads draining a bounded
//! task channel, used for heavy (bulk file/network) work so a `Worker`'s
//! own async task never blocks on syscalls.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};

use super::error::IsolationError;

#[derive(Debug, Default)]
struct PoolCounters {
    tasks_submitted: AtomicUsize,
    tasks_completed: AtomicUsize,
}

/// One unit of work dispatched to the pool.
struct ThreadPoolTask {
    name: String,
    job: Box<dyn FnOnce() + Send + 'static>,
}

#[derive(Clone, Debug, Default)]
pub struct ThreadPoolStatistics {
    pub active_threads: usize,
    pub max_threads: usize,
    pub tasks_submitted: usize,
    pub tasks_completed: usize,
}

/// Fixed-size OS thread pool, default `max(4, 2 * logical_cpu)`.
pub struct DedicatedThreadPool {
    sender: Mutex<Option<mpsc::Sender<ThreadPoolTask>>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    max_threads: usize,
    counters: Arc<PoolCounters>,
}

impl DedicatedThreadPool {
    pub fn start(size: usize, channel_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<ThreadPoolTask>(channel_capacity);
        let rx = Arc::new(std::sync::Mutex::new(rx));
        let counters = Arc::new(PoolCounters::default());

        let mut handles = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = Arc::clone(&rx);
            let counters = Arc::clone(&counters);
            let handle = std::thread::Builder::new()
                .name(format!("isolation-io-{idx}"))
                .spawn(move || {
                    loop {
                        let task = {
                            let mut guard = rx.lock().unwrap();
                            guard.blocking_recv()
                        };
                        match task {
                            Some(task) => {
                                tracing::trace!(task = %task.name, "dedicated pool running task");
                                (task.job)();
                                counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
                            }
                            None => break,
                        }
                    }
                })
                .expect("failed to spawn dedicated pool thread");
            handles.push(handle);
        }

        Self {
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            max_threads: size,
            counters,
        }
    }

    /// Runs `f` on a dedicated pool thread, suspending the caller if the
    /// pool is saturated, and completes with its result.
    pub async fn execute<T, F>(&self, name: impl Into<String>, f: F) -> Result<T, IsolationError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| IsolationError::Internal("dedicated thread pool is shut down".into()))?;

        let (result_tx, result_rx) = oneshot::channel();
        self.counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        let task = ThreadPoolTask {
            name: name.into(),
            job: Box::new(move || {
                let result = f();
                let _ = result_tx.send(result);
            }),
        };
        sender
            .send(task)
            .await
            .map_err(|_| IsolationError::Internal("dedicated thread pool is shut down".into()))?;
        result_rx
            .await
            .map_err(|_| IsolationError::Internal("dedicated pool task dropped its result".into()))
    }

    pub fn statistics(&self) -> ThreadPoolStatistics {
        ThreadPoolStatistics {
            active_threads: self.handles.lock().unwrap().len(),
            max_threads: self.max_threads,
            tasks_submitted: self.counters.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.counters.tasks_completed.load(Ordering::Relaxed),
        }
    }

    /// Cooperative shutdown: drops the sender so the channel closes, then
    /// each thread finishes its current task, observes `None`, and exits;
    /// this joins all of them. Idempotent — a second call finds the sender
    /// already gone and just re-joins (trivially, since `handles` is empty).
    pub fn stop(&self) {
        self.sender.lock().unwrap().take();

        let handles = {
            let mut guard = self.handles.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_closures_and_returns_results() {
        let pool = DedicatedThreadPool::start(2, 8);
        let result = pool.execute("add", || 2 + 2).await.unwrap();
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn runs_many_tasks_across_fixed_threads() {
        let pool = DedicatedThreadPool::start(4, 64);
        let mut handles = Vec::new();
        for i in 0..32 {
            handles.push(pool.execute("task", move || i * 2));
        }
        let results: Vec<i32> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results.iter().sum::<i32>(), (0..32).map(|i| i * 2).sum());
    }

    #[tokio::test]
    async fn stop_closes_the_channel_and_joins_every_thread() {
        let pool = DedicatedThreadPool::start(2, 8);
        pool.execute("warmup", || ()).await.unwrap();
        pool.stop();
        assert_eq!(pool.statistics().active_threads, 0);
        assert!(pool.execute("after-stop", || ()).await.is_err());
    }
}

//! Statistics & Alerts: a one-way, in-process event bus for typed
//! alerts, plus the aggregate `IsolationStatistics` view.
//!
//! A closed enum of lifecycle events plus a publish-only bus, synchronous
//! and non-blocking with a drop-on-slow-subscriber policy. Workers and the
//! recovery layer only ever publish; nothing downstream holds a
//! back-pointer into them.

use tokio::sync::broadcast;

use super::recovery::RecoveryStatistics;
use super::resource_pool::PoolStatisticsSnapshot;
use super::thread_pool::ThreadPoolStatistics;
use super::types::EventType;
use super::worker::WorkerStatistics;

/// Typed alerts emitted by workers, the recovery layer, and the resource pool.
#[derive(Clone, Debug)]
pub enum Alert {
    WorkerStarted {
        event_type: EventType,
    },
    WorkerError {
        event_type: EventType,
        message: String,
    },
    EventProcessingFailed {
        event_type: EventType,
        operation_id: String,
        message: String,
    },
    BatchProcessingFailed {
        event_type: EventType,
        message: String,
    },
    WorkerStopTimeout {
        event_type: EventType,
    },
    WorkerDisposeError {
        event_type: EventType,
        message: String,
    },
    ResourcePoolCleanupError {
        message: String,
    },
    CircuitBreakerOpened {
        event_type: EventType,
        operation_id: String,
    },
    CircuitBreakerClosed {
        event_type: EventType,
        operation_id: String,
    },
}

/// One-way, weak-subscription, non-blocking alert bus.
///
/// `tokio::sync::broadcast` already drops lagging receivers' missed
/// messages rather than queuing unboundedly: a receiver that falls behind
/// observes `RecvError::Lagged` and simply resumes from the next message
/// instead of blocking the publisher.
#[derive(Clone)]
pub struct AlertBus {
    sender: broadcast::Sender<Alert>,
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }

    /// Non-blocking publish. Logs once (via `tracing::warn!`) if there are
    /// no subscribers at all; never retries or suspends the caller.
    pub fn publish(&self, alert: Alert) {
        if self.sender.send(alert).is_err() {
            tracing::trace!("alert published with no active subscribers");
        }
    }
}

/// Aggregate, derived statistics surface — never a source of truth.
#[derive(Clone, Debug, Default)]
pub struct IsolationStatistics {
    pub workers: Vec<WorkerStatistics>,
    pub pool: PoolStatisticsSnapshot,
    pub recovery: RecoveryStatistics,
    pub thread_pool: ThreadPoolStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_panic_or_block() {
        let bus = AlertBus::new(16);
        bus.publish(Alert::WorkerStarted {
            event_type: EventType::FileRead,
        });
    }

    #[test]
    fn a_subscriber_receives_a_published_alert() {
        let bus = AlertBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Alert::CircuitBreakerOpened {
            event_type: EventType::NetworkIO,
            operation_id: "op-1".to_string(),
        });
        let received = rx.try_recv().expect("alert should be immediately available");
        assert!(matches!(
            received,
            Alert::CircuitBreakerOpened { operation_id, .. } if operation_id == "op-1"
        ));
    }

    #[test]
    fn default_isolation_statistics_has_no_workers() {
        let stats = IsolationStatistics::default();
        assert!(stats.workers.is_empty());
        assert_eq!(stats.pool.in_use, 0);
    }
}

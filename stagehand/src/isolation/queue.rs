//! EventQueue: a bounded, multi-priority FIFO for one event type.
//!
//! A concrete in-process structure, not a durable, lease-based queue: there
//! is no persistence or replay, only priority-descending,
//! FIFO-within-priority delivery to one worker per event type.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use super::error::RejectReason;
use super::types::{IOEvent, Priority};

struct Lanes {
    critical: VecDeque<IOEvent>,
    high: VecDeque<IOEvent>,
    medium: VecDeque<IOEvent>,
    low: VecDeque<IOEvent>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            critical: VecDeque::new(),
            high: VecDeque::new(),
            medium: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<IOEvent> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }

    fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.medium.len() + self.low.len()
    }

    /// Drain up to `max_n` events, priority-descending, FIFO within a
    /// priority. Never interleaves a single priority's items out of order.
    fn drain_batch(&mut self, max_n: usize) -> Vec<IOEvent> {
        let mut out = Vec::with_capacity(max_n.min(self.len()));
        for lane in [
            &mut self.critical,
            &mut self.high,
            &mut self.medium,
            &mut self.low,
        ] {
            while out.len() < max_n {
                match lane.pop_front() {
                    Some(event) => out.push(event),
                    None => break,
                }
            }
            if out.len() >= max_n {
                break;
            }
        }
        out
    }
}

/// Result of [`EventQueue::push`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PushResult {
    Accepted,
    Rejected(RejectReason),
}

/// Bounded, multi-priority FIFO for a single [`super::types::EventType`].
pub struct EventQueue {
    lanes: Mutex<Lanes>,
    len: AtomicUsize,
    capacity: usize,
    is_processing: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::new()),
            len: AtomicUsize::new(0),
            capacity,
            is_processing: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Non-blocking. Rejects with [`RejectReason::NotProcessing`] once the
    /// queue has been permanently [`EventQueue::close`]d at shutdown, or
    /// with [`RejectReason::Full`] at capacity. A merely [`EventQueue::pause`]d
    /// queue still accepts pushes while space remains — pausing stops
    /// dequeuing, not admission; only `close` is terminal.
    pub fn push(&self, event: IOEvent) -> PushResult {
        if self.closed.load(Ordering::Acquire) {
            return PushResult::Rejected(RejectReason::NotProcessing);
        }
        if self.len.load(Ordering::Acquire) >= self.capacity {
            return PushResult::Rejected(RejectReason::Full);
        }
        {
            let mut lanes = self.lanes.lock().unwrap();
            // Re-check under the lock: capacity may have been consumed by a
            // racing pusher between the optimistic check above and this point.
            if lanes.len() >= self.capacity {
                return PushResult::Rejected(RejectReason::Full);
            }
            let priority = event.priority;
            lanes.lane_mut(priority).push_back(event);
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
        PushResult::Accepted
    }

    /// Suspends until at least one event is available or `timeout` elapses,
    /// then greedily drains up to `max_n` in priority order. Returns empty
    /// on timeout, and empty (without draining) while paused.
    pub async fn take_batch(&self, max_n: usize, timeout: Duration) -> Vec<IOEvent> {
        if !self.is_processing.load(Ordering::Acquire) {
            return Vec::new();
        }

        if self.len.load(Ordering::Acquire) == 0 {
            let notified = self.notify.notified();
            let _ = tokio::time::timeout(timeout, notified).await;
        }

        if !self.is_processing.load(Ordering::Acquire) {
            return Vec::new();
        }

        let batch = {
            let mut lanes = self.lanes.lock().unwrap();
            lanes.drain_batch(max_n)
        };
        self.len.fetch_sub(batch.len(), Ordering::AcqRel);
        batch
    }

    pub fn pause(&self) {
        self.is_processing.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn resume(&self) {
        self.is_processing.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Permanently stops admission and dequeuing, as happens when the
    /// engine drains this queue at shutdown. Unlike [`EventQueue::pause`],
    /// this cannot be undone.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.is_processing.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::EventType;

    fn event(id: &str, priority: Priority) -> IOEvent {
        IOEvent::new(id, EventType::FileWrite, priority)
    }

    #[test]
    fn push_rejects_when_full() {
        let q = EventQueue::new(1);
        assert_eq!(q.push(event("a", Priority::Low)), PushResult::Accepted);
        assert_eq!(
            q.push(event("b", Priority::Low)),
            PushResult::Rejected(RejectReason::Full)
        );
    }

    #[test]
    fn push_accepts_while_paused_if_space_remains() {
        let q = EventQueue::new(4);
        q.pause();
        assert_eq!(q.push(event("a", Priority::Low)), PushResult::Accepted);
    }

    #[test]
    fn push_rejects_after_close_even_with_space() {
        let q = EventQueue::new(4);
        q.close();
        assert_eq!(
            q.push(event("a", Priority::Low)),
            PushResult::Rejected(RejectReason::NotProcessing)
        );
    }

    #[tokio::test]
    async fn take_batch_orders_by_priority_then_fifo() {
        let q = EventQueue::new(8);
        q.push(event("a", Priority::Medium));
        q.push(event("b", Priority::High));
        q.push(event("c", Priority::Medium));

        let batch = q.take_batch(8, Duration::from_millis(50)).await;
        let ids: Vec<_> = batch.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn take_batch_returns_empty_on_timeout() {
        let q = EventQueue::new(8);
        let batch = q.take_batch(8, Duration::from_millis(10)).await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn len_never_exceeds_capacity() {
        let q = EventQueue::new(2);
        for i in 0..5 {
            q.push(event(&i.to_string(), Priority::Low));
            assert!(q.len() <= q.capacity());
        }
    }
}

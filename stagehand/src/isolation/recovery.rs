//! ErrorRecovery: per-operation attempt tracking, exponential backoff,
//! and a circuit breaker, backed by an append-only error log.
//!
//! Retries re-invoke the original `EventProcessor` once an operation's
//! backoff elapses — it never simulates an outcome. This is an in-process,
//! non-durable retry ledger plus explicit circuit breaker states; there is
//! no durable queue here to lease work from.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::error::IsolationError;
use super::types::{EventType, Priority};

/// Outcome of [`ErrorRecovery::attempt_recovery`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryOutcome {
    RecoveryQueued { attempt: u32 },
    CircuitBreakerOpen,
    MaxAttemptsReached,
}

/// Append-only error log entry. Oldest entries are evicted once the ring
/// buffer exceeds `error_history_cap`.
#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub operation_id: String,
    pub exception_kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub priority: Priority,
}

/// Per-`operation_id` recovery bookkeeping.
#[derive(Clone, Debug)]
pub struct RecoveryState {
    pub event_type: EventType,
    pub priority: Priority,
    pub creation_time: Instant,
    pub attempt_count: u32,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub last_error_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
    pub circuit_breaker_open: bool,
    pub circuit_breaker_opened_at: Option<Instant>,
}

impl RecoveryState {
    fn new(event_type: EventType, priority: Priority) -> Self {
        Self {
            event_type,
            priority,
            creation_time: Instant::now(),
            attempt_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            last_error_time: None,
            last_success_time: None,
            circuit_breaker_open: false,
            circuit_breaker_opened_at: None,
        }
    }
}

/// Derived, not source-of-truth, counters.
#[derive(Clone, Debug, Default)]
pub struct RecoveryStatistics {
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub circuit_breaker_trips: u64,
    /// `total_successes / (total_successes + total_failures)`, `0.0` when
    /// neither has happened yet.
    pub success_rate: f64,
    /// `ErrorRecord::exception_kind` tallies across the full error log
    /// lifetime, not just what's still in the ring buffer.
    pub by_error_kind: HashMap<String, u64>,
    pub active_states: usize,
    pub open_breakers: usize,
}

/// A retry the sweeper has decided is ready; the owning worker re-invokes
/// the processor for `operation_id` on receipt.
#[derive(Clone, Debug)]
pub struct RetryTicket {
    pub operation_id: String,
    pub attempt: u32,
}

/// Decide whether `error` is retryable for this `event_type`/`priority` combination.
pub fn can_retry(error: &IsolationError, event_type: EventType, priority: Priority) -> bool {
    if event_type == EventType::UserInput || priority == Priority::Critical {
        return false;
    }
    match error {
        IsolationError::TransientIo(_) | IsolationError::Timeout(_) => true,
        IsolationError::PermissionDenied(_) => priority == Priority::Low,
        _ => false,
    }
}

struct Counters {
    total_attempts: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    circuit_breaker_trips: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            total_attempts: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
        }
    }
}

fn exception_kind_of(error: &IsolationError) -> String {
    format!("{error:?}")
        .split('(')
        .next()
        .unwrap_or("Unknown")
        .to_string()
}

/// Retry policy, attempt tracking, circuit breaker.
pub struct ErrorRecovery {
    states: DashMap<String, Mutex<RecoveryState>>,
    error_log: Mutex<VecDeque<ErrorRecord>>,
    error_history_cap: usize,
    max_attempts: u32,
    recovery_delay: Duration,
    circuit_breaker_cooldown: Duration,
    consecutive_failures_to_open: u32,
    counters: Counters,
    error_kind_counts: DashMap<String, AtomicU64>,
    retry_tx: mpsc::UnboundedSender<RetryTicket>,
}

impl ErrorRecovery {
    /// Returns the recovery layer plus the receiving half of the retry
    /// channel; the owning `IsolationManager` hands the receiver to each
    /// `Worker` so sweeper-scheduled retries re-invoke the right processor.
    pub fn new(
        max_attempts: u32,
        recovery_delay: Duration,
        circuit_breaker_cooldown: Duration,
        consecutive_failures_to_open: u32,
        error_history_cap: usize,
    ) -> (Self, mpsc::UnboundedReceiver<RetryTicket>) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        (
            Self {
                states: DashMap::new(),
                error_log: Mutex::new(VecDeque::new()),
                error_history_cap,
                max_attempts,
                recovery_delay,
                circuit_breaker_cooldown,
                consecutive_failures_to_open,
                counters: Counters::default(),
                error_kind_counts: DashMap::new(),
                retry_tx,
            },
            retry_rx,
        )
    }

    fn record_error(
        &self,
        operation_id: &str,
        error: &IsolationError,
        event_type: EventType,
        priority: Priority,
    ) {
        let kind = exception_kind_of(error);
        self.error_kind_counts
            .entry(kind.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let mut log = self.error_log.lock().unwrap();
        if log.len() >= self.error_history_cap {
            log.pop_front();
        }
        log.push_back(ErrorRecord {
            operation_id: operation_id.to_string(),
            exception_kind: kind,
            message: error.to_string(),
            timestamp: Utc::now(),
            event_type,
            priority,
        });
    }

    /// Runs the full retry/backoff/circuit-breaker decision tree for one failure.
    pub fn attempt_recovery(
        &self,
        operation_id: &str,
        error: &IsolationError,
        event_type: EventType,
        priority: Priority,
    ) -> RecoveryOutcome {
        self.record_error(operation_id, error, event_type, priority);
        self.counters.total_failures.fetch_add(1, Ordering::Relaxed);

        let entry = self
            .states
            .entry(operation_id.to_string())
            .or_insert_with(|| Mutex::new(RecoveryState::new(event_type, priority)));
        let mut state = entry.lock().unwrap();

        state.error_count += 1;
        state.consecutive_failures += 1;
        state.last_error_time = Some(Instant::now());

        if !can_retry(error, event_type, priority) {
            state.circuit_breaker_open = true;
            state.circuit_breaker_opened_at.get_or_insert(Instant::now());
            self.counters
                .circuit_breaker_trips
                .fetch_add(1, Ordering::Relaxed);
            return RecoveryOutcome::MaxAttemptsReached;
        }

        if state.circuit_breaker_open {
            let opened_at = state.circuit_breaker_opened_at.unwrap_or_else(Instant::now);
            if opened_at.elapsed() < self.circuit_breaker_cooldown {
                return RecoveryOutcome::CircuitBreakerOpen;
            }
            // Cooldown elapsed: half-open, allow exactly one attempt.
            state.circuit_breaker_open = false;
            state.circuit_breaker_opened_at = None;
            state.attempt_count = 0;
        }

        // `consecutive_failures_to_open` and `max_attempts` coincide by
        // default (both 3); either threshold trips the breaker here rather
        // than waiting on a separate sweeper pass, since retry scheduling
        // below already plays the sweeper's role of re-invoking on backoff.
        if state.attempt_count >= self.max_attempts
            || state.consecutive_failures >= self.consecutive_failures_to_open
        {
            state.circuit_breaker_open = true;
            state.circuit_breaker_opened_at.get_or_insert(Instant::now());
            self.counters
                .circuit_breaker_trips
                .fetch_add(1, Ordering::Relaxed);
            return RecoveryOutcome::MaxAttemptsReached;
        }

        state.attempt_count += 1;
        self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);

        let attempt = state.attempt_count;
        let backoff = self.recovery_delay + Duration::from_millis(100) * attempt;
        let tx = self.retry_tx.clone();
        let op_id = operation_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = tx.send(RetryTicket {
                operation_id: op_id,
                attempt,
            });
        });

        RecoveryOutcome::RecoveryQueued { attempt }
    }

    /// Records a success and, if it closed a previously open breaker,
    /// returns `true` so the caller can publish `CircuitBreakerClosed`.
    pub fn mark_successful(&self, operation_id: &str) -> bool {
        self.counters.total_successes.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.states.get(operation_id) {
            let mut state = entry.lock().unwrap();
            let was_open = state.circuit_breaker_open;
            state.last_success_time = Some(Instant::now());
            state.consecutive_failures = 0;
            state.circuit_breaker_open = false;
            state.circuit_breaker_opened_at = None;
            return was_open;
        }
        false
    }

    /// Drop states idle for more than an hour, or older than 24h overall.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.states.retain(|_, state| {
            let state = state.lock().unwrap();
            let idle = state
                .last_error_time
                .or(state.last_success_time)
                .map(|t| now.duration_since(t))
                .unwrap_or_else(|| now.duration_since(state.creation_time));
            idle < Duration::from_secs(3600) && now.duration_since(state.creation_time) < Duration::from_secs(24 * 3600)
        });
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let open_breakers = self
            .states
            .iter()
            .filter(|e| e.value().lock().unwrap().circuit_breaker_open)
            .count();
        let total_successes = self.counters.total_successes.load(Ordering::Relaxed);
        let total_failures = self.counters.total_failures.load(Ordering::Relaxed);
        let total_outcomes = total_successes + total_failures;
        let success_rate = if total_outcomes == 0 {
            0.0
        } else {
            total_successes as f64 / total_outcomes as f64
        };
        let by_error_kind = self
            .error_kind_counts
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        RecoveryStatistics {
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            total_successes,
            total_failures,
            circuit_breaker_trips: self.counters.circuit_breaker_trips.load(Ordering::Relaxed),
            success_rate,
            by_error_kind,
            active_states: self.states.len(),
            open_breakers,
        }
    }

    /// Looks up the event type recorded for `operation_id`, so a retry
    /// distributor can route a [`RetryTicket`] from the single shared
    /// channel back to the worker that owns it.
    pub fn event_type_for(&self, operation_id: &str) -> Option<EventType> {
        self.states
            .get(operation_id)
            .map(|e| e.lock().unwrap().event_type)
    }

    pub fn is_breaker_open(&self, operation_id: &str) -> bool {
        self.states
            .get(operation_id)
            .is_some_and(|e| e.lock().unwrap().circuit_breaker_open)
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let log = self.error_log.lock().unwrap();
        log.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error() -> IsolationError {
        IsolationError::TransientIo("timeout".into())
    }

    #[tokio::test]
    async fn retries_until_max_attempts_then_opens_breaker() {
        let (recovery, _rx) = ErrorRecovery::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(50),
            3,
            1000,
        );
        let op = "op-1";
        let a1 = recovery.attempt_recovery(op, &error(), EventType::FileRead, Priority::Medium);
        assert_eq!(a1, RecoveryOutcome::RecoveryQueued { attempt: 1 });
        let a2 = recovery.attempt_recovery(op, &error(), EventType::FileRead, Priority::Medium);
        assert_eq!(a2, RecoveryOutcome::RecoveryQueued { attempt: 2 });
        let a3 = recovery.attempt_recovery(op, &error(), EventType::FileRead, Priority::Medium);
        // third consecutive failure opens the breaker per consecutive_failures_to_open=3
        assert_eq!(a3, RecoveryOutcome::MaxAttemptsReached);
        assert!(recovery.is_breaker_open(op));
    }

    #[tokio::test]
    async fn breaker_stays_open_during_cooldown() {
        let (recovery, _rx) = ErrorRecovery::new(
            10,
            Duration::from_millis(1),
            Duration::from_secs(30),
            1,
            1000,
        );
        let op = "op-2";
        let first = recovery.attempt_recovery(op, &error(), EventType::FileRead, Priority::Medium);
        assert_eq!(first, RecoveryOutcome::MaxAttemptsReached);
        let second =
            recovery.attempt_recovery(op, &error(), EventType::FileRead, Priority::Medium);
        assert_eq!(second, RecoveryOutcome::CircuitBreakerOpen);
    }

    #[tokio::test]
    async fn success_clears_consecutive_failures_and_closes_breaker() {
        let (recovery, _rx) = ErrorRecovery::new(
            10,
            Duration::from_millis(1),
            Duration::from_millis(10),
            1,
            1000,
        );
        let op = "op-3";
        recovery.attempt_recovery(op, &error(), EventType::FileRead, Priority::Medium);
        assert!(recovery.is_breaker_open(op));
        recovery.mark_successful(op);
        assert!(!recovery.is_breaker_open(op));
    }

    #[test]
    fn critical_priority_and_user_input_never_retry() {
        assert!(!can_retry(
            &IsolationError::TransientIo("x".into()),
            EventType::FileRead,
            Priority::Critical
        ));
        assert!(!can_retry(
            &IsolationError::TransientIo("x".into()),
            EventType::UserInput,
            Priority::Low
        ));
    }

    #[test]
    fn permission_denied_only_retries_for_low_priority() {
        let err = IsolationError::PermissionDenied("x".into());
        assert!(can_retry(&err, EventType::FileRead, Priority::Low));
        assert!(!can_retry(&err, EventType::FileRead, Priority::Medium));
    }

    #[test]
    fn statistics_report_zero_success_rate_before_any_outcome() {
        let (recovery, _rx) = ErrorRecovery::new(3, Duration::from_millis(1), Duration::from_millis(50), 3, 1000);
        assert_eq!(recovery.statistics().success_rate, 0.0);
    }

    #[tokio::test]
    async fn success_rate_reflects_the_mix_of_successes_and_failures() {
        let (recovery, _rx) = ErrorRecovery::new(
            10,
            Duration::from_millis(1),
            Duration::from_millis(10),
            10,
            1000,
        );
        recovery.attempt_recovery("op-a", &error(), EventType::FileRead, Priority::Medium);
        recovery.attempt_recovery("op-b", &error(), EventType::FileRead, Priority::Medium);
        recovery.mark_successful("op-a");

        let stats = recovery.statistics();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 2);
        assert!((stats.success_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn statistics_tally_errors_by_kind_across_operations() {
        let (recovery, _rx) = ErrorRecovery::new(
            10,
            Duration::from_millis(1),
            Duration::from_millis(10),
            10,
            1000,
        );
        recovery.attempt_recovery(
            "op-1",
            &IsolationError::TransientIo("x".into()),
            EventType::FileRead,
            Priority::Medium,
        );
        recovery.attempt_recovery(
            "op-2",
            &IsolationError::TransientIo("y".into()),
            EventType::FileRead,
            Priority::Medium,
        );
        recovery.attempt_recovery(
            "op-3",
            &IsolationError::PermissionDenied("z".into()),
            EventType::FileRead,
            Priority::Low,
        );

        let stats = recovery.statistics();
        assert_eq!(stats.by_error_kind.get("TransientIo").copied(), Some(2));
        assert_eq!(stats.by_error_kind.get("PermissionDenied").copied(), Some(1));
    }
}

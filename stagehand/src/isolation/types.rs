//! Core data model for the I/O isolation engine: events, priorities,
//! in-flight operation state, and cooperative cancellation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// The closed set of I/O workloads the engine isolates a producer from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    FileRead = 0,
    FileWrite = 1,
    AudioInput = 2,
    AudioOutput = 3,
    MidiInput = 4,
    MidiOutput = 5,
    NetworkIO = 6,
    UserInput = 7,
    CacheUpdate = 8,
    MetadataUpdate = 9,
    SpoutData = 10,
}

impl EventType {
    /// All variants, in a stable order used to build the manager's static
    /// `EventType -> (Queue, Worker, Processor)` dispatch table.
    pub const fn all_types() -> [EventType; 11] {
        [
            EventType::FileRead,
            EventType::FileWrite,
            EventType::AudioInput,
            EventType::AudioOutput,
            EventType::MidiInput,
            EventType::MidiOutput,
            EventType::NetworkIO,
            EventType::UserInput,
            EventType::CacheUpdate,
            EventType::MetadataUpdate,
            EventType::SpoutData,
        ]
    }

    /// Whether this event type touches the filesystem and therefore must be
    /// routed through the injected [`crate::isolation::processor::PathValidator`].
    pub const fn is_file_event(self) -> bool {
        matches!(self, EventType::FileRead | EventType::FileWrite)
    }

    /// Sub-batches of this event type are dispatched in parallel.
    pub const fn is_parallel(self) -> bool {
        matches!(
            self,
            EventType::FileRead
                | EventType::FileWrite
                | EventType::NetworkIO
                | EventType::SpoutData
                | EventType::CacheUpdate
                | EventType::MetadataUpdate
        )
    }

    /// Sub-batches of this event type are dispatched strictly sequentially.
    pub const fn is_sequential(self) -> bool {
        matches!(
            self,
            EventType::AudioInput
                | EventType::AudioOutput
                | EventType::MidiInput
                | EventType::MidiOutput
        )
    }

    /// Sub-batches of this event type are dispatched with bounded parallelism
    /// (at most two concurrent units).
    pub const fn bounded_parallelism(self) -> Option<usize> {
        match self {
            EventType::UserInput => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::FileRead => "FileRead",
            EventType::FileWrite => "FileWrite",
            EventType::AudioInput => "AudioInput",
            EventType::AudioOutput => "AudioOutput",
            EventType::MidiInput => "MidiInput",
            EventType::MidiOutput => "MidiOutput",
            EventType::NetworkIO => "NetworkIO",
            EventType::UserInput => "UserInput",
            EventType::CacheUpdate => "CacheUpdate",
            EventType::MetadataUpdate => "MetadataUpdate",
            EventType::SpoutData => "SpoutData",
        };
        f.write_str(s)
    }
}

/// Submission priority. Ordered `Critical > High > Medium > Low`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub const fn weight(self) -> u8 {
        self as u8
    }

    pub const fn all() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ]
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "Critical",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        };
        f.write_str(s)
    }
}

/// Cooperative cancellation signal shared between a producer, the engine,
/// and the `EventProcessor` currently handling an operation.
#[derive(Clone, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Trip the cancellation flag. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Suspends until cancelled. Processors that poll instead of await may
    /// simply call [`CancelToken::is_cancelled`] at their own safe points.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The unit of work submitted by a producer.
#[derive(Clone, Debug)]
pub struct IOEvent {
    pub id: String,
    pub event_type: EventType,
    pub priority: Priority,
    pub data: Option<Vec<u8>>,
    pub file_path: Option<PathBuf>,
    pub metadata: HashMap<String, String>,
    pub submitted_at: DateTime<Utc>,
    pub cancel: CancelToken,
}

impl IOEvent {
    pub fn new(id: impl Into<String>, event_type: EventType, priority: Priority) -> Self {
        Self {
            id: id.into(),
            event_type,
            priority,
            data: None,
            file_path: None,
            metadata: HashMap::new(),
            submitted_at: Utc::now(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_file_path(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn data_len(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Status of an [`OperationContext`] as surfaced to observability.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OperationStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot of in-flight work, owned exclusively by whichever worker is
/// currently processing it.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub operation_id: String,
    pub event_type: EventType,
    pub start_time: DateTime<Utc>,
    pub completed_time: Option<DateTime<Utc>>,
    pub bytes_processed: u64,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, String>,
    pub cancel: CancelToken,
    pub file_path: Option<PathBuf>,
}

impl OperationContext {
    pub fn start(event: &IOEvent) -> Self {
        Self {
            operation_id: event.id.clone(),
            event_type: event.event_type,
            start_time: Utc::now(),
            completed_time: None,
            bytes_processed: 0,
            success: None,
            error_message: None,
            metadata: event.metadata.clone(),
            cancel: event.cancel.clone(),
            file_path: event.file_path.clone(),
        }
    }

    pub fn mark_completed(&mut self, bytes_processed: u64) {
        self.completed_time = Some(Utc::now());
        self.bytes_processed = bytes_processed;
        self.success = Some(true);
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.completed_time = Some(Utc::now());
        self.success = Some(false);
        self.error_message = Some(message.into());
    }

    /// Marks a cancelled operation terminal without setting `success`, so
    /// [`OperationContext::status`] reports `Cancelled` rather than `Failed`
    /// and the cancellation is never counted as a processing failure.
    pub fn mark_cancelled(&mut self, message: impl Into<String>) {
        self.completed_time = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    pub fn status(&self) -> OperationStatus {
        if self.cancel.is_cancelled() && self.success.is_none() {
            return OperationStatus::Cancelled;
        }
        match self.success {
            None => OperationStatus::Processing,
            Some(true) => OperationStatus::Completed,
            Some(false) => OperationStatus::Failed,
        }
    }
}

/// Successful result of an [`crate::isolation::processor::EventProcessor`] invocation.
#[derive(Clone, Debug, Default)]
pub struct Outcome {
    pub bytes_processed: u64,
    pub metadata_additions: HashMap<String, String>,
}

impl Outcome {
    pub fn new(bytes_processed: u64) -> Self {
        Self {
            bytes_processed,
            metadata_additions: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent_and_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        // Already cancelled: `cancelled()` returns immediately instead of
        // waiting on a notification that will never arrive again.
        token.cancelled().await;
    }

    #[test]
    fn fresh_operation_context_is_processing() {
        let event = IOEvent::new("op-1", EventType::FileRead, Priority::Medium);
        let ctx = OperationContext::start(&event);
        assert_eq!(ctx.status(), OperationStatus::Processing);
        assert!(ctx.completed_time.is_none());
    }

    #[test]
    fn mark_completed_reports_as_completed_not_failed() {
        let event = IOEvent::new("op-2", EventType::FileRead, Priority::Medium);
        let mut ctx = OperationContext::start(&event);
        ctx.mark_completed(128);
        assert_eq!(ctx.status(), OperationStatus::Completed);
        assert_eq!(ctx.bytes_processed, 128);
    }

    #[test]
    fn mark_failed_reports_as_failed() {
        let event = IOEvent::new("op-3", EventType::FileRead, Priority::Medium);
        let mut ctx = OperationContext::start(&event);
        ctx.mark_failed("boom");
        assert_eq!(ctx.status(), OperationStatus::Failed);
        assert_eq!(ctx.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn mark_cancelled_reports_as_cancelled_not_failed() {
        let event = IOEvent::new("op-4", EventType::FileRead, Priority::Medium);
        event.cancel.cancel();
        let mut ctx = OperationContext::start(&event);
        ctx.mark_cancelled("stopped early");
        assert_eq!(ctx.status(), OperationStatus::Cancelled);
        assert!(ctx.success.is_none());
    }

    #[test]
    fn priority_ordering_matches_critical_high_medium_low() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn is_file_event_only_matches_file_read_and_write() {
        assert!(EventType::FileRead.is_file_event());
        assert!(EventType::FileWrite.is_file_event());
        assert!(!EventType::AudioInput.is_file_event());
    }
}

//! Error taxonomy for the isolation engine.
//!
//! Every fallible path returns a variant of [`IsolationError`] rather than a
//! string-tagged or reflected exception kind.

use thiserror::Error;

/// Reason a [`crate::isolation::queue::EventQueue::push`] rejected an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    /// The queue is at `capacity`.
    Full,
    /// The queue was permanently closed at shutdown.
    NotProcessing,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Full => f.write_str("queue full"),
            RejectReason::NotProcessing => f.write_str("queue not processing"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IsolationError {
    /// A path or argument was rejected before dispatch (not retryable).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Timeout, short read, socket reset: retryable subject to the recovery policy.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Permission was denied; retryable only for `Low` priority events.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation was cancelled, by the user or the hard deadline. Never retried.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The operation exceeded the hard per-operation deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An `EventProcessor` panicked; caught, recorded, and isolated from peers.
    #[error("processor panicked: {0}")]
    ProcessorPanic(String),

    /// A queue or the resource pool was full at submission time.
    #[error("capacity rejected: {0}")]
    CapacityRejected(RejectReason),

    /// The circuit breaker for this operation is open.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// The operation exhausted `max_attempts` without success.
    #[error("maximum recovery attempts reached")]
    MaxAttemptsReached,

    /// A caller-supplied argument was structurally invalid (e.g. a zero buffer size).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Anything else: an unexpected internal condition.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IsolationError>;

impl IsolationError {
    /// Whether this error kind is ever eligible for retry, independent of
    /// event priority. `can_retry` in [`crate::isolation::recovery::ErrorRecovery`]
    /// further narrows this by priority/event type.
    pub fn is_retryable_kind(&self) -> bool {
        matches!(
            self,
            IsolationError::TransientIo(_) | IsolationError::PermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_permission_errors_are_retryable_kinds() {
        assert!(IsolationError::TransientIo("x".into()).is_retryable_kind());
        assert!(IsolationError::PermissionDenied("x".into()).is_retryable_kind());
    }

    #[test]
    fn terminal_error_kinds_are_not_retryable() {
        assert!(!IsolationError::Validation("x".into()).is_retryable_kind());
        assert!(!IsolationError::Cancelled("x".into()).is_retryable_kind());
        assert!(!IsolationError::ProcessorPanic("x".into()).is_retryable_kind());
    }

    #[test]
    fn reject_reason_displays_a_human_readable_message() {
        assert_eq!(RejectReason::Full.to_string(), "queue full");
        assert_eq!(RejectReason::NotProcessing.to_string(), "queue not processing");
    }
}

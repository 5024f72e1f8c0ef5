//! `stagehand` — an I/O isolation engine that keeps a latency-sensitive
//! producer (a render/main loop that must never block) off the critical
//! path of file, audio, MIDI, network, and auxiliary cache/metadata I/O.
//!
//! Producers hand [`isolation::IOEvent`]s to an [`isolation::IsolationManager`];
//! the manager classifies, queues, dispatches, executes, monitors, retries,
//! and reports on that work from dedicated worker threads. See
//! `isolation::manager` for the entry point.

pub mod isolation;

pub use isolation::{
    AcceptResult, Alert, BatchAcceptResult, CancelToken, EventProcessor, EventQueue, EventType,
    IOEvent, IsolationConfig, IsolationError, IsolationManager, IsolationStatistics,
    OperationContext, OperationStatus, Outcome, PathValidator, PermissiveValidator, Priority,
    ProgressSnapshot, ProgressStatus, ProgressTracker, PushResult, RejectReason, ResourceBuffer,
    ResourceHandle, ResourcePool, Result, Validation, Worker, WorkerState, WorkerStatistics,
};

//! I/O isolation engine: the public module tree.
//!
//! Producers submit [`types::IOEvent`]s through [`manager::IsolationManager`];
//! the manager routes them to a per-[`types::EventType`] [`queue::EventQueue`],
//! a [`worker::Worker`] drains batches and dispatches to an injected
//! [`processor::EventProcessor`], buffers come from [`resource_pool::ResourcePool`],
//! failures go through [`recovery::ErrorRecovery`], and [`progress::ProgressTracker`]
//! plus [`stats::AlertBus`] give observers a non-blocking view of what is
//! happening. The manager also exposes its [`thread_pool::DedicatedThreadPool`]
//! directly via `execute_on_io_pool` for callers with their own heavy,
//! blocking work to run off the caller's thread.

pub mod config;
pub mod error;
pub mod manager;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod resource_pool;
pub mod stats;
pub mod thread_pool;
pub mod types;
pub mod worker;

pub use config::IsolationConfig;
pub use error::{IsolationError, RejectReason, Result};
pub use manager::{AcceptResult, BatchAcceptResult, IsolationManager};
pub use processor::{EventProcessor, PathValidator, PermissiveValidator, Validation};
pub use progress::{ProgressSnapshot, ProgressStatus, ProgressTracker};
pub use queue::{EventQueue, PushResult};
pub use recovery::{ErrorRecord, ErrorRecovery, RecoveryOutcome, RecoveryStatistics};
pub use resource_pool::{ResourceBuffer, ResourceHandle, ResourcePool, ceil_pow2};
pub use stats::{Alert, AlertBus, IsolationStatistics};
pub use thread_pool::{DedicatedThreadPool, ThreadPoolStatistics};
pub use types::{
    CancelToken, EventType, IOEvent, OperationContext, OperationStatus, Outcome, Priority,
};
pub use worker::{Worker, WorkerState, WorkerStatistics};

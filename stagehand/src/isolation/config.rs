//! Tunables for the isolation engine.
//!
//! The engine never loads this from disk or environment itself — an
//! embedding application sources it however it likes (env, file, CLI) and
//! hands over a constructed [`IsolationConfig`], matching the Purpose &
//! Scope's exclusion of "CLI, configuration loading" from the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Bounded capacity of each per-event-type queue.
    pub queue_capacity: usize,
    /// Maximum number of events drained by one `take_batch` call.
    pub batch_max: usize,
    /// Fixed sub-batch size used when splitting a priority group for dispatch.
    pub worker_parallel_sub_batch: usize,

    /// Maximum number of free buffers retained per size class.
    pub max_pooled_buffers_per_class: usize,
    /// Hard ceiling on any buffer's size.
    pub max_buffer_size: u32,
    /// A buffer is expired once idle for at least this long.
    pub buffer_idle_expire: Duration,
    /// Interval between `ResourcePool::cleanup_expired` sweeps.
    pub cleanup_interval: Duration,

    /// Ceiling on processor invocations before a terminal recovery state.
    pub max_recovery_attempts: u32,
    /// Base backoff delay before a retry is eligible.
    pub recovery_delay: Duration,
    /// How long the circuit breaker stays open once tripped.
    pub circuit_breaker_cooldown: Duration,
    /// Consecutive failures required to open the breaker.
    pub consecutive_failures_to_open: u32,
    /// Ring-buffer capacity for `ErrorRecord`s.
    pub error_history_cap: usize,

    /// Fixed size of the dedicated OS thread pool.
    pub dedicated_pool_size: usize,
    /// Hard wall-clock deadline for any single processor invocation.
    pub operation_deadline: Duration,

    /// Interval between `ProgressTracker` snapshot ticks.
    pub progress_interval: Duration,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        let logical_cpus = num_cpus::get();
        Self {
            queue_capacity: 1024,
            batch_max: 32,
            worker_parallel_sub_batch: 5,

            max_pooled_buffers_per_class: 100,
            max_buffer_size: 64 * 1024,
            buffer_idle_expire: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),

            max_recovery_attempts: 3,
            recovery_delay: Duration::from_millis(100),
            circuit_breaker_cooldown: Duration::from_secs(30),
            consecutive_failures_to_open: 3,
            error_history_cap: 1000,

            dedicated_pool_size: (logical_cpus * 2).max(4),
            operation_deadline: Duration::from_secs(5 * 60),

            progress_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_enumerated_configuration() {
        let config = IsolationConfig::default();
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.batch_max, 32);
        assert_eq!(config.worker_parallel_sub_batch, 5);
        assert_eq!(config.max_pooled_buffers_per_class, 100);
        assert_eq!(config.max_buffer_size, 64 * 1024);
        assert_eq!(config.buffer_idle_expire, Duration::from_secs(5 * 60));
        assert_eq!(config.max_recovery_attempts, 3);
        assert_eq!(config.recovery_delay, Duration::from_millis(100));
        assert_eq!(config.circuit_breaker_cooldown, Duration::from_secs(30));
        assert_eq!(config.consecutive_failures_to_open, 3);
        assert_eq!(config.error_history_cap, 1000);
        assert!(config.dedicated_pool_size >= 4);
        assert_eq!(config.operation_deadline, Duration::from_secs(5 * 60));
        assert_eq!(config.progress_interval, Duration::from_millis(100));
    }

    #[test]
    fn cloning_config_and_overriding_a_field_leaves_the_original_defaults_intact() {
        let config = IsolationConfig::default();
        let mut overridden = config.clone();
        overridden.queue_capacity = 2048;
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(overridden.queue_capacity, 2048);
    }
}

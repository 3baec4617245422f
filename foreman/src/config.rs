//! Engine configuration.
//!
//! All knobs have working defaults; an `EngineConfig::default()` engine
//! schedules in UTC, captures output in memory, and runs interpreter
//! targets with `python3`.

use std::time::Duration;

use chrono_tz::Tz;

use crate::sink::OutputPolicy;

/// Default bound on concurrently executing pooled thread runs.
pub const DEFAULT_THREAD_POOL_WORKERS: usize = 32;
/// Default bound on concurrently executing pooled process runs.
pub const DEFAULT_PROCESS_POOL_WORKERS: usize = 8;
/// Default grace between SIGTERM and SIGKILL for graceful stops.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default per-subscriber event queue bound.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
/// Default number of terminal runs retained per job.
pub const DEFAULT_MAX_RECENT_RUNS: usize = 64;
/// Default interpreter for module and script targets.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Tunable parameters for an [`Engine`](crate::engine::Engine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Time zone cron expressions are evaluated in.
    pub timezone: Tz,
    pub thread_pool_workers: usize,
    pub process_pool_workers: usize,
    /// Output policy for jobs that do not specify their own.
    pub default_output: OutputPolicy,
    /// Interpreter program for module and script targets.
    pub interpreter: String,
    /// SIGTERM-to-SIGKILL escalation delay for graceful stops and the
    /// shutdown sweep.
    pub stop_grace_period: Duration,
    pub event_queue_capacity: usize,
    /// Terminal runs retained per job before the oldest are evicted.
    pub max_recent_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            thread_pool_workers: DEFAULT_THREAD_POOL_WORKERS,
            process_pool_workers: DEFAULT_PROCESS_POOL_WORKERS,
            default_output: OutputPolicy::default(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            max_recent_runs: DEFAULT_MAX_RECENT_RUNS,
        }
    }
}

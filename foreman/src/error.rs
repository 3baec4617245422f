//! Error types for the foreman engine.
//!
//! The taxonomy separates failures that reject an operation up front
//! (resolution, schedule validation) from failures that are recorded on a
//! run (execution errors). A failure local to one job or run never
//! propagates into the scheduler loop.

use crate::run::RunId;

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A target descriptor could not be resolved into something invocable.
    ///
    /// Raised at job creation when resolution is immediate; deferred
    /// resolution failures are recorded on the run instead (the run is
    /// created directly in the `Failed` state).
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A schedule was malformed (bad cron expression, zero interval).
    ///
    /// Always rejected at creation time, never silently defaulted.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// A run finished with a non-zero exit code or a raised error.
    ///
    /// This variant is only recorded on the run; it is never returned
    /// from control-facade calls.
    #[error("execution error: {0}")]
    Execution(String),

    /// The engine is running its shutdown sweep; no new work is accepted.
    #[error("engine shutdown in progress")]
    ShutdownInProgress,

    /// No job with the given id.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// No run with the given id.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Underlying I/O failure (sink file creation, log setup).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

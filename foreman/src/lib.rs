//! foreman — an embedded job orchestration engine.
//!
//! foreman runs *jobs* (a target plus a schedule plus a concurrency
//! policy) on thread and process substrates, captures their output
//! incrementally, and exposes everything that happens as a typed event
//! stream.
//!
//! # Quick start
//!
//! ```no_run
//! use foreman::{Engine, EngineConfig, JobOptions, ConcurrencyPolicy, TargetSpec, Schedule};
//!
//! # async fn demo() -> foreman::Result<()> {
//! let engine = Engine::new(EngineConfig::default());
//!
//! // Ad-hoc run: fire a command now, wait for it, read its output.
//! let (_, run_id) = engine.run_job(
//!     TargetSpec::command("echo hello"),
//!     JobOptions::new(ConcurrencyPolicy::Overlap),
//! )?;
//! engine.wait_run(run_id, None).await?;
//! let out = engine.get_output_text(run_id, foreman::ReadMode::Full)?;
//! assert_eq!(out, "hello\n");
//!
//! // Recurring job: every 30 seconds, skipping ticks while one runs.
//! engine.add_job(
//!     TargetSpec::command("sync-inventory.py"),
//!     Schedule::interval(std::time::Duration::from_secs(30))?,
//!     JobOptions::new(ConcurrencyPolicy::Skip).named("inventory sync"),
//! )?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`engine`] — the facade and the single scheduler loop that owns all
//!   fire timing
//! - [`target`] — target resolution: commands, modules, scripts, and
//!   registered in-process callables
//! - [`schedule`] — timing policies and next-fire computation
//! - [`backend`] — thread and process execution substrates
//! - [`sink`] — per-run output capture and live streaming
//! - [`events`] — the topic-filtered event bus
//! - [`guard`] — orphan prevention for spawned processes
//! - [`snapshot`] — the persistence seam

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod logging;
pub mod registry;
pub mod run;
pub mod schedule;
pub mod sink;
pub mod snapshot;
pub mod target;

pub use backend::context::RunContext;
pub use config::EngineConfig;
pub use engine::job::{Job, JobId, JobOptions, JobState};
pub use engine::{Engine, JobFilter, WaitOutcome};
pub use error::{Error, Result};
pub use events::{EngineEvent, EventSubscription, Topic};
pub use run::{Run, RunId, RunOutcome, RunState};
pub use schedule::{ConcurrencyPolicy, Schedule};
pub use sink::{
    OutputChunk, OutputGranularity, OutputPolicy, OutputSubscription, ReadMode, SinkMode,
    StreamKind,
};
pub use snapshot::{JobSnapshot, JsonlSnapshotSink, NullSnapshotSink, RunSnapshot, SnapshotSink};
pub use target::{ArgsMode, CallableRegistry, Descriptor, Substrate, Target, TargetSpec};

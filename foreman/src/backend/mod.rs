//! Execution backends.
//!
//! The dispatcher routes each run to its substrate: dedicated runs start
//! immediately, pooled runs first acquire a slot from the matching
//! bounded pool. Every path ends in exactly one terminal transition
//! reported back through the shared completion channel.

pub mod context;
mod pool;
mod process;
mod thread;

use std::sync::Arc;

use context::OutputWriter;
use pool::WorkerPool;

use crate::engine::job::JobId;
use crate::engine::EngineShared;
use crate::run::{Run, RunId};
use crate::target::Substrate;

/// Notification that a run reached a terminal state, consumed by the
/// scheduler loop to advance queues and exhaust one-shot jobs.
#[derive(Clone, Debug)]
pub(crate) struct RunCompletion {
    pub job_id: JobId,
    pub run_id: RunId,
}

/// Routes runs onto their execution substrate.
pub(crate) struct Backends {
    shared: Arc<EngineShared>,
    thread_pool: WorkerPool,
    process_pool: WorkerPool,
    interpreter: String,
}

impl Backends {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        let thread_pool = WorkerPool::new("thread", shared.config.thread_pool_workers);
        let process_pool = WorkerPool::new("process", shared.config.process_pool_workers);
        let interpreter = shared.config.interpreter.clone();
        Self {
            shared,
            thread_pool,
            process_pool,
            interpreter,
        }
    }

    /// Dispatches a run onto its substrate and returns immediately. The
    /// spawned task drives the run to a terminal state; a run killed or
    /// failed while still pending is left alone (its finalizer already
    /// reported completion).
    pub(crate) fn dispatch(self: &Arc<Self>, run: Arc<Run>) {
        let backends = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match run.substrate() {
                Substrate::ThreadPooled => Some(backends.thread_pool.admit().await),
                Substrate::ProcessPooled => Some(backends.process_pool.admit().await),
                Substrate::ThreadDedicated | Substrate::ProcessDedicated => None,
            };

            if !backends.shared.start_run(&run) {
                return;
            }
            // A kill can land between the pending check and the state
            // transition; honor it before spawning anything.
            if run.kill_requested() {
                backends.shared.finalize_run(
                    &run,
                    crate::run::RunState::Killed,
                    crate::run::RunOutcome {
                        exit_code: None,
                        error: Some("killed before dispatch".to_string()),
                    },
                );
                return;
            }

            let writer = OutputWriter::new(
                run.job_id().clone(),
                run.id(),
                Arc::clone(run.sink()),
                Arc::clone(&backends.shared.bus),
            );
            if run.substrate().is_process() {
                process::execute(&backends.shared, &backends.interpreter, &run, writer).await;
            } else {
                thread::execute(&backends.shared, &run, writer).await;
            }
        });
    }
}

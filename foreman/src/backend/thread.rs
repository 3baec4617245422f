//! In-process (blocking thread) execution backend.
//!
//! Callables run on tokio's blocking-thread pool, wrapped in
//! `catch_unwind` so a panicking callable fails its own run and nothing
//! else. Cancellation is cooperative: the callable observes
//! [`RunContext::is_cancelled`] and returns; a callable that never checks
//! cannot be preempted.
//!
//! [`RunContext::is_cancelled`]: super::context::RunContext::is_cancelled

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::context::{OutputWriter, RunContext};
use crate::engine::EngineShared;
use crate::run::{Run, RunOutcome, RunState};

/// Runs a thread-backed target to its terminal state.
pub(crate) async fn execute(shared: &Arc<EngineShared>, run: &Arc<Run>, writer: OutputWriter) {
    let callable = match run.descriptor().resolve_callable(&shared.callables) {
        Ok(callable) => callable,
        Err(err) => {
            shared.finalize_run(run, RunState::Failed, RunOutcome {
                exit_code: None,
                error: Some(err.to_string()),
            });
            return;
        }
    };

    let descriptor = Arc::clone(run.descriptor());
    let context = RunContext::new(
        descriptor.args.clone(),
        descriptor.kwargs.clone(),
        run.cancel_token().clone(),
        writer,
    );

    let joined = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(AssertUnwindSafe(|| callable(&context)))
    })
    .await;

    let (state, outcome) = match joined {
        Ok(Ok(Ok(()))) => {
            if run.kill_requested() {
                // The callable observed cancellation and returned.
                (RunState::Killed, RunOutcome::default())
            } else {
                (RunState::Succeeded, RunOutcome {
                    exit_code: None,
                    error: None,
                })
            }
        }
        Ok(Ok(Err(err))) => {
            if run.kill_requested() {
                (RunState::Killed, RunOutcome {
                    exit_code: None,
                    error: Some(err.to_string()),
                })
            } else {
                (RunState::Failed, RunOutcome {
                    exit_code: None,
                    error: Some(err.to_string()),
                })
            }
        }
        Ok(Err(panic)) => (RunState::Failed, RunOutcome {
            exit_code: None,
            error: Some(format!("callable panicked: {}", panic_message(&panic))),
        }),
        Err(err) => (RunState::Failed, RunOutcome {
            exit_code: None,
            error: Some(format!("worker join failed: {err}")),
        }),
    };
    shared.finalize_run(run, state, outcome);
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

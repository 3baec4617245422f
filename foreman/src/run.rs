//! Run lifecycle state.
//!
//! A [`Run`] is one execution attempt of a job. Its state machine is
//! `Pending -> Running -> {Succeeded | Failed | Killed}`; terminal states
//! never transition again. The transition into a terminal state is atomic
//! with a single winner, so a kill racing a natural completion records
//! exactly one outcome.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::engine::job::JobId;
use crate::sink::OutputSink;
use crate::target::{Descriptor, Substrate};

/// Globally unique, monotonically increasing run identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next run id. Ids increase monotonically across the whole
/// process, so run ordering within a job follows id ordering.
pub(crate) fn next_run_id() -> RunId {
    RunId(NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed))
}

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created but not yet dispatched (queued behind a prior run, or
    /// waiting for a pool permit).
    Pending,
    /// Dispatched to a backend and executing.
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl RunState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Final result recorded when a run reaches a terminal state.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunOutcome {
    /// Process exit code, when the run executed as a process and exited.
    pub exit_code: Option<i32>,
    /// Error detail for failed runs (non-zero exit, raised error,
    /// resolution failure, panic).
    pub error: Option<String>,
}

/// Timestamps recorded over a run's lifetime.
#[derive(Clone, Debug, Default)]
pub struct RunTimes {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution attempt of a job.
pub struct Run {
    id: RunId,
    job_id: JobId,
    /// The scheduled fire time that produced this run.
    trigger_time: DateTime<Utc>,
    created_at: DateTime<Utc>,
    substrate: Substrate,
    descriptor: Arc<Descriptor>,
    state_tx: watch::Sender<RunState>,
    state_rx: watch::Receiver<RunState>,
    times: Mutex<RunTimes>,
    outcome: Mutex<Option<RunOutcome>>,
    cancel: CancellationToken,
    kill_requested: AtomicBool,
    sink: Arc<OutputSink>,
}

impl Run {
    pub(crate) fn new(
        job_id: JobId,
        trigger_time: DateTime<Utc>,
        descriptor: Arc<Descriptor>,
        substrate: Substrate,
        sink: Arc<OutputSink>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(RunState::Pending);
        Self {
            id: next_run_id(),
            job_id,
            trigger_time,
            created_at: Utc::now(),
            substrate,
            descriptor,
            state_tx,
            state_rx,
            times: Mutex::new(RunTimes::default()),
            outcome: Mutex::new(None),
            cancel: CancellationToken::new(),
            kill_requested: AtomicBool::new(false),
            sink,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn trigger_time(&self) -> DateTime<Utc> {
        self.trigger_time
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn substrate(&self) -> Substrate {
        self.substrate
    }

    pub fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    /// Watch channel for state transitions. Waiters see every terminal
    /// transition because terminal states are set exactly once.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    pub fn times(&self) -> RunTimes {
        self.times.lock().expect("run times lock poisoned").clone()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
            .lock()
            .expect("run outcome lock poisoned")
            .clone()
    }

    pub fn sink(&self) -> &Arc<OutputSink> {
        &self.sink
    }

    /// Token observed by backends for cooperative cancellation.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Flags that a kill was requested, so a subsequent natural exit is
    /// recorded as `Killed` rather than `Failed`. Returns whether this
    /// call was the first request.
    pub(crate) fn request_kill(&self) -> bool {
        let first = !self.kill_requested.swap(true, Ordering::AcqRel);
        if first {
            self.cancel.cancel();
        }
        first
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    /// Marks the run as dispatched. Returns false if the run already left
    /// `Pending` (e.g. failed or killed while queued).
    pub(crate) fn begin(&self) -> bool {
        let mut transitioned = false;
        self.state_tx.send_if_modified(|state| {
            if *state == RunState::Pending {
                *state = RunState::Running;
                transitioned = true;
                true
            } else {
                false
            }
        });
        if transitioned {
            self.times
                .lock()
                .expect("run times lock poisoned")
                .started_at = Some(Utc::now());
        }
        transitioned
    }

    /// Records the terminal state and outcome. Exactly one caller wins;
    /// later calls are ignored. Returns whether this call performed the
    /// transition.
    pub(crate) fn finish(&self, state: RunState, outcome: RunOutcome) -> bool {
        debug_assert!(state.is_terminal());
        let mut outcome = Some(outcome);
        let transitioned = self.state_tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            // Outcome and end time are recorded before the terminal state
            // becomes visible: a waiter that observes a terminal state
            // always sees the complete record.
            self.times
                .lock()
                .expect("run times lock poisoned")
                .finished_at = Some(Utc::now());
            *self.outcome.lock().expect("run outcome lock poisoned") = outcome.take();
            *current = state;
            true
        });
        if transitioned {
            self.sink.close();
        }
        transitioned
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("state", &self.state())
            .field("substrate", &self.substrate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::OutputPolicy;
    use crate::target::TargetSpec;

    fn test_run() -> Run {
        let descriptor = Descriptor::resolve(TargetSpec::command("echo hi")).unwrap();
        Run::new(
            JobId::from("job-1"),
            Utc::now(),
            Arc::new(descriptor),
            Substrate::ProcessDedicated,
            Arc::new(OutputSink::new(OutputPolicy::default()).unwrap()),
        )
    }

    #[test]
    fn test_run_ids_are_monotonic() {
        let a = next_run_id();
        let b = next_run_id();
        assert!(b > a);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let run = test_run();
        assert_eq!(run.state(), RunState::Pending);
        assert!(run.times().started_at.is_none());

        assert!(run.begin());
        assert_eq!(run.state(), RunState::Running);
        assert!(run.times().started_at.is_some());
        assert!(!run.begin());

        assert!(run.finish(RunState::Succeeded, RunOutcome {
            exit_code: Some(0),
            error: None,
        }));
        assert_eq!(run.state(), RunState::Succeeded);
        assert!(run.times().finished_at.is_some());
        assert_eq!(run.outcome().unwrap().exit_code, Some(0));
    }

    #[test]
    fn test_terminal_transition_has_single_winner() {
        let run = test_run();
        run.begin();

        assert!(run.finish(RunState::Killed, RunOutcome::default()));
        // The losing transition must not overwrite state or outcome.
        assert!(!run.finish(RunState::Succeeded, RunOutcome {
            exit_code: Some(0),
            error: None,
        }));
        assert_eq!(run.state(), RunState::Killed);
        assert_eq!(run.outcome().unwrap().exit_code, None);
    }

    #[test]
    fn test_pending_run_can_fail_without_starting() {
        let run = test_run();
        assert!(run.finish(RunState::Failed, RunOutcome {
            exit_code: None,
            error: Some("unresolvable".into()),
        }));
        assert!(!run.begin());
        assert_eq!(run.state(), RunState::Failed);
    }

    #[test]
    fn test_kill_request_is_idempotent_and_cancels() {
        let run = test_run();
        assert!(run.request_kill());
        assert!(!run.request_kill());
        assert!(run.kill_requested());
        assert!(run.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_terminal_state_implies_complete_record() {
        let run = Arc::new(test_run());
        let mut rx = run.watch_state();

        let waiter = {
            let run = Arc::clone(&run);
            tokio::spawn(async move {
                loop {
                    if rx.borrow_and_update().is_terminal() {
                        break;
                    }
                    rx.changed().await.unwrap();
                }
                // Waking on the terminal transition must find outcome and
                // end time already recorded.
                assert!(run.outcome().is_some());
                assert!(run.times().finished_at.is_some());
            })
        };

        run.begin();
        run.finish(RunState::Succeeded, RunOutcome {
            exit_code: Some(0),
            error: None,
        });
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_observes_terminal_state() {
        let run = test_run();
        let mut rx = run.watch_state();
        run.begin();
        run.finish(RunState::Succeeded, RunOutcome::default());

        // The watch holds the latest value; a waiter polling changed()
        // then reading sees the terminal state.
        rx.changed().await.unwrap();
        let mut latest = *rx.borrow_and_update();
        while !latest.is_terminal() {
            rx.changed().await.unwrap();
            latest = *rx.borrow_and_update();
        }
        assert_eq!(latest, RunState::Succeeded);
    }
}
